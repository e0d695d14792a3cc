use clap::{Parser, ValueEnum};
use contract_scanner::config::ScannerConfig;
use contract_scanner::controller::RunController;
use contract_scanner::csv::CsvSink;
use contract_scanner::node::{EthersNode, NodeClient};
use contract_scanner::report::RunMode;
use contract_scanner::sink::PersistenceSink;
use contract_scanner::supabase::SupabaseSink;
use ethers::providers::{Http, Provider};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_LOOKBACK: u64 = 1000;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkKind {
    Csv,
    Supabase,
}

/// Scan EVM blocks for contract-creation transactions.
#[derive(Debug, Parser)]
#[command(name = "contract_scanner", version)]
struct Args {
    /// JSON-RPC endpoint of the node.
    #[arg(long, env = "RPC_URL")]
    rpc_url: String,

    /// First block of a fixed range.
    #[arg(long, conflicts_with_all = ["duration_secs", "last"])]
    from: Option<u64>,

    /// Last block of a fixed range (defaults to the chain head).
    #[arg(long, requires = "from")]
    to: Option<u64>,

    /// Scan the most recent N blocks up to the head.
    #[arg(long, conflicts_with = "duration_secs")]
    last: Option<u64>,

    /// Tail the chain head for this many seconds.
    #[arg(long)]
    duration_secs: Option<u64>,

    #[arg(long, value_enum, default_value = "csv")]
    sink: SinkKind,

    /// Directory for CSV output.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    #[arg(long, default_value = "scan_report.json")]
    report: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ScannerConfig::from_env()?;

    let provider = Arc::new(Provider::<Http>::try_from(args.rpc_url.as_str())?);
    let node: Arc<dyn NodeClient> = Arc::new(EthersNode::new(provider));

    let sink: Arc<dyn PersistenceSink> = match args.sink {
        SinkKind::Csv => Arc::new(CsvSink::create(&args.out_dir)?),
        SinkKind::Supabase => Arc::new(SupabaseSink::from_env()?),
    };

    let mode = match (args.duration_secs, args.from) {
        (Some(duration_secs), _) => RunMode::Tail { duration_secs },
        (None, Some(from)) => {
            let to = match args.to {
                Some(to) => to,
                None => node.latest_block_number().await?,
            };
            RunMode::Range { from, to }
        }
        (None, None) => {
            let head = node.latest_block_number().await?;
            let lookback = args.last.unwrap_or(DEFAULT_LOOKBACK);
            RunMode::Range {
                from: head.saturating_sub(lookback),
                to: head,
            }
        }
    };

    let mut controller = RunController::new(config, node, sink)?;
    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing in-flight blocks");
            shutdown.shutdown();
        }
    });

    let report = controller.run(mode).await?;
    report.write_json(&args.report)?;
    info!("Report saved to {}", args.report.display());

    Ok(())
}
