//! Two-phase contract-creation detection.
//!
//! [`is_creation_candidate`] looks only at the transaction body, so most transactions are
//! settled without touching the node. Candidates are then confirmed against their receipt.

use crate::models::{RawBlock, RawReceipt, RawTransaction, TransactionRecord, TxType};

/// Init-code preambles emitted by solc (`PUSH1 0x80 PUSH1 0x40 MSTORE` and the pre-0.4.22
/// `PUSH1 0x60` variant).
const CREATION_PREFIXES: [&[u8]; 2] = [
    &[0x60, 0x80, 0x60, 0x40, 0x52],
    &[0x60, 0x60, 0x60, 0x40, 0x52],
];

pub fn is_creation_candidate(tx: &RawTransaction) -> bool {
    tx.to.is_none()
        || CREATION_PREFIXES
            .iter()
            .any(|prefix| tx.input.starts_with(prefix))
}

/// Confirms a candidate: a creation needs no recipient and a deployed address in the receipt.
pub fn confirm(tx: &RawTransaction, receipt: &RawReceipt) -> TxType {
    let deployed = receipt
        .contract_address
        .as_deref()
        .is_some_and(|addr| !addr.is_empty());
    if tx.to.is_none() && deployed {
        TxType::ContractCreation
    } else {
        TxType::Other
    }
}

/// Candidates without a receipt resolve to [`TxType::Other`], never to a creation.
pub fn classify(tx: &RawTransaction, receipt: Option<&RawReceipt>) -> TxType {
    if !is_creation_candidate(tx) {
        return TxType::Normal;
    }
    match receipt {
        Some(receipt) => confirm(tx, receipt),
        None => TxType::Other,
    }
}

pub fn classify_transaction(
    block: &RawBlock,
    tx: &RawTransaction,
    receipt: Option<&RawReceipt>,
) -> TransactionRecord {
    let tx_type = classify(tx, receipt);
    // Receipts of non-candidates are never consulted.
    let receipt = receipt.filter(|_| tx_type != TxType::Normal);
    TransactionRecord {
        hash: tx.hash.clone(),
        block_number: block.number,
        timestamp: block.timestamp,
        from: tx.from.clone(),
        to: tx.to.clone(),
        status: receipt.and_then(|r| r.status),
        logs_count: receipt.map(|r| r.logs_count),
        tx_type,
        contract_address: receipt
            .and_then(|r| r.contract_address.clone())
            .filter(|_| tx_type == TxType::ContractCreation),
        gas_used: receipt.and_then(|r| r.gas_used),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TxStatus;

    fn tx(to: Option<&str>, input: &[u8]) -> RawTransaction {
        RawTransaction {
            hash: "0x01".into(),
            from: "0xsender".into(),
            to: to.map(str::to_string),
            input: input.to_vec(),
        }
    }

    fn receipt(status: TxStatus, contract: Option<&str>) -> RawReceipt {
        RawReceipt {
            tx_hash: "0x01".into(),
            status: Some(status),
            contract_address: contract.map(str::to_string),
            gas_used: Some(100_000),
            logs_count: 1,
        }
    }

    #[test]
    fn plain_transfer_is_normal_without_receipt() {
        assert_eq!(classify(&tx(Some("0xdead"), &[]), None), TxType::Normal);
    }

    #[test]
    fn init_code_to_a_factory_is_a_candidate_but_not_a_creation() {
        let factory_call = tx(Some("0xfactory"), &[0x60, 0x80, 0x60, 0x40, 0x52, 0x34]);
        assert!(is_creation_candidate(&factory_call));
        let r = receipt(TxStatus::Success, None);
        assert_eq!(classify(&factory_call, Some(&r)), TxType::Other);
    }

    #[test]
    fn confirmed_deployment() {
        let deploy = tx(None, &[0x60, 0x80]);
        let r = receipt(TxStatus::Success, Some("0xc0ffee"));
        assert_eq!(classify(&deploy, Some(&r)), TxType::ContractCreation);
    }

    #[test]
    fn failed_deployment_is_not_a_creation() {
        let deploy = tx(None, &[0x60, 0x80]);
        let r = receipt(TxStatus::Failed, None);
        assert_eq!(classify(&deploy, Some(&r)), TxType::Other);
        assert_eq!(classify(&deploy, None), TxType::Other);
    }

    #[test]
    fn empty_contract_address_does_not_confirm() {
        let deploy = tx(None, &[]);
        let r = receipt(TxStatus::Success, Some(""));
        assert_eq!(classify(&deploy, Some(&r)), TxType::Other);
    }
}
