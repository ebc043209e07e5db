//! Transaction receipts and application status codes.

use serde_json::{Value, json};

/// Why a transaction failed to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnStatus {
    /// No error recorded.
    #[default]
    NotPresent,
    /// Arithmetic over/underflow while computing charges.
    MathError,
    /// Sender account missing or malformed.
    InvalidFromAccount,
    /// Recipient is not what the transaction kind requires.
    InvalidToAccount,
    /// Sender cannot cover amount plus gas deposit.
    InsufficientBalance,
    /// Gas limit below the minimum for this transaction kind.
    InsufficientGasLimit,
    /// Transaction nonce is ahead of the account nonce.
    HigherNonce,
    /// Transaction nonce is behind the account nonce.
    LowerNonce,
    /// Contract execution process call failed.
    FailedToInvokeContract,
    /// Transaction routed to the wrong shard.
    IncorrectShard,
}

/// Outcome of applying one transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionReceipt {
    success: bool,
    cum_gas: u64,
    epoch_num: u64,
    event_logs: Vec<Value>,
    errors: Vec<String>,
}

impl TransactionReceipt {
    pub fn new(epoch_num: u64) -> Self {
        Self {
            epoch_num,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn cum_gas(&self) -> u64 {
        self.cum_gas
    }

    /// Marks the transaction applied, recording the gas consumed.
    pub fn set_result(&mut self, success: bool, cum_gas: u64) {
        self.success = success;
        self.cum_gas = cum_gas;
    }

    /// Appends an event emitted by contract execution.
    pub fn add_event(&mut self, event: Value) {
        self.event_logs.push(event);
    }

    /// Appends an execution error message.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Renders the receipt as its canonical JSON document.
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "cumulative_gas": self.cum_gas,
            "epoch_num": self.epoch_num.to_string(),
            "event_logs": self.event_logs,
            "errors": self.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_receipt_is_unsuccessful() {
        let receipt = TransactionReceipt::new(7);
        assert!(!receipt.success());
        assert_eq!(receipt.cum_gas(), 0);
    }

    #[test]
    fn to_json_layout() {
        let mut receipt = TransactionReceipt::new(7);
        receipt.set_result(true, 50);
        receipt.add_event(json!({"_eventname": "Transfer"}));
        receipt.add_error("late error");

        let doc = receipt.to_json();
        assert_eq!(doc["success"], true);
        assert_eq!(doc["cumulative_gas"], 50);
        assert_eq!(doc["epoch_num"], "7");
        assert_eq!(doc["event_logs"].as_array().unwrap().len(), 1);
        assert_eq!(doc["errors"][0], "late error");
    }
}
