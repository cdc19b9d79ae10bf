use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LibraryOperationStatus;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// One timestamped line of an operation log (epoch milliseconds).
pub struct OperationLogEntry {
    pub time: i64,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// A unit of orchestrated work, addressable by trace id.
///
/// An operation starts `Ongoing` and ends in exactly one terminal
/// status. Identity and equality are defined by the trace id.
pub struct Operation {
    pub trace_id: Uuid,
    pub status: LibraryOperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub logs: Vec<OperationLogEntry>,
    /// Epoch seconds
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Advisory pause (seconds) before the caller issues the next operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_before_next_operation: Option<u64>,
    /// Advisory poll interval (seconds) for this trace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_before_next_trace: Option<u64>,
}

impl Operation {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            status: LibraryOperationStatus::Ongoing,
            message: None,
            logs: Vec::new(),
            started_at: proxmox_time::epoch_i64(),
            ended_at: None,
            wait_before_next_operation: None,
            wait_before_next_trace: None,
        }
    }

    /// Creates an operation that is already terminal (busy replies).
    pub fn finished(status: LibraryOperationStatus, message: &str) -> Self {
        let mut operation = Self::new();
        operation.status = status;
        operation.message = Some(message.to_string());
        operation.ended_at = Some(operation.started_at);
        operation
    }

    pub fn is_finished(&self) -> bool {
        !self.status.is_ongoing()
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.trace_id == other.trace_id
    }
}

impl Eq for Operation {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_operation_identity() {
        let first = Operation::new();
        let mut copy = first.clone();
        copy.status = LibraryOperationStatus::Succeeded;
        assert_eq!(first, copy);
        assert_ne!(first, Operation::new());
    }
}
