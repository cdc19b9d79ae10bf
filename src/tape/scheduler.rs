//! Operation lifecycle: a trace-addressable registry of running and
//! completed operations with single-flight scheduling per drive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use qsl_api_types::{LibraryOperationStatus, Operation, OperationLogEntry};

use crate::tools::command::AbortFlag;
use crate::tools::epoch_millis;

use super::{OPERATION_RETENTION, TRACE_POLL_INTERVAL_SECS, WAIT_BEFORE_NEXT_SECS};

/// Reserved single-flight key for robot-only operations (transfer).
pub const CHANGER_TASK_KEY: u64 = u64::MAX;
/// Reserved single-flight key for whole-library operations (release).
pub const LIBRARY_TASK_KEY: u64 = u64::MAX - 1;

#[derive(Clone, Debug)]
/// Result of an operation body.
pub struct OperationOutcome {
    pub status: LibraryOperationStatus,
    pub message: Option<String>,
    /// Advisory pause before the caller's next operation (seconds)
    pub wait_before_next: Option<u64>,
}

impl OperationOutcome {
    pub fn new(status: LibraryOperationStatus) -> Self {
        Self {
            status,
            message: None,
            wait_before_next: None,
        }
    }

    pub fn with_message<S: Into<String>>(status: LibraryOperationStatus, message: S) -> Self {
        Self {
            status,
            message: Some(message.into()),
            wait_before_next: None,
        }
    }

    /// Busy reply with the standard retry advisory.
    pub fn busy<S: Into<String>>(status: LibraryOperationStatus, message: S) -> Self {
        Self {
            status,
            message: Some(message.into()),
            wait_before_next: Some(WAIT_BEFORE_NEXT_SECS),
        }
    }
}

/// A registered operation with live log buffer and completion signal.
pub struct ActiveOperation {
    data: Mutex<Operation>,
    trace_id: String,
    abort: AbortFlag,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ActiveOperation {
    pub fn new() -> Arc<Self> {
        let mut operation = Operation::new();
        operation.wait_before_next_trace = Some(TRACE_POLL_INTERVAL_SECS);
        Self::with_operation(operation)
    }

    /// Wraps an existing operation (busy replies arrive pre-finished).
    pub fn with_operation(operation: Operation) -> Arc<Self> {
        let trace_id = operation.trace_id.to_string();
        let (done_tx, done_rx) = watch::channel(operation.is_finished());
        Arc::new(Self {
            data: Mutex::new(operation),
            trace_id,
            abort: AbortFlag::new(),
            done_tx,
            done_rx,
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    pub fn is_finished(&self) -> bool {
        self.data.lock().unwrap().is_finished()
    }

    pub fn snapshot(&self) -> Operation {
        self.data.lock().unwrap().clone()
    }

    /// Snapshot with the log filtered to entries after `since` (epoch
    /// milliseconds).
    pub fn snapshot_since(&self, since: i64) -> Operation {
        let mut operation = self.snapshot();
        operation.logs.retain(|entry| entry.time > since);
        operation
    }

    pub fn append_log(&self, message: &str) {
        let mut data = self.data.lock().unwrap();
        data.logs.push(OperationLogEntry {
            time: epoch_millis(),
            message: message.to_string(),
        });
    }

    /// Marks the operation terminal and wakes up waiting callers.
    pub fn finish(&self, outcome: &OperationOutcome) {
        {
            let mut data = self.data.lock().unwrap();
            data.status = outcome.status;
            data.message = outcome.message.clone();
            data.ended_at = Some(proxmox_time::epoch_i64());
            data.wait_before_next_operation = outcome.wait_before_next;
        }
        let _ = self.done_tx.send(true);
    }

    /// Waits for completion up to the given window; returns whether the
    /// operation is terminal.
    pub async fn wait_finished(&self, window: Duration) -> bool {
        let mut done = self.done_rx.clone();
        let wait = async move {
            loop {
                if *done.borrow_and_update() {
                    return;
                }
                if done.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(window, wait).await.is_ok() || self.is_finished()
    }
}

#[derive(Default)]
/// Process-wide map of operations, keyed by trace id.
pub struct OperationRegistry {
    operations: Mutex<HashMap<String, Arc<ActiveOperation>>>,
    running: Mutex<HashMap<u64, Arc<ActiveOperation>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the single-flight slot for a drive. Returns false while a
    /// previous task on the same slot is still running.
    pub fn try_begin(&self, key: u64, operation: &Arc<ActiveOperation>) -> bool {
        let mut running = self.running.lock().unwrap();
        if let Some(current) = running.get(&key) {
            if !current.is_finished() {
                return false;
            }
        }
        running.insert(key, Arc::clone(operation));
        true
    }

    pub fn register(&self, operation: Arc<ActiveOperation>) {
        self.operations
            .lock()
            .unwrap()
            .insert(operation.trace_id().to_string(), operation);
    }

    /// Looks up an operation, evicting terminal entries past the
    /// retention window first.
    pub fn lookup(&self, trace_id: &str) -> Option<Arc<ActiveOperation>> {
        let cutoff = proxmox_time::epoch_i64() - OPERATION_RETENTION.as_secs() as i64;
        let mut operations = self.operations.lock().unwrap();
        operations.retain(|_, operation| {
            let data = operation.snapshot();
            match data.ended_at {
                Some(ended_at) if data.is_finished() => ended_at > cutoff,
                _ => true,
            }
        });
        operations.get(trace_id).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_single_flight() {
        let registry = OperationRegistry::new();

        let first = ActiveOperation::new();
        assert!(registry.try_begin(1, &first));
        registry.register(first.clone());

        let second = ActiveOperation::new();
        assert!(!registry.try_begin(1, &second));
        // a different drive is unaffected
        assert!(registry.try_begin(2, &second));

        first.finish(&OperationOutcome::new(LibraryOperationStatus::Succeeded));
        let third = ActiveOperation::new();
        assert!(registry.try_begin(1, &third));
    }

    #[test]
    fn test_retention_eviction() {
        let registry = OperationRegistry::new();

        let mut stale = Operation::finished(LibraryOperationStatus::Succeeded, "done");
        stale.ended_at = Some(proxmox_time::epoch_i64() - 61 * 60);
        let trace_id = stale.trace_id.to_string();
        registry.register(ActiveOperation::with_operation(stale));

        let fresh = ActiveOperation::new();
        let fresh_id = fresh.trace_id().to_string();
        registry.register(fresh);

        assert!(registry.lookup(&trace_id).is_none());
        assert!(registry.lookup(&fresh_id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_finished() {
        let operation = ActiveOperation::new();
        assert!(!operation.wait_finished(Duration::from_millis(100)).await);

        let waiter = operation.clone();
        let handle = tokio::spawn(async move { waiter.wait_finished(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        operation.finish(&OperationOutcome::new(LibraryOperationStatus::NoAction));
        assert!(handle.await.unwrap());
    }
}
