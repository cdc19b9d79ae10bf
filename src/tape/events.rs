//! Engine event streams.

use anyhow::Error;

#[derive(Clone, Debug)]
/// Event published by the engine to registered sinks.
pub enum LibraryEvent {
    /// A drive changed state (lock, load, unload, mount, failure)
    DriveChanged {
        slot_number: u64,
        operation_name: String,
    },
    /// A cartridge was moved successfully
    MediaChanged { volume_tag: String },
    /// A line was appended to an operation log
    OperationLogging {
        trace_id: Option<String>,
        message: String,
    },
}

/// Receives engine events.
///
/// Delivery is fire-and-forget: failures are logged by the engine and
/// never propagate into operations.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &LibraryEvent) -> Result<(), Error>;
}

/// Sink forwarding events to the global logger.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn handle(&self, event: &LibraryEvent) -> Result<(), Error> {
        match event {
            LibraryEvent::DriveChanged {
                slot_number,
                operation_name,
            } => log::info!("drive {} changed: {}", slot_number, operation_name),
            LibraryEvent::MediaChanged { volume_tag } => {
                log::info!("media '{}' moved", volume_tag)
            }
            LibraryEvent::OperationLogging { .. } => { /* already mirrored by the engine */ }
        }
        Ok(())
    }
}
