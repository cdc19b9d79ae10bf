//! Handlers behind the `/library` HTTP surface.

use std::sync::Arc;

use serde_json::{json, Value};

use qsl_api_types::Operation;

use crate::tape::Library;
use crate::tools::command::AbortFlag;

/// Refreshes the model, logging instead of failing: snapshot endpoints
/// always answer with the current model.
async fn refresh(library: &Arc<Library>, force: bool) {
    let abort = AbortFlag::new();
    if let Err(err) = library.collect_status(force, &abort).await {
        log::warn!("status refresh failed - {}", err);
    }
}

/// Initialization plus readiness check.
pub async fn verify(library: &Arc<Library>) -> bool {
    library.verify(&AbortFlag::new()).await
}

/// Combined snapshot of drives and slots.
pub async fn library_data(library: &Arc<Library>, force: bool) -> Value {
    refresh(library, force).await;
    json!({
        "drives": library.snapshot_drives(),
        "slots": library.snapshot_slots(),
    })
}

pub async fn drives(library: &Arc<Library>, force: bool) -> Value {
    refresh(library, force).await;
    json!(library.snapshot_drives())
}

pub async fn tapes(library: &Arc<Library>, force: bool) -> Value {
    refresh(library, force).await;
    json!(library.snapshot_media())
}

pub async fn slots(library: &Arc<Library>, force: bool) -> Value {
    refresh(library, force).await;
    json!(library.snapshot_slots())
}

/// Poll an operation by trace id; `since` filters the log entries.
pub fn operation(library: &Arc<Library>, trace_id: &str, since: Option<i64>) -> Option<Operation> {
    library.operation(trace_id, since)
}

/// Self-describing route catalogue.
pub fn help() -> Value {
    json!([
        { "method": "GET", "path": "/library/verify", "description": "initialize the library and report readiness" },
        { "method": "GET", "path": "/library/data[/force]", "description": "snapshot of drives and slots" },
        { "method": "GET", "path": "/library/drives[/force]", "description": "drive snapshot" },
        { "method": "GET", "path": "/library/tapes[/force]", "description": "media snapshot" },
        { "method": "GET", "path": "/library/slots[/force]", "description": "slot snapshot" },
        { "method": "POST", "path": "/library/load/{drive}/{tape}", "description": "load a cartridge into a drive and mount it" },
        { "method": "POST", "path": "/library/unload/{drive}", "description": "unmount a drive and return its cartridge to a slot" },
        { "method": "POST", "path": "/library/mount/{drive}", "description": "mount the cartridge in a drive" },
        { "method": "POST", "path": "/library/unmount/{drive}", "description": "unmount a drive" },
        { "method": "POST", "path": "/library/format/{drive}[/force]", "description": "format the cartridge in a drive" },
        { "method": "POST", "path": "/library/ltfsck/{drive}", "description": "consistency check of the cartridge in a drive" },
        { "method": "POST", "path": "/library/transfer/{tape}/{slot}", "description": "move a cartridge between storage slots" },
        { "method": "POST", "path": "/library/release", "description": "unmount and unload every full drive" },
        { "method": "GET", "path": "/library/operation/{trace_id}[/{ticks}]", "description": "poll an operation; ticks filters older log entries" },
        { "method": "GET", "path": "/library/help", "description": "this catalogue" },
    ])
}
