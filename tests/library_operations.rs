//! End-to-end engine scenarios driven by scripted tool output.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;

use qsl_api_types::{LibraryOperationStatus, LtfsStatus, Operation, TapeLibraryConfig};
use qualstar_library::tape::events::{EventSink, LibraryEvent};
use qualstar_library::tape::lock::{LocalLocker, Locker};
use qualstar_library::tape::ltfs::LinuxLtfs;
use qualstar_library::tape::repository::NullRepository;
use qualstar_library::tape::Library;
use qualstar_library::tools::command::{AbortFlag, ScriptedCommandRunner};

const DF_ARGS: &[&str] = &["-h", "--output=source,size,avail,target"];

const DF_NOT_MOUNTED: &str = "\
Filesystem     Size  Avail Mounted on
/dev/sda1       50G    20G /
";

const DEVICE_LIST: &str = "\
Device Name = /dev/sg1 (1.0.0.0), Vendor ID = IBM, Product ID = ULT3580-TD7, Serial Number = 1068002288
";

const SG_LIST: &str = "\
total 0
lrwxrwxrwx 1 root root 9 Aug  1 10:02 Changer-QUALSTAR_RLS8560 -> ../../sg2
lrwxrwxrwx 1 root root 9 Aug  1 10:02 Tape-ULT3580-TD7_1068002288 -> /dev/sg1
";

const MTX_TAPE_IN_SLOT: &str = "\
  Storage Changer /dev/sg2:1 Drives, 12 Slots ( 1 Import/Export )
Data Transfer Element 1:Empty
      Storage Element 1:Empty
      Storage Element 10:Full :VolumeTag=000063L7
      Storage Element 11 IMPORT/EXPORT:Empty
      Storage Element 12:Empty
";

const MTX_TAPE_IN_DRIVE: &str = "\
  Storage Changer /dev/sg2:1 Drives, 12 Slots ( 1 Import/Export )
Data Transfer Element 1:Full (Storage Element 10 Loaded):VolumeTag = 000063L7
      Storage Element 1:Empty
      Storage Element 10:Empty
      Storage Element 11 IMPORT/EXPORT:Empty
      Storage Element 12:Empty
";

const MTX_TAPE_IN_SLOT_12: &str = "\
  Storage Changer /dev/sg2:1 Drives, 12 Slots ( 1 Import/Export )
Data Transfer Element 1:Empty
      Storage Element 1:Empty
      Storage Element 10:Empty
      Storage Element 11 IMPORT/EXPORT:Empty
      Storage Element 12:Full :VolumeTag=000063L7
";

fn mount_base() -> String {
    std::env::temp_dir()
        .join("qualstar-library-tests")
        .to_string_lossy()
        .into_owned()
}

fn mount_dir() -> String {
    format!("{}/drive1", mount_base())
}

fn df_mounted() -> String {
    format!(
        "Filesystem     Size  Avail Mounted on\nltfs:/dev/sg1  2.2T   1.9T {}\n",
        mount_dir()
    )
}

fn test_config() -> TapeLibraryConfig {
    serde_json::from_value(serde_json::json!({
        "mount-point": mount_base(),
        "drives": [ { "slot-number": 1, "address": "1.0.0.0" } ],
    }))
    .unwrap()
}

struct CaptureSink(Arc<Mutex<Vec<String>>>);

impl EventSink for CaptureSink {
    fn handle(&self, event: &LibraryEvent) -> Result<(), Error> {
        let rendered = match event {
            LibraryEvent::DriveChanged {
                slot_number,
                operation_name,
            } => format!("drive:{}:{}", slot_number, operation_name),
            LibraryEvent::MediaChanged { volume_tag } => format!("media:{}", volume_tag),
            LibraryEvent::OperationLogging { .. } => return Ok(()),
        };
        self.0.lock().unwrap().push(rendered);
        Ok(())
    }
}

struct TestBench {
    library: Arc<Library>,
    runner: Arc<ScriptedCommandRunner>,
    locker: Arc<LocalLocker>,
    events: Arc<Mutex<Vec<String>>>,
}

/// Builds an initialized engine whose first status scan returns the
/// given `mtx status` fixture.
async fn init_bench(mtx_fixture: &str) -> TestBench {
    let runner = Arc::new(ScriptedCommandRunner::new());
    runner.expect("df", DF_ARGS, 0, DF_NOT_MOUNTED);
    runner.expect("ltfs", &["-o", "device_list"], 0, DEVICE_LIST);
    runner.expect("ls", &["/dev/sg", "-l"], 0, SG_LIST);
    runner.expect("mtx", &["-f", "/dev/sg2", "status"], 0, mtx_fixture);

    let locker = Arc::new(LocalLocker::new());
    let library = Library::new(
        test_config(),
        runner.clone(),
        locker.clone(),
        Arc::new(NullRepository),
        Box::new(LinuxLtfs),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    library.add_event_sink(Box::new(CaptureSink(events.clone())));

    library.initialize(&AbortFlag::new()).await.unwrap();
    assert_eq!(runner.remaining(), 0);

    TestBench {
        library,
        runner,
        locker,
        events,
    }
}

async fn wait_terminal(library: &Arc<Library>, operation: &Operation) -> Operation {
    if operation.is_finished() {
        return operation.clone();
    }
    let trace_id = operation.trace_id.to_string();
    for _ in 0..1000 {
        if let Some(snapshot) = library.operation(&trace_id, None) {
            if snapshot.is_finished() {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("operation did not finish");
}

#[tokio::test(start_paused = true)]
async fn test_load_and_mount() {
    let bench = init_bench(MTX_TAPE_IN_SLOT).await;

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_SLOT);
    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "load", "10", "1"], 0, "");
    bench.runner.expect("df", DF_ARGS, 0, DF_NOT_MOUNTED);
    bench.runner.expect(
        "ltfs",
        &["-o", "devname=/dev/sg1", mount_dir().as_str()],
        0,
        "4142d000 LTFS11031I Volume mounted successfully.\n",
    );
    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());

    let operation = bench.library.load("000063L7".to_string(), 1).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert_eq!(operation.status, LibraryOperationStatus::LTFS11031I);
    assert_eq!(bench.runner.remaining(), 0);

    // the model shows the tape in the drive and nowhere else
    let drive = bench.library.find_drive(1).unwrap();
    let media = drive.loaded_media.as_ref().unwrap();
    assert_eq!(media.volume_tag, "000063L7");
    assert_eq!(media.capacity, Some((2.2 * (1u64 << 40) as f64) as u64));
    assert_eq!(drive.status, LtfsStatus::LtfsMedia);
    assert!(drive.is_assigned());
    assert!(bench
        .library
        .snapshot_slots()
        .iter()
        .all(|slot| slot.volume_tag() != Some("000063L7")));

    let events = bench.events.lock().unwrap();
    assert!(events.contains(&"media:000063L7".to_string()));
    assert!(events.contains(&"drive:1:Load".to_string()));
    assert!(events.contains(&"drive:1:Mount".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_load_same_tape_skips_robot() {
    let bench = init_bench(MTX_TAPE_IN_DRIVE).await;

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_DRIVE);
    // already mounted, so the mount shortcuts through df
    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());

    let operation = bench.library.load("000063L7".to_string(), 1).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert!(matches!(
        operation.status,
        LibraryOperationStatus::Succeeded | LibraryOperationStatus::LTFS11031I
    ));
    assert_eq!(bench.runner.remaining(), 0);
    assert!(bench
        .runner
        .invocations()
        .iter()
        .all(|spec| !spec.args.contains(&"load".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_same_drive() {
    let bench = init_bench(MTX_TAPE_IN_SLOT).await;

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_SLOT);
    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "load", "10", "1"], 0, "");
    bench.runner.expect("df", DF_ARGS, 0, DF_NOT_MOUNTED);
    bench.runner.expect(
        "ltfs",
        &["-o", "devname=/dev/sg1", mount_dir().as_str()],
        0,
        "LTFS11031I Volume mounted successfully.\n",
    );
    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());

    let (first, second) = tokio::join!(
        bench.library.load("000063L7".to_string(), 1),
        bench.library.load("000063L7".to_string(), 1),
    );

    assert_eq!(second.status, LibraryOperationStatus::DriveBusy);
    assert_eq!(second.wait_before_next_operation, Some(15));

    let first = wait_terminal(&bench.library, &first).await;
    assert_eq!(first.status, LibraryOperationStatus::LTFS11031I);
}

#[tokio::test(start_paused = true)]
async fn test_inconsistent_tape_recovery() {
    let bench = init_bench(MTX_TAPE_IN_DRIVE).await;

    // first mount attempt reports an inconsistent volume
    bench.runner.expect("df", DF_ARGS, 0, DF_NOT_MOUNTED);
    bench.runner.expect(
        "ltfs",
        &["-o", "devname=/dev/sg1", mount_dir().as_str()],
        1,
        "LTFS16087E Cannot mount the volume\n",
    );
    bench
        .runner
        .expect("ltfsck", &["/dev/sg1"], 0, "LTFS16022I Volume is consistent.\n");
    bench.runner.expect("df", DF_ARGS, 0, DF_NOT_MOUNTED);
    bench.runner.expect(
        "ltfs",
        &["-o", "devname=/dev/sg1", mount_dir().as_str()],
        0,
        "LTFS11031I Volume mounted successfully.\n",
    );
    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());

    let operation = bench.library.mount(1).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert_eq!(operation.status, LibraryOperationStatus::LTFS11031I);
    assert_eq!(bench.runner.remaining(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unload_with_failing_umount() {
    let bench = init_bench(MTX_TAPE_IN_DRIVE).await;

    // mount first so the drive is assigned (already mounted per df)
    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());
    let operation = bench.library.mount(1).await;
    let operation = wait_terminal(&bench.library, &operation).await;
    assert!(operation.status.is_success());
    assert!(bench.library.find_drive(1).unwrap().is_assigned());

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_DRIVE);
    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());
    bench
        .runner
        .expect("umount", &[mount_dir().as_str()], 1, "umount: target is busy\n");
    // five seconds later the filesystem is gone
    bench.runner.expect("df", DF_ARGS, 0, DF_NOT_MOUNTED);
    bench.runner.expect(
        "ltfs",
        &["-o", "devname=/dev/sg1", "-o", "release_device"],
        0,
        "",
    );
    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "unload", "10", "1"], 0, "");

    let operation = bench.library.unload(1).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert_eq!(operation.status, LibraryOperationStatus::Succeeded);
    assert_eq!(bench.runner.remaining(), 0);

    // the tape went back to its origin slot
    let drive = bench.library.find_drive(1).unwrap();
    assert!(!drive.is_full());
    assert!(bench.library.snapshot_slots().iter().any(
        |slot| slot.slot_number == 10 && slot.volume_tag() == Some("000063L7")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transfer_with_stale_mtx_error() {
    let bench = init_bench(MTX_TAPE_IN_SLOT).await;

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_SLOT);
    bench.runner.expect(
        "mtx",
        &["-f", "/dev/sg2", "transfer", "10", "12"],
        1,
        "mtx: Request Sense: Long Report=yes\n",
    );
    // the follow-up scan shows the move went through after all
    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_SLOT_12);

    let operation = bench.library.transfer("000063L7".to_string(), 12).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert_eq!(operation.status, LibraryOperationStatus::Succeeded);
    assert_eq!(bench.runner.remaining(), 0);
    assert!(bench
        .events
        .lock()
        .unwrap()
        .contains(&"media:000063L7".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_changer_lock_blocks_transfer() {
    let bench = init_bench(MTX_TAPE_IN_SLOT).await;

    // somebody else is moving the robot
    let guard = bench
        .locker
        .acquire("TapeChanger", "someone-else", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_SLOT);

    let operation = bench.library.transfer("000063L7".to_string(), 12).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert_eq!(operation.status, LibraryOperationStatus::MtxBusy);
    assert_eq!(operation.wait_before_next_operation, Some(15));
    // no robot motion was issued while the lock was held
    assert!(bench
        .runner
        .invocations()
        .iter()
        .all(|spec| !spec.args.contains(&"transfer".to_string())));

    drop(guard);
}

#[tokio::test(start_paused = true)]
async fn test_collect_status_is_rate_limited() {
    let bench = init_bench(MTX_TAPE_IN_SLOT).await;

    let scans_after_init = bench
        .runner
        .invocations()
        .iter()
        .filter(|spec| spec.args.contains(&"status".to_string()))
        .count();
    assert_eq!(scans_after_init, 1);

    // both calls hit the cache window, no further subprocess runs
    bench
        .library
        .collect_status(false, &AbortFlag::new())
        .await
        .unwrap();
    bench
        .library
        .collect_status(false, &AbortFlag::new())
        .await
        .unwrap();

    let scans = bench
        .runner
        .invocations()
        .iter()
        .filter(|spec| spec.args.contains(&"status".to_string()))
        .count();
    assert_eq!(scans, 1);
}

#[tokio::test(start_paused = true)]
async fn test_operation_polling_is_stable() {
    let bench = init_bench(MTX_TAPE_IN_DRIVE).await;

    bench.runner.expect("df", DF_ARGS, 0, &df_mounted());
    let operation = bench.library.mount(1).await;
    let operation = wait_terminal(&bench.library, &operation).await;

    let trace_id = operation.trace_id.to_string();
    let first = bench.library.operation(&trace_id, None).unwrap();
    let second = bench.library.operation(&trace_id, None).unwrap();
    assert_eq!(first.status, second.status);
    assert_eq!(first.message, second.message);

    // log filtering by timestamp
    let all = bench.library.operation(&trace_id, Some(0)).unwrap();
    assert!(!all.logs.is_empty());
    let cutoff = all.logs.last().unwrap().time;
    let filtered = bench.library.operation(&trace_id, Some(cutoff)).unwrap();
    assert!(filtered.logs.is_empty());

    // unknown trace ids resolve to nothing
    assert!(bench.library.operation("not-a-trace-id", None).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_release_unloads_all_drives() {
    let bench = init_bench(MTX_TAPE_IN_DRIVE).await;

    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_DRIVE);
    // release runs the unload playbook per full drive; the drive was
    // never assigned a mount point, so there is nothing to unmount
    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "status"], 0, MTX_TAPE_IN_DRIVE);
    bench
        .runner
        .expect("mtx", &["-f", "/dev/sg2", "unload", "10", "1"], 0, "");

    let operation = bench.library.release().await;
    let operation = wait_terminal(&bench.library, &operation).await;

    assert_eq!(operation.status, LibraryOperationStatus::Succeeded);
    assert_eq!(bench.runner.remaining(), 0);
    assert!(!bench.library.find_drive(1).unwrap().is_full());
}
