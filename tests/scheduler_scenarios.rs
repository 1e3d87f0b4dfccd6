//! End-to-end scheduling scenarios driven through the public API.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shelfd::sim::{MemoryCatalog, SimComposer, SimLauncher};
use shelfd::{
    ArchiveRequest, DequeueOutcome, ExecControl, ExitStatus, MediaClass, MediaType, RequestName,
    SchedConfig, SchedError, Scheduler, Vsn,
};

struct Rig {
    sched: Scheduler,
    catalog: Arc<MemoryCatalog>,
    composer: Arc<SimComposer>,
    launcher: Arc<SimLauncher>,
}

fn rig(toml: &str) -> Rig {
    let config = SchedConfig::from_toml_str(toml).unwrap();
    let catalog = Arc::new(MemoryCatalog::new(&config));
    let composer = Arc::new(SimComposer::new());
    let launcher = Arc::new(SimLauncher::new());
    let sched = Scheduler::new(config, composer.clone(), catalog.clone(), launcher.clone());
    Rig {
        sched,
        catalog,
        composer,
        launcher,
    }
}

fn request(
    set: &str,
    seq: u32,
    class: MediaClass,
    drives: usize,
    files: u64,
    space: u64,
    min: u64,
) -> ArchiveRequest {
    let mut req = ArchiveRequest::new(RequestName::new("fs1", set, seq), class, drives);
    req.sel_files = files;
    req.sel_space = space;
    req.min_space = min;
    req
}

const DISK_CONFIG: &str = r#"
    [[library]]
    name = "dsk"
    kind = "disk"
    drives = 4

    [[filesystem]]
    name = "fs1"

    [[archive_set]]
    name = "dkset"
    media = "dk"
    drives = 2
    archmax = 256
"#;

const RM_CONFIG: &str = r#"
    [[library]]
    name = "lib1"
    drives = 2

    [[filesystem]]
    name = "fs1"

    [[archive_set]]
    name = "rmset"
    media = "li"
    drives = 2
    archmax = 300
    vsns = ["VOL.*"]
"#;

#[test]
fn test_disk_request_archives_end_to_end() {
    let r = rig(DISK_CONFIG);
    r.catalog
        .add_volume("dsk", "dk", "DISK01", 1 << 20, 800_000)
        .unwrap();

    let req = request("dkset", 1, MediaClass::Disk, 2, 4, 1000, 10);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();

    // Two copies split the selection and share the one disk volume.
    assert_eq!(
        r.launcher.started_instances(),
        vec![name.instance(0), name.instance(1)]
    );
    let calls = r.composer.tarball_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].archmax, 256);
    assert_eq!(calls[0].ovflmin, 0);
    assert_eq!(calls[0].vol_space, 500);

    let snap = r.sched.snapshot();
    assert_eq!(snap["oprmsg"], "Archiving files");
    assert_eq!(snap["queues"]["archive"][0]["state"], "archive");
    assert_eq!(snap["queues"]["archive"][0]["instances"][0]["vsn"], "DISK01");
    assert_eq!(snap["queues"]["archive"][0]["instances"][1]["vsn"], "DISK01");
    assert_eq!(snap["workers"]["active"], 2);

    let user = r
        .sched
        .get_vol_status(&MediaType::from("dk"), &Vsn::from("DISK01"))
        .unwrap();
    assert_eq!(user.request, name);
    assert_eq!(user.copy, 0);
    assert!(!user.overflow);

    // Progress reports land on the right instance.
    r.sched.update_progress(&name.instance(0), 123).unwrap();
    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["archive"][0]["instances"][0]["written"], 123);

    // First exit leaves the request in progress, second finishes it.
    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert!(r.composer.take_requeued().is_empty());
    let snap = r.sched.snapshot();
    assert_eq!(
        snap["queues"]["archive"][0]["instances"][0]["oprmsg"],
        "Copy finished"
    );

    r.sched
        .arcopy_complete(&name.instance(1), ExitStatus::exited(0))
        .unwrap();
    let back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].name, name);
    assert!(!back[0].flags.unqueue);
    assert!(!back[0].flags.norestart);

    r.sched.scan_once();
    let snap = r.sched.snapshot();
    assert_eq!(snap["oprmsg"], "Idle");
    assert_eq!(snap["workers"]["active"], 0);
    assert!(r
        .sched
        .get_vol_status(&MediaType::from("dk"), &Vsn::from("DISK01"))
        .is_none());
}

#[test]
fn test_removable_redivides_when_volumes_run_short() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    // Enough data for two drives but only one volume to write to.
    let req = request("rmset", 1, MediaClass::Removable, 2, 3, 600, 100);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();

    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);
    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["archive"][0]["instances"][0]["active"], true);
    assert_eq!(snap["queues"]["archive"][0]["instances"][0]["files"], 3);
    assert_eq!(snap["queues"]["archive"][0]["instances"][0]["vsn"], "VOL001");
    assert_eq!(snap["queues"]["archive"][0]["instances"][1]["active"], false);
    assert_eq!(snap["libraries"][0]["drives"][0]["busy"], true);
    assert_eq!(snap["libraries"][0]["drives"][0]["loaded"], "VOL001");

    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert_eq!(r.composer.take_requeued().len(), 1);
    let snap = r.sched.snapshot();
    assert_eq!(snap["libraries"][0]["drives"][0]["busy"], false);
}

#[test]
fn test_busy_volume_holds_other_sets() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 2

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "rmset"
        media = "li"
        vsns = ["VOL.*"]

        [[archive_set]]
        name = "other"
        media = "li"
        vsns = ["VOL.*"]
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    let first = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let second = request("other", 2, MediaClass::Removable, 1, 1, 100, 50);
    let first_name = first.name.clone();
    let second_name = second.name.clone();
    r.sched.enqueue(first).unwrap();
    r.sched.enqueue(second).unwrap();
    r.sched.scan_once();

    // The one volume goes to the first request; the second waits on it.
    assert_eq!(r.launcher.started_instances(), vec![first_name.instance(0)]);
    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["schedule"].as_array().unwrap().len(), 1);
    assert_eq!(
        snap["queues"]["schedule"][0]["oprmsg"],
        "Waiting for busy volume"
    );
    assert_eq!(snap["oprmsg"], "Waiting for resources");
    assert_eq!(snap["waiting"], 1);

    r.sched
        .arcopy_complete(&first_name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert_eq!(r.composer.take_requeued().len(), 1);
    r.sched.scan_once();
    assert_eq!(
        r.launcher.started_instances(),
        vec![first_name.instance(0), second_name.instance(0)]
    );
}

#[test]
fn test_same_set_requests_share_drive_budget() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 1

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "rmset"
        media = "li"
        vsns = ["VOL.*"]
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    let mut low = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    low.priority = 10.0;
    let mut high = request("rmset", 2, MediaClass::Removable, 1, 1, 100, 50);
    high.priority = 20.0;
    let low_name = low.name.clone();
    let high_name = high.name.clone();
    r.sched.enqueue(low).unwrap();
    r.sched.enqueue(high).unwrap();
    r.sched.scan_once();

    // The higher priority wins the set's single drive; the loser is
    // charged for it and stays scheduled.
    assert_eq!(r.launcher.started_instances(), vec![high_name.instance(0)]);
    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["schedule"][0]["request"], low_name.to_string());
    assert_eq!(
        snap["queues"]["schedule"][0]["oprmsg"],
        "Waiting for drives: archive set busy"
    );

    r.sched
        .arcopy_complete(&high_name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert_eq!(r.composer.take_requeued()[0].name, high_name);
    r.sched.scan_once();
    assert_eq!(
        r.launcher.started_instances(),
        vec![high_name.instance(0), low_name.instance(0)]
    );
}

#[test]
fn test_volume_overflow_grant_moves_worker() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 2

        [[filesystem]]
        name = "fs1"

        [[media]]
        media = "li"
        overflow = true
        ovflmin = 100

        [[archive_set]]
        name = "rmset"
        media = "li"
        vsns = ["VOL.*"]
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();
    r.catalog
        .add_volume("lib1", "li", "VOL002", 1 << 30, 10_000)
        .unwrap();

    let req = request("rmset", 1, MediaClass::Removable, 1, 2, 500, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);

    // Small remainders are not worth a volume swap.
    let err = r.sched.request_volume(&name.instance(0), 50).unwrap_err();
    assert!(matches!(err, SchedError::OverflowNotAllowed(_)));
    let err = r
        .sched
        .request_volume(&RequestName::new("fs1", "rmset", 9).instance(0), 500)
        .unwrap_err();
    assert!(matches!(err, SchedError::UnknownRequest(_)));

    r.sched.update_progress(&name.instance(0), 350).unwrap();
    r.catalog.set_space("VOL001", 0);
    r.sched.request_volume(&name.instance(0), 150).unwrap();

    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["schedule"][0]["pseudo"], "volume-request");
    let user = r
        .sched
        .get_vol_status(&MediaType::from("li"), &Vsn::from("VOL001"))
        .unwrap();
    assert!(!user.overflow);

    // The scan grants the next volume and pins the old one.
    r.sched.scan_once();
    let user = r
        .sched
        .get_vol_status(&MediaType::from("li"), &Vsn::from("VOL002"))
        .unwrap();
    assert_eq!(user.request, name);
    assert!(!user.overflow);
    let pinned = r
        .sched
        .get_vol_status(&MediaType::from("li"), &Vsn::from("VOL001"))
        .unwrap();
    assert_eq!(pinned.request, name);
    assert!(pinned.overflow);
    let snap = r.sched.snapshot();
    assert!(snap["queues"]["schedule"].as_array().unwrap().is_empty());
    assert_eq!(snap["overflow"][0]["vsn"], "VOL001");

    // Completion releases the grant and the pin together.
    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert_eq!(r.composer.take_requeued().len(), 1);
    assert!(r
        .sched
        .get_vol_status(&MediaType::from("li"), &Vsn::from("VOL001"))
        .is_none());
    assert!(r
        .sched
        .get_vol_status(&MediaType::from("li"), &Vsn::from("VOL002"))
        .is_none());
}

#[test]
fn test_follow_up_work_after_worker_finishes() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 2

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "rmset"
        media = "li"
        drives = 2
        archmax = 300
        drivemax = 400
        vsns = ["VOL.*"]
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();
    r.catalog
        .add_volume("lib1", "li", "VOL002", 1 << 30, 10_000)
        .unwrap();

    // drivemax caps each instance below its share, so both carry more.
    let req = request("rmset", 1, MediaClass::Removable, 2, 4, 1000, 100);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();
    assert_eq!(
        r.launcher.started_instances(),
        vec![name.instance(0), name.instance(1)]
    );

    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert!(r.composer.take_requeued().is_empty());
    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["schedule"][0]["pseudo"], "more-work");

    // The composer has two more files for that instance.
    r.composer.stage_more_work(&name.instance(0), 2, 200);
    r.catalog.set_space("VOL001", 9600);
    r.sched.scan_once();
    assert_eq!(
        r.launcher.started_instances(),
        vec![name.instance(0), name.instance(1), name.instance(0)]
    );
    let calls = r.composer.tarball_calls();
    assert_eq!(calls.last().unwrap().copy, 0);
    assert_eq!(calls.last().unwrap().vol_space, 9600);

    // Nothing staged for the second instance: its follow-up dies quietly.
    r.sched
        .arcopy_complete(&name.instance(1), ExitStatus::exited(0))
        .unwrap();
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances().len(), 3);

    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(0))
        .unwrap();
    let back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].name, name);
    let snap = r.sched.snapshot();
    assert!(snap["queues"]["archive"].as_array().unwrap().is_empty());
    assert_eq!(snap["workers"]["active"], 0);
}

#[test]
fn test_dequeue_waiting_and_draining() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    // An unmounted file system holds the request; dequeue frees it.
    r.sched.set_fs_status("fs1", false, false).unwrap();
    let req = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    let snap = r.sched.snapshot();
    assert_eq!(
        snap["queues"]["wait"][0]["oprmsg"],
        "Waiting for file system mount"
    );
    assert_eq!(r.sched.dequeue(&name), DequeueOutcome::Removed);
    let back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(back[0].flags.unqueue);

    assert_eq!(
        r.sched.dequeue(&RequestName::new("fs1", "rmset", 99)),
        DequeueOutcome::NotFound
    );

    // A running request drains through its worker's completion.
    r.sched.set_fs_status("fs1", true, false).unwrap();
    let req = request("rmset", 2, MediaClass::Removable, 1, 1, 100, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();
    let pid = r.launcher.pid_of(&name.instance(0)).unwrap();

    assert_eq!(r.sched.dequeue(&name), DequeueOutcome::Draining);
    assert_eq!(r.launcher.terminated(), vec![pid]);
    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::signaled(15))
        .unwrap();
    let back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(back[0].flags.cancelling);
    assert!(!back[0].flags.norestart);
    let snap = r.sched.snapshot();
    assert!(snap["queues"]["archive"].as_array().unwrap().is_empty());
}

#[test]
fn test_no_restart_exit_holds_retry() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    let req = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();
    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(3))
        .unwrap();

    let mut back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(back[0].flags.norestart);

    // A retry of the same request parks until the operator runs it.
    let retry = back.remove(0);
    r.sched.enqueue(retry).unwrap();
    let snap = r.sched.snapshot();
    assert_eq!(
        snap["queues"]["wait"][0]["oprmsg"],
        "Waiting after copy worker error"
    );
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances().len(), 1);
}

#[test]
fn test_global_pause_defers_scans() {
    let r = rig(DISK_CONFIG);
    r.catalog
        .add_volume("dsk", "dk", "DISK01", 1 << 20, 800_000)
        .unwrap();

    r.sched.set_global_state(ExecControl::Idle);
    let req = request("dkset", 1, MediaClass::Disk, 1, 1, 100, 10);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();
    assert!(r.launcher.started().is_empty());
    let snap = r.sched.snapshot();
    assert_eq!(snap["oprmsg"], "Waiting for run command");
    assert_eq!(snap["queues"]["schedule"].as_array().unwrap().len(), 1);

    // Requests can still be pulled back while paused.
    let other = request("dkset", 2, MediaClass::Disk, 1, 1, 100, 10);
    let other_name = other.name.clone();
    r.sched.enqueue(other).unwrap();
    assert_eq!(r.sched.dequeue(&other_name), DequeueOutcome::Removed);
    assert!(r.composer.take_requeued()[0].flags.unqueue);

    r.sched.set_global_state(ExecControl::Run);
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);
    assert_eq!(r.sched.snapshot()["oprmsg"], "Archiving files");
}

#[test]
fn test_fs_control_moves_scheduled_requests() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    assert!(matches!(
        r.sched.set_fs_state("nope", ExecControl::Run),
        Err(SchedError::UnknownFileSystem(_))
    ));
    assert!(r.sched.set_fs_status("nope", true, false).is_err());

    let req = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    r.sched.enqueue(req).unwrap();
    r.sched.set_fs_state("fs1", ExecControl::Idle).unwrap();
    let snap = r.sched.snapshot();
    assert!(snap["queues"]["schedule"].as_array().unwrap().is_empty());
    assert_eq!(
        snap["queues"]["wait"][0]["oprmsg"],
        "Waiting for file system run command"
    );

    // Resuming alone leaves the hold; the run command re-evaluates it.
    r.sched.set_fs_state("fs1", ExecControl::Run).unwrap();
    r.sched.run();
    r.sched.scan_once();
    let mut back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(back[0].flags.unqueue);

    let mut retry = back.remove(0);
    retry.flags.unqueue = false;
    let name = retry.name.clone();
    r.sched.enqueue(retry).unwrap();
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);
}

#[test]
fn test_fs_stop_terminates_workers() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    let req = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();
    let pid = r.launcher.pid_of(&name.instance(0)).unwrap();

    r.sched.set_fs_state("fs1", ExecControl::Stop).unwrap();
    assert_eq!(r.launcher.terminated(), vec![pid]);
    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::signaled(15))
        .unwrap();
    assert_eq!(r.composer.take_requeued().len(), 1);
}

#[test]
fn test_class_pause_holds_new_requests() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 2

        [[library]]
        name = "dsk"
        kind = "disk"
        drives = 2

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "rmset"
        media = "li"
        vsns = ["VOL.*"]

        [[archive_set]]
        name = "dkset"
        media = "dk"
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();
    r.catalog
        .add_volume("dsk", "dk", "DISK01", 1 << 20, 800_000)
        .unwrap();

    r.sched.set_rm_state(ExecControl::Idle);
    let held = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let held_name = held.name.clone();
    r.sched.enqueue(held).unwrap();
    let disk = request("dkset", 2, MediaClass::Disk, 1, 1, 100, 10);
    let disk_name = disk.name.clone();
    r.sched.enqueue(disk).unwrap();
    r.sched.scan_once();

    // Disk archiving is unaffected by the removable pause.
    assert_eq!(r.launcher.started_instances(), vec![disk_name.instance(0)]);
    let snap = r.sched.snapshot();
    assert_eq!(
        snap["queues"]["wait"][0]["oprmsg"],
        "Waiting for removable archiving run command"
    );

    r.sched.set_rm_state(ExecControl::Run);
    r.sched.run();
    r.sched.scan_once();
    let mut back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].name, held_name);

    let mut retry = back.remove(0);
    retry.flags.unqueue = false;
    r.sched.enqueue(retry).unwrap();
    r.sched.scan_once();
    assert_eq!(
        r.launcher.started_instances(),
        vec![disk_name.instance(0), held_name.instance(0)]
    );
}

#[test]
fn test_worker_start_failure_reschedules() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 1

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "rmset"
        media = "li"
        vsns = ["VOL.*"]
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    r.launcher.fail_starts(true);
    let req = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();

    assert!(r.launcher.started().is_empty());
    let snap = r.sched.snapshot();
    assert_eq!(snap["waiting"], 1);
    assert_eq!(
        snap["queues"]["schedule"][0]["oprmsg"],
        "Unable to start copy workers"
    );
    assert_eq!(snap["oprmsg"], "Waiting for resources");

    // The next scan retries from scratch.
    r.launcher.fail_starts(false);
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);
    assert_eq!(r.sched.snapshot()["oprmsg"], "Archiving files");
}

#[test]
fn test_robot_stop_kills_removable_workers() {
    let toml = r#"
        [[library]]
        name = "lib1"
        drives = 2

        [[library]]
        name = "dsk"
        kind = "disk"
        drives = 2

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "rmset"
        media = "li"
        vsns = ["VOL.*"]

        [[archive_set]]
        name = "dkset"
        media = "dk"
    "#;
    let r = rig(toml);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();
    r.catalog
        .add_volume("dsk", "dk", "DISK01", 1 << 20, 800_000)
        .unwrap();

    let rm = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let rm_name = rm.name.clone();
    let dk = request("dkset", 2, MediaClass::Disk, 1, 1, 100, 10);
    let dk_name = dk.name.clone();
    r.sched.enqueue(rm).unwrap();
    r.sched.enqueue(dk).unwrap();
    r.sched.scan_once();
    let rm_pid = r.launcher.pid_of(&rm_name.instance(0)).unwrap();

    // Only removable workers die with the robot.
    r.sched.robot_stopped();
    assert_eq!(r.launcher.terminated(), vec![rm_pid]);
    r.sched
        .arcopy_complete(&rm_name.instance(0), ExitStatus::signaled(9))
        .unwrap();
    let back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(!back[0].flags.norestart);

    r.sched.robot_started();
    r.sched.scan_once();
    r.sched
        .arcopy_complete(&dk_name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert_eq!(r.composer.take_requeued()[0].name, dk_name);
}

#[test]
fn test_offline_files_wait_for_stage_volumes() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    let mut req = request("rmset", 1, MediaClass::Removable, 1, 2, 400, 50);
    req.flags.offline = true;
    let name = req.name.clone();
    r.composer.set_non_stageable(&name, 2);
    r.sched.enqueue(req).unwrap();
    r.sched.scan_once();

    let snap = r.sched.snapshot();
    assert_eq!(snap["queues"]["wait"][0]["oprmsg"], "Waiting for stage volumes");
    assert_eq!(snap["oprmsg"], "Waiting for stage volumes");
    assert!(r.launcher.started().is_empty());

    // Stage volumes came back; the run command re-evaluates the hold.
    r.composer.set_non_stageable(&name, 0);
    r.sched.run();
    r.sched.scan_once();
    let mut back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(back[0].flags.nonstage);

    let mut retry = back.remove(0);
    retry.flags.unqueue = false;
    r.sched.enqueue(retry).unwrap();
    r.sched.scan_once();
    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);
}

#[test]
fn test_stale_requests_return_to_composer() {
    let r = rig(RM_CONFIG);
    r.catalog
        .add_volume("lib1", "li", "VOL001", 1 << 30, 10_000)
        .unwrap();

    let req = request("rmset", 1, MediaClass::Removable, 1, 1, 100, 50);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();
    r.composer.invalidate(&name);
    r.sched.scan_once();

    let back = r.composer.take_requeued();
    assert_eq!(back.len(), 1);
    assert!(back[0].flags.unqueue);
    assert!(r.launcher.started().is_empty());
    let snap = r.sched.snapshot();
    assert!(snap["queues"]["schedule"].as_array().unwrap().is_empty());
    assert!(snap["queues"]["archive"].as_array().unwrap().is_empty());
}

#[test]
fn test_queue_order_survives_random_churn() {
    // No volumes are cataloged, so requests survive every scan and the
    // queue order stays observable.
    let r = rig(RM_CONFIG);

    let mut names = Vec::new();
    for seq in 1..=40u32 {
        let mut req = request("rmset", seq, MediaClass::Removable, 1, 1, 100, 50);
        req.priority = (rand::random::<u32>() % 100) as f64;
        names.push(req.name.clone());
        r.sched.enqueue(req).unwrap();
    }
    r.sched.scan_once();

    let mut removed = 0usize;
    for name in names.iter().step_by(3) {
        assert_eq!(r.sched.dequeue(name), DequeueOutcome::Removed);
        removed += 1;
    }
    r.sched.scan_once();

    let back = r.composer.take_requeued();
    assert_eq!(back.len(), removed);
    assert!(back.iter().all(|req| req.flags.unqueue));

    let snap = r.sched.snapshot();
    let entries = snap["queues"]["schedule"].as_array().unwrap();
    assert_eq!(entries.len(), names.len() - removed);
    let priorities: Vec<f64> = entries
        .iter()
        .map(|e| e["priority"].as_f64().unwrap())
        .collect();
    assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_background_thread_schedules() {
    let toml = r#"
        poll_interval_secs = 1

        [[library]]
        name = "dsk"
        kind = "disk"
        drives = 2

        [[filesystem]]
        name = "fs1"

        [[archive_set]]
        name = "dkset"
        media = "dk"
    "#;
    let mut r = rig(toml);
    r.catalog
        .add_volume("dsk", "dk", "DISK01", 1 << 20, 800_000)
        .unwrap();
    r.sched.start();

    let req = request("dkset", 1, MediaClass::Disk, 1, 1, 100, 10);
    let name = req.name.clone();
    r.sched.enqueue(req).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while r.launcher.started().is_empty() {
        assert!(Instant::now() < deadline, "worker never started");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(r.launcher.started_instances(), vec![name.instance(0)]);

    r.sched
        .arcopy_complete(&name.instance(0), ExitStatus::exited(0))
        .unwrap();
    assert_eq!(r.composer.take_requeued().len(), 1);

    r.sched.shutdown();
    let late = request("dkset", 2, MediaClass::Disk, 1, 1, 100, 10);
    assert!(matches!(
        r.sched.enqueue(late),
        Err(SchedError::ShutDown)
    ));
}
