// Integration test for periodic advertising sync and sync transfer
//
// Sync establishment is serialized: only the head of the request queue has a
// Create Sync outstanding, and every outcome moves the queue along.

use legap_core::gap::{ManualTimers, SyncState};
use legap_core::hci::StaticAclDirectory;
use legap_core::{
    BdAddr, ControllerCapabilities, GapConfig, GapEvent, GapNotification, GapStatus,
    GapSubsystem, HciCommand, RecordingSink, TimerKind,
};

const RANDOM: u8 = 0x01;

fn engine() -> (GapSubsystem, RecordingSink, ManualTimers) {
    let sink = RecordingSink::new();
    let timers = ManualTimers::new();
    let gap = GapSubsystem::new(
        GapConfig::default(),
        ControllerCapabilities::default(),
        Box::new(sink.clone()),
        Box::new(timers.clone()),
    )
    .expect("engine");
    (gap, sink, timers)
}

fn advertiser(last: u8) -> BdAddr {
    BdAddr::new([0xC1, 0x00, 0x00, 0x00, 0x00, last])
}

fn sync_established(status: u8, sync_handle: u16, sid: u8, addr: BdAddr) -> GapEvent {
    let mut params = vec![status];
    params.extend_from_slice(&sync_handle.to_le_bytes());
    params.push(sid);
    params.push(RANDOM);
    params.extend_from_slice(&addr.to_le_bytes());
    params.push(0x01); // LE 1M
    params.extend_from_slice(&0x0050u16.to_le_bytes());
    params.push(0x00);
    GapEvent::LeMeta {
        subevent: 0x0E,
        params,
    }
}

fn periodic_report(sync_handle: u16, data: &[u8]) -> GapEvent {
    let mut params = sync_handle.to_le_bytes().to_vec();
    params.extend_from_slice(&[0x7F, 0xC4, 0xFF, 0x00, data.len() as u8]);
    params.extend_from_slice(data);
    GapEvent::LeMeta {
        subevent: 0x0F,
        params,
    }
}

fn sync_lost(sync_handle: u16) -> GapEvent {
    GapEvent::LeMeta {
        subevent: 0x10,
        params: sync_handle.to_le_bytes().to_vec(),
    }
}

fn create_syncs(sink: &RecordingSink) -> Vec<(u8, BdAddr)> {
    sink.take()
        .into_iter()
        .filter_map(|c| match c {
            HciCommand::PeriodicCreateSync { sid, addr, .. } => Some((sid, addr)),
            _ => None,
        })
        .collect()
}

fn sync_started(gap: &mut GapSubsystem) -> Vec<(u8, u8, u16)> {
    gap.take_notifications()
        .into_iter()
        .filter_map(|n| match n {
            GapNotification::SyncStarted {
                status,
                sid,
                sync_handle,
                ..
            } => Some((status, sid, sync_handle)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_requests_established_one_at_a_time() {
    let (mut gap, sink, _timers) = engine();
    let (a, b) = (advertiser(1), advertiser(2));

    assert_eq!(
        gap.start_periodic_sync(1, a, 0, 100).expect("first"),
        GapStatus::Started
    );
    gap.start_periodic_sync(2, b, 0, 100).expect("second");
    assert_eq!(create_syncs(&sink), vec![(1, a)], "second request must wait");
    assert_eq!(gap.sync().queue_len(), 2);

    gap.dispatch(sync_established(0x00, 0x0040, 1, a));
    assert_eq!(sync_started(&mut gap), vec![(0x00, 1, 0x0040)]);
    assert_eq!(create_syncs(&sink), vec![(2, b)]);
    assert_eq!(
        gap.sync().session(1, &a).map(|s| s.state),
        Some(SyncState::Established)
    );

    gap.dispatch(sync_established(0x00, 0x0041, 2, b));
    assert_eq!(sync_started(&mut gap), vec![(0x00, 2, 0x0041)]);
    assert_eq!(gap.sync().queue_len(), 0);

    println!("✓ Periodic sync requests established in order");
}

#[test]
fn test_duplicate_request_rejected() {
    let (mut gap, _sink, _timers) = engine();
    let a = advertiser(3);
    gap.start_periodic_sync(4, a, 0, 100).expect("first");
    let err = gap.start_periodic_sync(4, a, 0, 100).expect_err("duplicate");
    assert_eq!(err.status(), GapStatus::Busy);
    assert_eq!(gap.sync().queue_len(), 1);

    println!("✓ Second request for the same advertising set rejected");
}

#[test]
fn test_establish_timeout_moves_queue() {
    let (mut gap, sink, timers) = engine();
    let (a, b) = (advertiser(5), advertiser(6));
    gap.start_periodic_sync(1, a, 0, 100).expect("first");
    gap.start_periodic_sync(1, b, 0, 100).expect("second");
    sink.take();

    let expiry = timers.fire(TimerKind::SyncEstablish).expect("sync timer");
    gap.dispatch(expiry);

    assert_eq!(sync_started(&mut gap), vec![(0x3C, 1, 0)]);
    let commands = sink.take();
    assert!(commands.contains(&HciCommand::PeriodicCreateSyncCancel));
    assert!(commands.iter().any(|c| matches!(
        c,
        HciCommand::PeriodicCreateSync { addr, .. } if *addr == b
    )));
    assert!(gap.sync().session(1, &a).is_none());
    assert_eq!(gap.sync().outstanding(), Some((1, b)));

    // The late outcome of the timed-out request changes nothing
    gap.dispatch(sync_established(0x00, 0x0050, 1, a));
    assert_eq!(gap.sync().outstanding(), Some((1, b)));
    assert!(sink
        .take()
        .contains(&HciCommand::PeriodicTerminateSync { sync_handle: 0x0050 }));

    println!("✓ Establishment timeout reported and next request sent");
}

#[test]
fn test_reports_and_loss_follow_established_handle() {
    let (mut gap, _sink, _timers) = engine();
    let a = advertiser(7);
    gap.start_periodic_sync(2, a, 0, 100).expect("sync");
    gap.dispatch(sync_established(0x00, 0x0033, 2, a));
    gap.take_notifications();

    gap.dispatch(periodic_report(0x0033, &[0x02, 0x01, 0x06]));
    gap.dispatch(periodic_report(0x0099, &[0x02, 0x01, 0x06]));
    let notifications = gap.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert!(matches!(
        &notifications[0],
        GapNotification::SyncReport { sync_handle: 0x0033, data, .. } if data == &[0x02, 0x01, 0x06]
    ));

    gap.dispatch(sync_lost(0x0033));
    assert_eq!(
        gap.take_notifications(),
        vec![GapNotification::SyncLost { sync_handle: 0x0033 }]
    );
    assert!(gap.sync().session(2, &a).is_none());

    gap.dispatch(periodic_report(0x0033, &[0x02, 0x01, 0x06]));
    assert!(gap.take_notifications().is_empty());

    println!("✓ Periodic reports routed while the sync is up");
}

#[test]
fn test_cancel_pending_and_stop_established() {
    let (mut gap, sink, _timers) = engine();
    let (a, b) = (advertiser(8), advertiser(9));
    gap.start_periodic_sync(1, a, 0, 100).expect("first");
    gap.start_periodic_sync(1, b, 0, 100).expect("second");
    sink.take();

    // Queued but not started: removed without touching the controller
    assert_eq!(gap.cancel_periodic_sync(1, b), Ok(GapStatus::Success));
    assert!(sink.take().is_empty());
    assert_eq!(gap.sync().queue_len(), 1);

    // Outstanding: Create Sync cancelled
    assert_eq!(gap.cancel_periodic_sync(1, a), Ok(GapStatus::Success));
    assert_eq!(sink.take(), vec![HciCommand::PeriodicCreateSyncCancel]);

    // Unknown handles are harmless
    assert_eq!(gap.stop_periodic_sync(0x0777), Ok(GapStatus::Success));
    assert!(sink.take().is_empty());

    println!("✓ Sync requests withdrawn at every stage");
}

#[test]
fn test_restart_after_cancel_survives_late_outcome() {
    let (mut gap, sink, _timers) = engine();
    let a = advertiser(11);
    gap.start_periodic_sync(1, a, 0, 100).expect("first");
    gap.cancel_periodic_sync(1, a).expect("cancel");
    gap.start_periodic_sync(1, a, 0, 100).expect("restart");
    sink.take();

    // Controller confirms the cancelled create
    gap.dispatch(sync_established(0x44, 0x0000, 1, a));
    assert!(sync_started(&mut gap).is_empty(), "restart not failed");
    assert_eq!(create_syncs(&sink), vec![(1, a)]);
    assert_eq!(
        gap.sync().session(1, &a).map(|s| s.state),
        Some(SyncState::Pending)
    );

    gap.dispatch(sync_established(0x00, 0x0020, 1, a));
    assert_eq!(sync_started(&mut gap), vec![(0x00, 1, 0x0020)]);
    assert!(sink.take().is_empty());
    assert_eq!(
        gap.sync().session(1, &a).map(|s| (s.state, s.sync_handle)),
        Some((SyncState::Established, 0x0020))
    );

    println!("✓ Restarted sync completes after the cancelled create settles");
}

#[test]
fn test_sync_refused_when_scanning_not_allowed() {
    // Passive scanning alone is state bit 4
    let caps = ControllerCapabilities::default().without_state(4);
    let sink = RecordingSink::new();
    let mut gap = GapSubsystem::new(
        GapConfig::default(),
        caps,
        Box::new(sink.clone()),
        Box::new(ManualTimers::new()),
    )
    .expect("engine");

    let a = advertiser(10);
    assert_eq!(gap.start_periodic_sync(3, a, 0, 100), Ok(GapStatus::Started));
    assert_eq!(sync_started(&mut gap), vec![(0x0C, 3, 0)]);
    assert!(create_syncs(&sink).is_empty());
    assert_eq!(gap.sync().queue_len(), 0);

    println!("✓ Sync refused while the controller cannot scan");
}

#[test]
fn test_sync_transfer_to_capable_peer() {
    let peer = BdAddr::new([0x50, 0x51, 0x52, 0x53, 0x54, 0x55]);
    let legacy_peer = BdAddr::new([0x60, 0x61, 0x62, 0x63, 0x64, 0x65]);
    let mut acl = StaticAclDirectory::new();
    // LE feature bit 25: PAST recipient
    acl.add_link(peer, 0x0010, [0, 0, 0, 0x02, 0, 0, 0, 0]);
    acl.add_link(legacy_peer, 0x0011, [0; 8]);

    let sink = RecordingSink::new();
    let mut gap = GapSubsystem::new(
        GapConfig::default(),
        ControllerCapabilities::default(),
        Box::new(sink.clone()),
        Box::new(ManualTimers::new()),
    )
    .expect("engine")
    .with_acl(Box::new(acl));

    assert_eq!(
        gap.transfer_sync(peer, 0x0001, 0x0040),
        Ok(GapStatus::Started)
    );
    assert_eq!(
        sink.take(),
        vec![HciCommand::PeriodicSyncTransfer {
            conn_handle: 0x0010,
            service_data: 0x0001,
            sync_handle: 0x0040,
        }]
    );

    let err = gap
        .transfer_sync(legacy_peer, 0x0001, 0x0040)
        .expect_err("peer lacks PAST");
    assert_eq!(err.status(), GapStatus::ModeUnsupported);

    let stranger = BdAddr::new([0x70; 6]);
    let err = gap
        .transfer_set_info(stranger, 0x0001, 0)
        .expect_err("not connected");
    assert_eq!(err.status(), GapStatus::UnknownAddress);

    gap.dispatch(GapEvent::PastCommandComplete {
        conn_handle: 0x0010,
        status: 0x00,
    });
    assert_eq!(
        gap.take_notifications(),
        vec![GapNotification::SyncTransferComplete { status: 0x00, peer }]
    );

    println!("✓ Sync transfer sent only to connected PAST-capable peers");
}
