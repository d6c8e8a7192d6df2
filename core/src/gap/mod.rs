//! LE GAP engine.
//!
//! [`GapSubsystem`] owns every piece of GAP state and is driven from a single
//! context: public operations are called directly, everything asynchronous
//! (controller events, collaborator completions, timer expiries) comes back
//! through [`GapSubsystem::dispatch`]. Upper layers collect what happened with
//! [`GapSubsystem::take_notifications`].

pub mod ad;
pub mod event;
pub mod inquiry;
pub mod mode;
pub mod reassembler;
pub mod scan;
pub mod sync;
pub mod timer;
pub mod topology;

pub use event::{GapEvent, GapNotification, ScanResult};
pub use inquiry::{InquiryDb, InquiryRecord};
pub use mode::{Connectability, Discoverability, ModeController};
pub use scan::Scanner;
pub use sync::{SyncError, SyncOrchestrator, SyncSession, SyncState};
pub use timer::{ManualTimers, TimerBackend, TimerKind, Timers, TokioTimerBackend};
pub use topology::{GapRole, LinkRole, Topology, TopologyError};

use crate::address::{BdAddr, TypedAddr};
use crate::config::{GapConfig, PrivacyMode};
use crate::hci::{
    AclDirectory, ControllerCapabilities, HciCommand, HciSink, IdentityResolver, LeMetaEvent,
    NoBonds, ScanType, StaticAclDirectory, HCI_SUCCESS,
};
use crate::sdp::{
    DiscoveryError, DiscoveryRole, FeatureDiscovery, PeerFeatureTable, PeerFeatures,
    ProfileRecord, SdpDatabase,
};
use crate::{GapError, GapResult, GapStatus};
use tracing::{debug, info, trace, warn};

/// Shared context handed to the controllers: command output, timers, the
/// topology mask and the notification outbox.
pub(crate) struct Radio {
    pub(crate) config: GapConfig,
    pub(crate) caps: ControllerCapabilities,
    pub(crate) timers: Timers,
    pub(crate) topology: Topology,
    hci: Box<dyn HciSink>,
    outbox: Vec<GapNotification>,
}

impl Radio {
    pub(crate) fn new(
        config: GapConfig,
        caps: ControllerCapabilities,
        hci: Box<dyn HciSink>,
        timers: Box<dyn TimerBackend>,
    ) -> Self {
        Self {
            config,
            caps,
            timers: Timers::new(timers),
            topology: Topology::new(),
            hci,
            outbox: Vec::new(),
        }
    }

    pub(crate) fn send(&mut self, command: HciCommand) {
        trace!("-> {:?}", command);
        self.hci.send(command);
    }

    pub(crate) fn notify(&mut self, notification: GapNotification) {
        self.outbox.push(notification);
    }

    pub(crate) fn take_notifications(&mut self) -> Vec<GapNotification> {
        std::mem::take(&mut self.outbox)
    }
}

pub struct GapSubsystem {
    radio: Radio,
    resolver: Box<dyn IdentityResolver>,
    acl: Box<dyn AclDirectory>,
    discovery: Box<dyn FeatureDiscovery>,
    mode: ModeController,
    scanner: Scanner,
    sync: SyncOrchestrator,
    inquiry_db: InquiryDb,
    profile: ProfileRecord,
    peer_features: PeerFeatureTable,
}

impl GapSubsystem {
    /// Build an engine with no bonds, no links and an in-memory SDP database.
    /// Collaborators can be swapped with the `with_*` builders.
    pub fn new(
        config: GapConfig,
        caps: ControllerCapabilities,
        hci: Box<dyn HciSink>,
        timers: Box<dyn TimerBackend>,
    ) -> Result<Self, GapError> {
        config.validate()?;
        info!(
            "GAP subsystem up: inquiry db {}, {} sync slots, privacy {:?}",
            config.inquiry_db_size, config.max_sync_transactions, config.privacy
        );
        Ok(Self {
            mode: ModeController::new(config.privacy),
            scanner: Scanner::new(),
            sync: SyncOrchestrator::new(config.max_sync_transactions),
            inquiry_db: InquiryDb::new(config.inquiry_db_size),
            profile: ProfileRecord::new(),
            peer_features: PeerFeatureTable::new(),
            resolver: Box::new(NoBonds),
            acl: Box::new(StaticAclDirectory::new()),
            discovery: Box::new(SdpDatabase::new()),
            radio: Radio::new(config, caps, hci, timers),
        })
    }

    pub fn with_resolver(mut self, resolver: Box<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_acl(mut self, acl: Box<dyn AclDirectory>) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_discovery(mut self, discovery: Box<dyn FeatureDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn config(&self) -> &GapConfig {
        &self.radio.config
    }

    pub fn capabilities(&self) -> &ControllerCapabilities {
        &self.radio.caps
    }

    pub fn topology(&self) -> &Topology {
        &self.radio.topology
    }

    pub fn mode(&self) -> &ModeController {
        &self.mode
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn sync(&self) -> &SyncOrchestrator {
        &self.sync
    }

    pub fn inquiry_db(&self) -> &InquiryDb {
        &self.inquiry_db
    }

    /// Notifications produced since the last call, oldest first
    pub fn take_notifications(&mut self) -> Vec<GapNotification> {
        self.radio.take_notifications()
    }

    /// Would `role` be allowed next to the roles running now
    pub fn check_topology(&self, role: GapRole) -> Result<(), TopologyError> {
        self.radio.topology.check(&self.radio.caps, role)
    }

    // ------------------------------------------------------------------------
    // Advertising modes
    // ------------------------------------------------------------------------

    pub fn set_discoverability(&mut self, mode: Discoverability) -> GapResult {
        self.mode
            .set_discoverability(&mut self.radio, self.resolver.as_ref(), mode)
    }

    pub fn set_connectability(&mut self, mode: Connectability) -> GapResult {
        self.mode
            .set_connectability(&mut self.radio, self.resolver.as_ref(), mode)
    }

    pub fn read_discoverability(&self) -> Discoverability {
        self.mode.discoverability()
    }

    pub fn read_connectability(&self) -> Connectability {
        self.mode.connectability()
    }

    pub fn set_directed_target(&mut self, peer: TypedAddr, low_duty: bool) {
        self.mode.set_directed_target(peer, low_duty);
    }

    pub fn clear_directed_target(&mut self) {
        self.mode.clear_directed_target();
    }

    pub fn configure_privacy(&mut self, privacy: PrivacyMode) {
        self.radio.config.privacy = privacy;
        self.mode.configure_privacy(privacy);
    }

    /// BR/EDR modes, consulted for the BR/EDR-not-supported flag
    pub fn set_classic_modes(&mut self, discoverable: bool, connectable: bool) {
        self.mode.set_classic_modes(discoverable, connectable);
    }

    pub fn set_scan_response(&mut self, configured: bool) {
        self.mode.set_scan_response(configured);
    }

    pub fn set_adv_filter_policy(&mut self, policy: u8) {
        self.mode.set_adv_filter_policy(policy);
    }

    pub fn set_adv_payload(&mut self, payload: Vec<u8>) {
        self.mode.set_adv_payload(payload);
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    pub fn set_scan_params(&mut self, interval: u16, window: u16, scan_type: ScanType) -> GapResult {
        self.scanner
            .set_scan_params(&self.radio, interval, window, scan_type)
    }

    pub fn start_observe(&mut self, duration_secs: u16) -> GapResult {
        self.scanner.start_observe(&mut self.radio, duration_secs)
    }

    pub fn stop_observe(&mut self) -> GapResult {
        self.scanner.stop_observe(&mut self.radio)
    }

    pub fn start_inquiry(&mut self, duration_secs: u16) -> GapResult {
        self.scanner
            .start_inquiry(&mut self.radio, &mut self.inquiry_db, duration_secs)
    }

    pub fn stop_inquiry(&mut self) -> GapResult {
        self.scanner
            .stop_inquiry(&mut self.radio, &mut self.inquiry_db)
    }

    pub fn opportunistic_observe(&mut self, enable: bool) {
        self.scanner.set_opportunistic(enable);
    }

    pub fn read_remote_name(&mut self, peer: BdAddr) -> GapResult {
        self.scanner.read_remote_name(
            &mut self.radio,
            self.acl.as_mut(),
            &self.inquiry_db,
            peer,
        )
    }

    pub fn cancel_remote_name(&mut self, peer: BdAddr) -> GapResult {
        self.scanner
            .cancel_remote_name(&mut self.radio, self.acl.as_mut(), peer)
    }

    // ------------------------------------------------------------------------
    // Periodic sync
    // ------------------------------------------------------------------------

    pub fn start_periodic_sync(
        &mut self,
        sid: u8,
        addr: BdAddr,
        skip: u16,
        timeout: u16,
    ) -> GapResult {
        self.sync.start_sync(
            &mut self.radio,
            self.resolver.as_ref(),
            &self.inquiry_db,
            sid,
            addr,
            skip,
            timeout,
        )
    }

    pub fn stop_periodic_sync(&mut self, sync_handle: u16) -> GapResult {
        self.sync.stop_sync(&mut self.radio, sync_handle)
    }

    pub fn cancel_periodic_sync(&mut self, sid: u8, addr: BdAddr) -> GapResult {
        self.sync.cancel_sync(&mut self.radio, sid, addr)
    }

    pub fn transfer_sync(&mut self, peer: BdAddr, service_data: u16, sync_handle: u16) -> GapResult {
        self.sync.transfer_sync(
            &mut self.radio,
            self.acl.as_ref(),
            peer,
            service_data,
            sync_handle,
        )
    }

    pub fn transfer_set_info(&mut self, peer: BdAddr, service_data: u16, adv_handle: u8) -> GapResult {
        self.sync.transfer_set_info(
            &mut self.radio,
            self.acl.as_ref(),
            peer,
            service_data,
            adv_handle,
        )
    }

    pub fn set_sync_transfer_params(
        &mut self,
        peer: BdAddr,
        mode: u8,
        skip: u16,
        timeout: u16,
    ) -> GapResult {
        self.sync.set_sync_transfer_params(
            &mut self.radio,
            self.acl.as_ref(),
            peer,
            mode,
            skip,
            timeout,
        )
    }

    // ------------------------------------------------------------------------
    // Profile features
    // ------------------------------------------------------------------------

    pub fn register_profile_record(&mut self, service_name: &str, local_features: u16) -> GapResult {
        self.profile
            .register(self.discovery.as_mut(), service_name, local_features)?;
        Ok(GapStatus::Success)
    }

    pub fn unregister_profile_record(&mut self) -> GapResult {
        self.profile.unregister(self.discovery.as_mut())?;
        Ok(GapStatus::Success)
    }

    pub fn discover_peer_features(&mut self, peer: BdAddr, role: DiscoveryRole) -> GapResult {
        if !self.discovery.discover(&peer, role) {
            return Err(DiscoveryError::NotStarted(peer).into());
        }
        Ok(GapStatus::Started)
    }

    /// Features the peer announced in-band; later SDP results do not override them
    pub fn set_peer_features(&mut self, peer: BdAddr, features: u16) {
        self.peer_features.set_inband(peer, features);
    }

    pub fn peer_features(&self, peer: &BdAddr) -> Option<PeerFeatures> {
        self.peer_features.get(peer)
    }

    // ------------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------------

    pub fn dispatch(&mut self, event: GapEvent) {
        match event {
            GapEvent::LeMeta { subevent, params } => match LeMetaEvent::parse(subevent, &params) {
                Ok(meta) => self.on_le_meta(meta),
                Err(e) => warn!("Dropping LE meta event 0x{:02x}: {}", subevent, e),
            },
            GapEvent::AdvEnableComplete { status } => {
                self.mode.on_adv_enable_complete(&mut self.radio, status);
            }
            GapEvent::DirectedAdvTimeout => {
                debug!("Directed advertising timed out");
                self.mode.on_adv_stopped_by_controller(&mut self.radio);
                self.mode
                    .update_mode_operation(&mut self.radio, self.resolver.as_ref());
            }
            GapEvent::LinkUp { role, peer } => {
                info!("{:?} link up with {}", role, peer);
                if self.radio.topology.update_link(role, true) {
                    self.mode.on_adv_stopped_by_controller(&mut self.radio);
                }
                self.mode
                    .update_mode_operation(&mut self.radio, self.resolver.as_ref());
            }
            GapEvent::LinkDown { role, peer } => {
                info!("{:?} link down with {}", role, peer);
                self.radio.topology.update_link(role, false);
                self.peer_features.remove(&peer);
                self.mode
                    .update_mode_operation(&mut self.radio, self.resolver.as_ref());
            }
            GapEvent::PastCommandComplete {
                conn_handle,
                status,
            } => self.sync.on_past_complete(&mut self.radio, conn_handle, status),
            GapEvent::RemoteNameResponse { peer, status, name } => {
                self.scanner
                    .on_remote_name_response(&mut self.radio, peer, status, name);
            }
            GapEvent::FeatureDiscoveryComplete {
                peer,
                status,
                features,
                network,
                version,
            } => self.on_feature_discovery(peer, status, features, network, version),
            GapEvent::TimerExpired { kind, generation } => {
                if self.radio.timers.consume(kind, generation) {
                    self.on_timer(kind);
                }
            }
        }
    }

    fn on_le_meta(&mut self, meta: LeMetaEvent) {
        match meta {
            LeMetaEvent::AdvertisingReports(batch)
            | LeMetaEvent::ExtendedAdvertisingReports(batch) => self.scanner.on_reports(
                &mut self.radio,
                self.resolver.as_ref(),
                &mut self.inquiry_db,
                batch,
            ),
            LeMetaEvent::SyncEstablished(evt) => self.sync.on_sync_established(
                &mut self.radio,
                self.resolver.as_ref(),
                &self.inquiry_db,
                evt,
            ),
            LeMetaEvent::PeriodicReport(report) => {
                self.sync.on_periodic_report(&mut self.radio, report)
            }
            LeMetaEvent::SyncLost { sync_handle } => {
                self.sync.on_sync_lost(&mut self.radio, sync_handle)
            }
            LeMetaEvent::SyncTransferReceived(evt) => {
                self.sync.on_sync_transfer_received(&mut self.radio, evt)
            }
            LeMetaEvent::BigInfo(report) => self.sync.on_big_info(&mut self.radio, report),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        debug!("{:?} timer expired", kind);
        match kind {
            TimerKind::FastAdv => self
                .mode
                .on_fast_adv_timeout(&mut self.radio, self.resolver.as_ref()),
            TimerKind::LimitedDiscovery => self.mode.on_limited_discovery_timeout(&mut self.radio),
            TimerKind::Observe => self.scanner.on_observe_timeout(&mut self.radio),
            TimerKind::Inquiry => self
                .scanner
                .on_inquiry_timeout(&mut self.radio, &mut self.inquiry_db),
            TimerKind::RemoteName => self
                .scanner
                .on_remote_name_timeout(&mut self.radio, self.acl.as_mut()),
            TimerKind::SyncEstablish => self.sync.on_sync_timeout(
                &mut self.radio,
                self.resolver.as_ref(),
                &self.inquiry_db,
            ),
        }
    }

    fn on_feature_discovery(
        &mut self,
        peer: BdAddr,
        status: u8,
        features: Option<u16>,
        network: Option<u8>,
        version: Option<u16>,
    ) {
        let result = if status == HCI_SUCCESS {
            self.peer_features
                .apply_discovery(peer, features, network, version)
        } else {
            warn!("Feature discovery of {} failed: 0x{:02x}", peer, status);
            self.peer_features.get(&peer).unwrap_or_default()
        };
        self.radio.notify(GapNotification::PeerFeaturesDiscovered {
            peer,
            status,
            features: result.features,
            version: result.version,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::RecordingSink;
    use crate::sdp::MockFeatureDiscovery;

    fn subsystem() -> (GapSubsystem, RecordingSink, ManualTimers) {
        let sink = RecordingSink::new();
        let timers = ManualTimers::new();
        let gap = GapSubsystem::new(
            GapConfig::default(),
            ControllerCapabilities::default(),
            Box::new(sink.clone()),
            Box::new(timers.clone()),
        )
        .expect("valid config");
        (gap, sink, timers)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GapConfig {
            inquiry_db_size: 0,
            ..GapConfig::default()
        };
        let result = GapSubsystem::new(
            config,
            ControllerCapabilities::default(),
            Box::new(RecordingSink::new()),
            Box::new(ManualTimers::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stale_timer_expiry_ignored() {
        let (mut gap, sink, timers) = subsystem();
        gap.start_observe(5).expect("observe");
        let stale = timers.fire(TimerKind::Observe).expect("armed");
        gap.stop_observe().expect("stop");
        gap.start_observe(5).expect("observe again");
        sink.take();
        gap.take_notifications();

        gap.dispatch(stale);
        assert!(gap.scanner().is_observing());
        assert!(sink.commands().is_empty());

        let current = timers.fire(TimerKind::Observe).expect("armed");
        gap.dispatch(current);
        assert!(!gap.scanner().is_observing());
        assert_eq!(gap.take_notifications(), vec![GapNotification::ObserveComplete]);
    }

    #[test]
    fn test_malformed_meta_event_dropped() {
        let (mut gap, sink, _timers) = subsystem();
        gap.dispatch(GapEvent::LeMeta {
            subevent: 0x0E,
            params: vec![0x00, 0x01],
        });
        gap.dispatch(GapEvent::LeMeta {
            subevent: 0x7F,
            params: vec![],
        });
        assert!(sink.commands().is_empty());
        assert!(gap.take_notifications().is_empty());
    }

    #[test]
    fn test_peripheral_link_stops_advertising() {
        let (mut gap, _sink, _timers) = subsystem();
        gap.set_connectability(Connectability::Connectable)
            .expect("connectable");
        assert!(gap.topology().is_active(GapRole::ConnAdv));

        let peer = BdAddr::new([1, 2, 3, 4, 5, 6]);
        gap.dispatch(GapEvent::LinkUp {
            role: LinkRole::Peripheral,
            peer,
        });
        assert!(gap.topology().is_active(GapRole::Peripheral));
        // still connectable: advertising resumes next to the link
        assert!(gap.topology().is_active(GapRole::ConnAdv));
        assert!(gap.mode().is_advertising());
        assert_eq!(gap.topology().link_count(LinkRole::Peripheral), 1);
    }

    #[test]
    fn test_feature_discovery_round_trip() {
        let peer = BdAddr::new([9, 8, 7, 6, 5, 4]);
        let mut discovery = MockFeatureDiscovery::new();
        discovery.expect_discover().times(1).returning(|_, _| true);
        let (gap, _sink, _timers) = subsystem();
        let mut gap = gap.with_discovery(Box::new(discovery));

        assert_eq!(
            gap.discover_peer_features(peer, DiscoveryRole::Initiator)
                .expect("started"),
            GapStatus::Started
        );
        gap.dispatch(GapEvent::FeatureDiscoveryComplete {
            peer,
            status: 0,
            features: Some(0x0020),
            network: Some(1),
            version: None,
        });
        assert_eq!(
            gap.take_notifications(),
            vec![GapNotification::PeerFeaturesDiscovered {
                peer,
                status: 0,
                features: crate::sdp::features::PEER_CODEC | crate::sdp::features::PEER_REJECT,
                version: crate::sdp::DEFAULT_PEER_VERSION,
            }]
        );
    }
}
