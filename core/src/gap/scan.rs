//! Observe, general inquiry and the advertising report pipeline.
//!
//! Both activities share one controller scan. Whichever starts first brings
//! the scan up; it goes down only when neither is left.

use super::event::{GapNotification, ScanResult};
use super::inquiry::{self, InquiryDb, InquiryUpdate, ScanContext, RESULT_INQUIRY, RESULT_OBSERVER};
use super::reassembler::{Reassembler, Reassembly};
use super::timer::TimerKind;
use super::topology::{GapRole, ALL_SCAN_MASK};
use super::Radio;
use crate::address::{AddrType, BdAddr};
use crate::config::PrivacyMode;
use crate::hci::{
    AclDirectory, AdvReport, HciCommand, IdentityResolver, ReportBatch, ScanType,
    HCI_ERR_HOST_TIMEOUT, HCI_ERR_OPERATION_CANCELLED_BY_HOST, HCI_SUCCESS,
};
use crate::{GapError, GapResult, GapStatus};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Scan interval and window used while a general inquiry runs, 0.625 ms units
pub const LOW_LATENCY_SCAN_INT: u16 = 8000;
pub const LOW_LATENCY_SCAN_WIN: u16 = 8000;

/// Smallest legal scan interval or window
pub const SCAN_PARAM_MIN: u16 = 0x0004;

/// Longest remote name delivered upward
pub const MAX_REMOTE_NAME_LEN: usize = 248;

const SCAN_FILTER_ACCEPT_ALL: u8 = 0x00;

#[derive(Debug, Default)]
pub struct Scanner {
    reassembler: Reassembler,
    /// Scan type chosen through [`Scanner::set_scan_params`]
    configured_type: Option<ScanType>,
    /// Type the controller is scanning with right now
    running_type: Option<ScanType>,
    /// Configured interval and window; zero until set
    interval: u16,
    window: u16,
    observe_active: bool,
    inquiry_active: bool,
    opportunistic: bool,
    remote_name: Option<BdAddr>,
}

fn own_addr_type(privacy: PrivacyMode) -> AddrType {
    match privacy {
        PrivacyMode::None => AddrType::Public,
        _ => AddrType::Random,
    }
}

/// Cut a name to at most [`MAX_REMOTE_NAME_LEN`] bytes on a char boundary
fn truncate_name(mut name: String) -> String {
    if name.len() > MAX_REMOTE_NAME_LEN {
        let mut end = MAX_REMOTE_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scan_active(&self) -> bool {
        self.observe_active || self.inquiry_active
    }

    pub fn is_observing(&self) -> bool {
        self.observe_active
    }

    pub fn is_inquiry_active(&self) -> bool {
        self.inquiry_active
    }

    pub fn running_type(&self) -> Option<ScanType> {
        self.running_type
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn set_opportunistic(&mut self, enabled: bool) {
        debug!("Opportunistic scan results {}", if enabled { "on" } else { "off" });
        self.opportunistic = enabled;
    }

    fn low_latency_configured(&self) -> bool {
        self.interval == LOW_LATENCY_SCAN_INT && self.window == LOW_LATENCY_SCAN_WIN
    }

    /// Configured interval/window, or the observe defaults
    fn observe_params(&self, radio: &Radio) -> (u16, u16) {
        if self.interval == 0 || self.window == 0 {
            (radio.config.disc_scan_interval, radio.config.disc_scan_window)
        } else {
            (self.interval, self.window)
        }
    }

    fn send_scan_params(radio: &mut Radio, scan_type: ScanType, interval: u16, window: u16) {
        let own = own_addr_type(radio.config.privacy);
        radio.send(HciCommand::SetScanParams {
            scan_type,
            interval,
            window,
            own_addr_type: own,
            filter_policy: SCAN_FILTER_ACCEPT_ALL,
        });
    }

    fn start_scan(&mut self, radio: &mut Radio, scan_type: ScanType) -> Result<(), GapError> {
        let role = match scan_type {
            ScanType::Active => GapRole::ActiveScan,
            ScanType::Passive => GapRole::PassiveScan,
        };
        radio.topology.request(&radio.caps, role)?;
        radio.send(HciCommand::SetScanEnable {
            enable: true,
            filter_duplicates: radio.config.filter_duplicates,
        });
        self.running_type = Some(scan_type);
        Ok(())
    }

    fn stop_scan(&mut self, radio: &mut Radio) {
        if self.running_type.take().is_some() {
            radio.topology.clear_mask(ALL_SCAN_MASK);
            radio.send(HciCommand::SetScanEnable {
                enable: false,
                filter_duplicates: false,
            });
        }
    }

    /// Store scan parameters for the next observe. A running scan keeps its
    /// parameters until restarted.
    pub(crate) fn set_scan_params(
        &mut self,
        radio: &Radio,
        interval: u16,
        window: u16,
        scan_type: ScanType,
    ) -> GapResult {
        if !radio.caps.supports_ble {
            return Err(GapError::IllegalValue("LE not supported".into()));
        }
        let range = SCAN_PARAM_MIN..=radio.caps.max_scan_param();
        if !range.contains(&interval) || !range.contains(&window) {
            return Err(GapError::IllegalValue(format!(
                "scan interval 0x{:04x} / window 0x{:04x} out of range",
                interval, window
            )));
        }
        self.configured_type = Some(scan_type);
        self.interval = interval;
        self.window = window;
        debug!(
            "Scan params set: {:?} interval 0x{:04x} window 0x{:04x}",
            scan_type, interval, window
        );
        Ok(GapStatus::Success)
    }

    /// Start observing for `duration_secs` seconds, zero meaning until stopped
    pub(crate) fn start_observe(&mut self, radio: &mut Radio, duration_secs: u16) -> GapResult {
        if !radio.caps.supports_ble {
            return Err(GapError::IllegalValue("LE not supported".into()));
        }

        if self.observe_active {
            // Turning an observe with timeout into an unbounded one
            if duration_secs == 0 && radio.timers.is_armed(TimerKind::Observe) {
                radio.timers.cancel(TimerKind::Observe);
                return Ok(GapStatus::Started);
            }
            return Err(GapError::WrongMode("observe already active".into()));
        }

        if !self.is_scan_active() {
            self.reassembler.reset();
            let scan_type = self.configured_type.unwrap_or(ScanType::Active);
            let (interval, window) = self.observe_params(radio);
            Self::send_scan_params(radio, scan_type, interval, window);
            self.start_scan(radio, scan_type)?;
        }

        self.observe_active = true;
        if duration_secs > 0 {
            radio
                .timers
                .arm(TimerKind::Observe, Duration::from_secs(u64::from(duration_secs)));
        }
        info!("Observe started ({}s)", duration_secs);
        Ok(GapStatus::Started)
    }

    pub(crate) fn stop_observe(&mut self, radio: &mut Radio) -> GapResult {
        if !self.observe_active {
            return Err(GapError::WrongMode("observe not active".into()));
        }
        self.finish_observe(radio);
        Ok(GapStatus::Success)
    }

    fn finish_observe(&mut self, radio: &mut Radio) {
        radio.timers.cancel(TimerKind::Observe);
        self.observe_active = false;
        if !self.is_scan_active() {
            self.stop_scan(radio);
        }
        info!("Observe complete");
        radio.notify(GapNotification::ObserveComplete);
    }

    pub(crate) fn on_observe_timeout(&mut self, radio: &mut Radio) {
        if self.observe_active {
            self.finish_observe(radio);
        }
    }

    /// Start a general inquiry. The scan runs active at low latency for as
    /// long as the inquiry lasts.
    pub(crate) fn start_inquiry(
        &mut self,
        radio: &mut Radio,
        db: &mut InquiryDb,
        duration_secs: u16,
    ) -> GapResult {
        if !radio.caps.supports_ble {
            return Err(GapError::IllegalValue("LE not supported".into()));
        }
        if self.inquiry_active {
            return Err(GapError::Busy("inquiry already active"));
        }

        if !self.is_scan_active() {
            self.reassembler.reset();
            Self::send_scan_params(
                radio,
                ScanType::Active,
                LOW_LATENCY_SCAN_INT,
                LOW_LATENCY_SCAN_WIN,
            );
            self.start_scan(radio, ScanType::Active)?;
        } else if !self.low_latency_configured() {
            debug!("Restarting scan at low latency for inquiry");
            let previous = self.running_type.unwrap_or(ScanType::Active);
            self.stop_scan(radio);
            Self::send_scan_params(
                radio,
                ScanType::Active,
                LOW_LATENCY_SCAN_INT,
                LOW_LATENCY_SCAN_WIN,
            );
            if let Err(e) = self.start_scan(radio, ScanType::Active) {
                // Put the observer's scan back the way it was
                let (interval, window) = self.observe_params(radio);
                Self::send_scan_params(radio, previous, interval, window);
                if let Err(restore) = self.start_scan(radio, previous) {
                    warn!("Observe scan not restored after refused inquiry: {}", restore);
                }
                return Err(e);
            }
        }

        self.inquiry_active = true;
        db.begin_inquiry();
        if duration_secs > 0 {
            radio
                .timers
                .arm(TimerKind::Inquiry, Duration::from_secs(u64::from(duration_secs)));
        }
        info!("General inquiry started ({}s)", duration_secs);
        Ok(GapStatus::Started)
    }

    pub(crate) fn stop_inquiry(&mut self, radio: &mut Radio, db: &mut InquiryDb) -> GapResult {
        if !self.inquiry_active {
            return Err(GapError::WrongMode("no inquiry active".into()));
        }
        self.finish_inquiry(radio, db);
        Ok(GapStatus::Success)
    }

    pub(crate) fn on_inquiry_timeout(&mut self, radio: &mut Radio, db: &mut InquiryDb) {
        if self.inquiry_active {
            self.finish_inquiry(radio, db);
        }
    }

    fn finish_inquiry(&mut self, radio: &mut Radio, db: &mut InquiryDb) {
        radio.timers.cancel(TimerKind::Inquiry);
        self.inquiry_active = false;

        if !self.is_scan_active() {
            self.stop_scan(radio);
        } else if !self.low_latency_configured() {
            // Observe continues with its own parameters
            self.stop_scan(radio);
            let scan_type = self.configured_type.unwrap_or(ScanType::Active);
            let (interval, window) = self.observe_params(radio);
            Self::send_scan_params(radio, scan_type, interval, window);
            if let Err(e) = self.start_scan(radio, scan_type) {
                warn!("Observe scan not restarted after inquiry: {}", e);
            }
        }

        db.end_inquiry();
        db.clear_pending_le_entries();
        let num_responses = db.num_responses();
        info!("General inquiry complete, {} responses", num_responses);
        radio.notify(GapNotification::InquiryComplete { num_responses });
    }

    /// Decode and deliver every report of a batch
    pub(crate) fn on_reports(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        db: &mut InquiryDb,
        batch: ReportBatch,
    ) {
        for report in batch.reports {
            self.process_report(radio, resolver, db, report);
        }
        if let Some(e) = batch.aborted {
            warn!("Advertising report event cut short: {}", e);
        }
    }

    fn process_report(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        db: &mut InquiryDb,
        mut report: AdvReport,
    ) {
        if !self.is_scan_active() {
            trace!("Dropping report from {}: not scanning", report.addr);
            return;
        }

        let original_addr = report.addr;
        if let Some(resolved) = resolver.resolve_report_address(&report.addr, report.addr_type) {
            trace!("Report from {} resolved to {}", report.addr, resolved.addr);
            report.addr = resolved.addr;
            report.addr_type = resolved.addr_type;
        }

        let active_scan = self.running_type == Some(ScanType::Active);
        let payload = match self.reassembler.feed(
            report.event_type,
            report.addr_type,
            report.addr,
            &report.data,
            active_scan,
        ) {
            Reassembly::Complete(payload) => payload,
            Reassembly::Pending | Reassembly::Dropped(_) => return,
        };

        let ctx = ScanContext {
            active_scan,
            observe_active: self.observe_active,
            general_inquiry_active: self.inquiry_active,
        };
        let (record, report_inquiry) = match db.process_report(&report, original_addr, &payload, ctx)
        {
            InquiryUpdate::Updated {
                record,
                report_inquiry,
            } => (record, report_inquiry),
            InquiryUpdate::Skipped => return,
        };

        if self.opportunistic {
            radio.notify(GapNotification::OpportunisticResult(ScanResult {
                record: record.clone(),
                data: payload.clone(),
            }));
        }

        let mut result = inquiry::discoverability(&payload, self.observe_active, self.inquiry_active);
        if !report_inquiry {
            result &= !RESULT_INQUIRY;
        }
        if result == 0 {
            return;
        }

        if result & RESULT_INQUIRY != 0 {
            radio.notify(GapNotification::InquiryResult(ScanResult {
                record: record.clone(),
                data: payload.clone(),
            }));
        }
        if result & RESULT_OBSERVER != 0 {
            radio.notify(GapNotification::ObserveResult(ScanResult {
                record,
                data: payload,
            }));
        }
    }

    // ------------------------------------------------------------------------
    // Remote name
    // ------------------------------------------------------------------------

    pub(crate) fn read_remote_name(
        &mut self,
        radio: &mut Radio,
        acl: &mut dyn AclDirectory,
        db: &InquiryDb,
        peer: BdAddr,
    ) -> GapResult {
        if !radio.caps.supports_ble {
            return Err(GapError::Processing("LE not supported".into()));
        }
        if let Some(record) = db.find(&peer) {
            if !record.event_type.is_connectable() {
                return Err(GapError::Processing(format!("{} is not connectable", peer)));
            }
        }
        if self.remote_name.is_some() {
            return Err(GapError::Busy("remote name request pending"));
        }
        if !acl.request_device_name(&peer) {
            return Err(GapError::Busy("device name read not started"));
        }

        self.remote_name = Some(peer);
        radio
            .timers
            .arm(TimerKind::RemoteName, radio.config.remote_name_timeout());
        debug!("Reading remote name of {}", peer);
        Ok(GapStatus::Started)
    }

    pub(crate) fn cancel_remote_name(
        &mut self,
        radio: &mut Radio,
        acl: &mut dyn AclDirectory,
        peer: BdAddr,
    ) -> GapResult {
        if self.remote_name != Some(peer) {
            return Err(GapError::WrongMode(format!("no name request for {}", peer)));
        }
        if !acl.cancel_device_name(&peer) {
            return Err(GapError::UnknownAddress(peer));
        }
        radio.timers.cancel(TimerKind::RemoteName);
        self.remote_name = None;
        radio.notify(GapNotification::RemoteNameComplete {
            peer,
            status: HCI_ERR_OPERATION_CANCELLED_BY_HOST,
            name: String::new(),
        });
        Ok(GapStatus::Success)
    }

    pub(crate) fn on_remote_name_response(
        &mut self,
        radio: &mut Radio,
        peer: BdAddr,
        status: u8,
        name: String,
    ) {
        if self.remote_name != Some(peer) {
            debug!("Unsolicited remote name from {}", peer);
            return;
        }
        radio.timers.cancel(TimerKind::RemoteName);
        self.remote_name = None;

        let name = truncate_name(name);
        let status = if status == HCI_SUCCESS && !name.is_empty() {
            HCI_SUCCESS
        } else {
            HCI_ERR_HOST_TIMEOUT
        };
        radio.notify(GapNotification::RemoteNameComplete { peer, status, name });
    }

    pub(crate) fn on_remote_name_timeout(&mut self, radio: &mut Radio, acl: &mut dyn AclDirectory) {
        if let Some(peer) = self.remote_name.take() {
            warn!("Remote name read from {} timed out", peer);
            acl.cancel_device_name(&peer);
            radio.notify(GapNotification::RemoteNameComplete {
                peer,
                status: HCI_ERR_HOST_TIMEOUT,
                name: String::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GapConfig;
    use crate::gap::timer::ManualTimers;
    use crate::hci::{
        AdvEventProps, ControllerCapabilities, MockAclDirectory, NoBonds, RecordingSink,
        StaticAclDirectory,
    };

    fn radio() -> (Radio, RecordingSink, ManualTimers) {
        let sink = RecordingSink::new();
        let timers = ManualTimers::new();
        let radio = Radio::new(
            GapConfig::default(),
            ControllerCapabilities::default(),
            Box::new(sink.clone()),
            Box::new(timers.clone()),
        );
        (radio, sink, timers)
    }

    fn report(addr: BdAddr, legacy_type: u8, data: &[u8]) -> AdvReport {
        AdvReport {
            event_type: AdvEventProps::from_legacy(legacy_type).expect("legacy type"),
            addr_type: AddrType::Public,
            addr,
            primary_phy: 1,
            secondary_phy: 0,
            sid: 0xFF,
            tx_power: 0x7F,
            rssi: -60,
            periodic_interval: 0,
            data: data.to_vec(),
        }
    }

    fn batch(reports: Vec<AdvReport>) -> ReportBatch {
        ReportBatch {
            reports,
            aborted: None,
        }
    }

    const GENERAL_DISC: [u8; 3] = [0x02, 0x01, 0x06];

    #[test]
    fn test_observe_uses_default_params_when_unset() {
        let (mut radio, sink, timers) = radio();
        let mut scanner = Scanner::new();
        assert_eq!(scanner.start_observe(&mut radio, 10).expect("observe"), GapStatus::Started);
        let commands = sink.take();
        assert_eq!(
            commands,
            vec![
                HciCommand::SetScanParams {
                    scan_type: ScanType::Active,
                    interval: 0x12,
                    window: 0x12,
                    own_addr_type: AddrType::Public,
                    filter_policy: 0,
                },
                HciCommand::SetScanEnable {
                    enable: true,
                    filter_duplicates: false,
                },
            ]
        );
        assert!(radio.topology.is_active(GapRole::ActiveScan));
        assert_eq!(
            timers.scheduled(TimerKind::Observe).map(|t| t.after),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_second_observe() {
        let (mut radio, _sink, timers) = radio();
        let mut scanner = Scanner::new();
        scanner.start_observe(&mut radio, 10).expect("observe");
        let err = scanner.start_observe(&mut radio, 5).expect_err("already observing");
        assert_eq!(err.status(), GapStatus::WrongMode);

        assert_eq!(scanner.start_observe(&mut radio, 0).expect("unbounded"), GapStatus::Started);
        assert!(!timers.is_scheduled(TimerKind::Observe));
    }

    #[test]
    fn test_observe_without_le() {
        let (mut radio, sink, _timers) = radio();
        radio.caps.supports_ble = false;
        let mut scanner = Scanner::new();
        let err = scanner.start_observe(&mut radio, 0).expect_err("no LE");
        assert_eq!(err.status(), GapStatus::IllegalValue);
        assert!(sink.commands().is_empty());
    }

    #[test]
    fn test_scan_params_validation() {
        let (radio, _sink, _timers) = radio();
        let mut scanner = Scanner::new();
        assert!(scanner.set_scan_params(&radio, 3, 4, ScanType::Passive).is_err());
        assert!(scanner.set_scan_params(&radio, 0x4001, 4, ScanType::Passive).is_err());
        assert_eq!(
            scanner
                .set_scan_params(&radio, 0x0060, 0x0030, ScanType::Passive)
                .expect("valid"),
            GapStatus::Success
        );
    }

    #[test]
    fn test_inquiry_restarts_passive_observe_at_low_latency() {
        let (mut radio, sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner
            .set_scan_params(&radio, 0x0060, 0x0030, ScanType::Passive)
            .expect("params");
        scanner.start_observe(&mut radio, 0).expect("observe");
        assert!(radio.topology.is_active(GapRole::PassiveScan));
        sink.take();

        scanner.start_inquiry(&mut radio, &mut db, 5).expect("inquiry");
        let commands = sink.take();
        assert_eq!(
            commands[0],
            HciCommand::SetScanEnable {
                enable: false,
                filter_duplicates: false
            }
        );
        assert!(matches!(
            commands[1],
            HciCommand::SetScanParams {
                scan_type: ScanType::Active,
                interval: LOW_LATENCY_SCAN_INT,
                window: LOW_LATENCY_SCAN_WIN,
                ..
            }
        ));
        assert!(radio.topology.is_active(GapRole::ActiveScan));
        assert!(!radio.topology.is_active(GapRole::PassiveScan));

        scanner.stop_inquiry(&mut radio, &mut db).expect("cancel");
        let commands = sink.take();
        assert!(commands.contains(&HciCommand::SetScanParams {
            scan_type: ScanType::Passive,
            interval: 0x0060,
            window: 0x0030,
            own_addr_type: AddrType::Public,
            filter_policy: 0,
        }));
        assert!(radio.topology.is_active(GapRole::PassiveScan));
        assert!(scanner.is_observing());
        assert_eq!(
            radio.take_notifications(),
            vec![GapNotification::InquiryComplete { num_responses: 0 }]
        );
    }

    #[test]
    fn test_inquiry_busy() {
        let (mut radio, _sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner.start_inquiry(&mut radio, &mut db, 0).expect("inquiry");
        let err = scanner.start_inquiry(&mut radio, &mut db, 0).expect_err("busy");
        assert_eq!(err.status(), GapStatus::Busy);
    }

    #[test]
    fn test_refused_inquiry_keeps_observe_scanning() {
        let (mut radio, sink, _timers) = radio();
        // active scan alone unsupported
        radio.caps = ControllerCapabilities::default().without_state(5);
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner
            .set_scan_params(&radio, 0x0060, 0x0030, ScanType::Passive)
            .expect("params");
        scanner.start_observe(&mut radio, 0).expect("observe");
        sink.take();

        let err = scanner
            .start_inquiry(&mut radio, &mut db, 5)
            .expect_err("active scan refused");
        assert_eq!(err.status(), GapStatus::WrongMode);

        let commands = sink.take();
        assert_eq!(
            commands.last(),
            Some(&HciCommand::SetScanEnable {
                enable: true,
                filter_duplicates: false,
            })
        );
        assert!(commands.contains(&HciCommand::SetScanParams {
            scan_type: ScanType::Passive,
            interval: 0x0060,
            window: 0x0030,
            own_addr_type: AddrType::Public,
            filter_policy: 0,
        }));
        assert!(scanner.is_observing());
        assert!(!scanner.is_inquiry_active());
        assert_eq!(scanner.running_type(), Some(ScanType::Passive));
        assert!(radio.topology.is_active(GapRole::PassiveScan));
    }

    #[test]
    fn test_inquiry_timeout_stops_scan() {
        let (mut radio, sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner.start_inquiry(&mut radio, &mut db, 5).expect("inquiry");
        sink.take();
        scanner.on_inquiry_timeout(&mut radio, &mut db);
        assert_eq!(
            sink.take(),
            vec![HciCommand::SetScanEnable {
                enable: false,
                filter_duplicates: false
            }]
        );
        assert_eq!(radio.topology.mask() & ALL_SCAN_MASK, 0);
        assert!(!scanner.is_scan_active());
    }

    #[test]
    fn test_reports_dropped_when_idle() {
        let (mut radio, _sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        let peer = BdAddr::new([1, 2, 3, 4, 5, 6]);
        scanner.on_reports(&mut radio, &NoBonds, &mut db, batch(vec![report(peer, 0x03, &GENERAL_DISC)]));
        assert!(db.is_empty());
        assert!(radio.take_notifications().is_empty());
    }

    #[test]
    fn test_observe_and_inquiry_results() {
        let (mut radio, _sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner.start_observe(&mut radio, 0).expect("observe");
        scanner.start_inquiry(&mut radio, &mut db, 0).expect("inquiry");

        let discoverable = BdAddr::new([1, 1, 1, 1, 1, 1]);
        let silent = BdAddr::new([2, 2, 2, 2, 2, 2]);
        scanner.on_reports(
            &mut radio,
            &NoBonds,
            &mut db,
            batch(vec![
                report(discoverable, 0x03, &GENERAL_DISC),
                report(silent, 0x03, &[0x02, 0x01, 0x04]),
            ]),
        );

        let notifications = radio.take_notifications();
        let kinds: Vec<(&str, BdAddr)> = notifications
            .iter()
            .map(|n| match n {
                GapNotification::InquiryResult(r) => ("inquiry", r.record.addr),
                GapNotification::ObserveResult(r) => ("observe", r.record.addr),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("inquiry", discoverable),
                ("observe", discoverable),
                ("observe", silent)
            ]
        );
    }

    #[test]
    fn test_active_scan_waits_for_scan_response() {
        let (mut radio, _sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner.start_observe(&mut radio, 0).expect("observe");

        let peer = BdAddr::new([3, 3, 3, 3, 3, 3]);
        scanner.on_reports(&mut radio, &NoBonds, &mut db, batch(vec![report(peer, 0x00, &GENERAL_DISC)]));
        assert!(radio.take_notifications().is_empty());

        scanner.on_reports(
            &mut radio,
            &NoBonds,
            &mut db,
            batch(vec![report(peer, 0x04, &[0x03, 0x09, b'h', b'i'])]),
        );
        match radio.take_notifications().as_slice() {
            [GapNotification::ObserveResult(result)] => {
                assert_eq!(result.data, vec![0x02, 0x01, 0x06, 0x03, 0x09, b'h', b'i']);
                assert!(result.record.scan_rsp);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_opportunistic_results() {
        let (mut radio, _sink, _timers) = radio();
        let mut db = InquiryDb::new(8);
        let mut scanner = Scanner::new();
        scanner.set_opportunistic(true);
        scanner.start_inquiry(&mut radio, &mut db, 0).expect("inquiry");

        let peer = BdAddr::new([4, 4, 4, 4, 4, 4]);
        scanner.on_reports(&mut radio, &NoBonds, &mut db, batch(vec![report(peer, 0x03, &[0x02, 0x01, 0x04])]));
        let notifications = radio.take_notifications();
        assert_eq!(notifications.len(), 1);
        assert!(matches!(notifications[0], GapNotification::OpportunisticResult(_)));
    }

    #[test]
    fn test_remote_name_flow() {
        let (mut radio, _sink, timers) = radio();
        let db = InquiryDb::new(8);
        let peer = BdAddr::new([5, 5, 5, 5, 5, 5]);
        let mut acl = StaticAclDirectory::new();
        acl.add_link(peer, 0x0041, [0; 8]);
        let mut scanner = Scanner::new();

        assert_eq!(
            scanner
                .read_remote_name(&mut radio, &mut acl, &db, peer)
                .expect("started"),
            GapStatus::Started
        );
        assert!(timers.is_scheduled(TimerKind::RemoteName));
        let err = scanner
            .read_remote_name(&mut radio, &mut acl, &db, peer)
            .expect_err("busy");
        assert_eq!(err.status(), GapStatus::Busy);

        let long_name = "x".repeat(300);
        scanner.on_remote_name_response(&mut radio, peer, HCI_SUCCESS, long_name);
        match radio.take_notifications().as_slice() {
            [GapNotification::RemoteNameComplete { status, name, .. }] => {
                assert_eq!(*status, HCI_SUCCESS);
                assert_eq!(name.len(), MAX_REMOTE_NAME_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!timers.is_scheduled(TimerKind::RemoteName));
    }

    #[test]
    fn test_remote_name_not_started() {
        let (mut radio, _sink, _timers) = radio();
        let db = InquiryDb::new(8);
        let peer = BdAddr::new([6, 6, 6, 6, 6, 6]);
        let mut acl = MockAclDirectory::new();
        acl.expect_request_device_name().returning(|_| false);
        let mut scanner = Scanner::new();
        let err = scanner
            .read_remote_name(&mut radio, &mut acl, &db, peer)
            .expect_err("not started");
        assert_eq!(err.status(), GapStatus::Busy);
    }

    #[test]
    fn test_remote_name_timeout_reports_failure() {
        let (mut radio, _sink, _timers) = radio();
        let db = InquiryDb::new(8);
        let peer = BdAddr::new([7, 7, 7, 7, 7, 7]);
        let mut acl = StaticAclDirectory::new();
        acl.add_link(peer, 0x0042, [0; 8]);
        let mut scanner = Scanner::new();
        scanner
            .read_remote_name(&mut radio, &mut acl, &db, peer)
            .expect("started");
        scanner.on_remote_name_timeout(&mut radio, &mut acl);
        assert_eq!(
            radio.take_notifications(),
            vec![GapNotification::RemoteNameComplete {
                peer,
                status: HCI_ERR_HOST_TIMEOUT,
                name: String::new(),
            }]
        );
    }

    #[test]
    fn test_truncate_name_respects_char_boundary() {
        let name = "é".repeat(200);
        let cut = truncate_name(name);
        assert!(cut.len() <= MAX_REMOTE_NAME_LEN);
        assert_eq!(cut.len(), 248);
    }
}
