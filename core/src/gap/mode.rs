//! Discoverability / connectability state machine for legacy advertising.
//!
//! Every mode change recomputes the advertising PDU type, own and peer
//! address, interval and AD flags, then rewrites the controller state only
//! where it differs from what is already programmed.

use super::ad::{self, LocalAdvData};
use super::timer::TimerKind;
use super::topology::{GapRole, ALL_ADV_MASK};
use super::Radio;
use crate::address::{AddrType, BdAddr, TypedAddr};
use crate::config::PrivacyMode;
use crate::hci::{AdvEventType, HciCommand, IdentityResolver, HCI_SUCCESS};
use crate::{GapError, GapResult, GapStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// Advertising intervals, 0.625 ms units
pub const ADV_FAST_INT_1: u16 = 48;
pub const ADV_FAST_INT_2: u16 = 160;
pub const ADV_SLOW_INT: u16 = 2048;
pub const ADV_DIR_MIN_INT: u16 = 400;
pub const ADV_DIR_MAX_INT: u16 = 800;

pub const ADV_CHANNEL_MAP_ALL: u8 = 0x07;
/// Advertising filter policy: process scan and connect requests from anyone
pub const ADV_FILTER_ALLOW_ALL: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discoverability {
    #[default]
    NonDiscoverable,
    Limited,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectability {
    #[default]
    NonConnectable,
    Connectable,
}

/// What the next Write Advertising Parameters would carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdvTarget {
    event_type: AdvEventType,
    own_addr_type: AddrType,
    peer: TypedAddr,
}

fn adv_interval(event_type: AdvEventType) -> (u16, u16) {
    match event_type {
        AdvEventType::ConnectUndirected | AdvEventType::ConnectDirected => {
            (ADV_FAST_INT_1, ADV_FAST_INT_1)
        }
        AdvEventType::NonConnectable | AdvEventType::Discoverable => {
            (ADV_FAST_INT_2, ADV_FAST_INT_2)
        }
        AdvEventType::ConnectLowDutyDirected => (ADV_DIR_MIN_INT, ADV_DIR_MAX_INT),
    }
}

#[derive(Debug)]
pub struct ModeController {
    discoverable: Discoverability,
    connectable: Connectability,
    classic_discoverable: bool,
    classic_connectable: bool,
    /// Scan response data is configured
    scan_rsp: bool,
    directed_conn: AdvEventType,
    direct_target: Option<TypedAddr>,
    /// PDU type and own address last written to the controller
    evt_type: AdvEventType,
    adv_addr_type: AddrType,
    adv_enabled: bool,
    fast_adv_on: bool,
    filter_policy: u8,
    privacy: PrivacyMode,
    adv_data: LocalAdvData,
}

impl ModeController {
    pub fn new(privacy: PrivacyMode) -> Self {
        Self {
            discoverable: Discoverability::NonDiscoverable,
            connectable: Connectability::NonConnectable,
            classic_discoverable: false,
            classic_connectable: false,
            scan_rsp: false,
            directed_conn: AdvEventType::ConnectUndirected,
            direct_target: None,
            evt_type: AdvEventType::NonConnectable,
            adv_addr_type: AddrType::Public,
            adv_enabled: false,
            fast_adv_on: false,
            filter_policy: ADV_FILTER_ALLOW_ALL,
            privacy,
            adv_data: LocalAdvData::new(),
        }
    }

    pub fn discoverability(&self) -> Discoverability {
        self.discoverable
    }

    pub fn connectability(&self) -> Connectability {
        self.connectable
    }

    pub fn is_advertising(&self) -> bool {
        self.adv_enabled
    }

    pub fn event_type(&self) -> AdvEventType {
        self.evt_type
    }

    pub fn adv_data(&self) -> &LocalAdvData {
        &self.adv_data
    }

    pub fn set_classic_modes(&mut self, discoverable: bool, connectable: bool) {
        self.classic_discoverable = discoverable;
        self.classic_connectable = connectable;
    }

    pub fn set_scan_response(&mut self, configured: bool) {
        self.scan_rsp = configured;
    }

    pub fn set_adv_filter_policy(&mut self, policy: u8) {
        self.filter_policy = policy;
    }

    pub fn set_adv_payload(&mut self, payload: Vec<u8>) {
        self.adv_data.set_payload(payload);
    }

    pub fn configure_privacy(&mut self, privacy: PrivacyMode) {
        info!("Privacy mode set to {:?}", privacy);
        self.privacy = privacy;
    }

    /// Use directed advertising towards `peer` the next time connectable
    /// advertising is (re)programmed
    pub fn set_directed_target(&mut self, peer: TypedAddr, low_duty: bool) {
        self.directed_conn = if low_duty {
            AdvEventType::ConnectLowDutyDirected
        } else {
            AdvEventType::ConnectDirected
        };
        self.direct_target = Some(peer);
    }

    pub fn clear_directed_target(&mut self) {
        self.directed_conn = AdvEventType::ConnectUndirected;
        self.direct_target = None;
    }

    fn base_own_addr_type(&self) -> AddrType {
        match self.privacy {
            PrivacyMode::None => AddrType::Public,
            _ => AddrType::Random,
        }
    }

    fn select_target(&self, resolver: &dyn IdentityResolver) -> AdvTarget {
        let mut own_addr_type = self.base_own_addr_type();
        let mut peer = TypedAddr::new(BdAddr::EMPTY, AddrType::Public);

        let mut event_type = match self.connectable {
            Connectability::NonConnectable if self.scan_rsp => AdvEventType::Discoverable,
            Connectability::NonConnectable => AdvEventType::NonConnectable,
            Connectability::Connectable => self.directed_conn,
        };

        if matches!(
            event_type,
            AdvEventType::ConnectDirected | AdvEventType::ConnectLowDutyDirected
        ) {
            match self.direct_target {
                Some(target) => {
                    if matches!(self.privacy, PrivacyMode::Privacy12 | PrivacyMode::Mixed) {
                        if let Some(identity) = resolver.resolving_list_identity(&target.addr) {
                            return AdvTarget {
                                event_type,
                                own_addr_type: AddrType::RandomId,
                                peer: identity,
                            };
                        }
                    }
                    return AdvTarget {
                        event_type,
                        own_addr_type,
                        peer: target,
                    };
                }
                None => {
                    warn!("Directed advertising without a target, using undirected");
                    event_type = AdvEventType::ConnectUndirected;
                }
            }
        }

        let use_resolving_list = match self.privacy {
            PrivacyMode::Privacy12 => self.filter_policy != ADV_FILTER_ALLOW_ALL,
            PrivacyMode::Mixed => true,
            _ => false,
        };
        if use_resolving_list {
            match resolver.first_resolving_list_entry() {
                Some(entry) => {
                    peer = entry;
                    own_addr_type = AddrType::RandomId;
                }
                None => own_addr_type = AddrType::Random,
            }
        }

        AdvTarget {
            event_type,
            own_addr_type,
            peer,
        }
    }

    fn compute_flags(&self, simultaneous_le_bredr: bool) -> u8 {
        let mut flags = self.adv_data.flags().unwrap_or(0);

        if !self.classic_discoverable && !self.classic_connectable {
            flags |= ad::FLAG_BREDR_NOT_SUPPORTED;
        } else {
            flags &= !ad::FLAG_BREDR_NOT_SUPPORTED;
        }

        let dmt = ad::FLAG_SIMULTANEOUS_CONTROLLER | ad::FLAG_SIMULTANEOUS_HOST;
        if simultaneous_le_bredr {
            flags |= dmt;
        } else {
            flags &= !dmt;
        }

        match self.discoverable {
            Discoverability::Limited => {
                flags &= !ad::FLAG_LE_GENERAL_DISC;
                flags |= ad::FLAG_LE_LIMITED_DISC;
            }
            Discoverability::General => {
                flags |= ad::FLAG_LE_GENERAL_DISC;
                flags &= !ad::FLAG_LE_LIMITED_DISC;
            }
            Discoverability::NonDiscoverable => {
                flags &= !(ad::FLAG_LE_LIMITED_DISC | ad::FLAG_LE_GENERAL_DISC);
            }
        }
        flags
    }

    fn update_adv_flags(&mut self, radio: &mut Radio) {
        let old = self.adv_data.flags().unwrap_or(0);
        let flags = self.compute_flags(radio.caps.simultaneous_le_bredr);
        if flags != old {
            debug!("Advertising flags 0x{:02x} -> 0x{:02x}", old, flags);
            self.adv_data.set_flags(flags);
            radio.send(HciCommand::SetAdvData {
                data: self.adv_data.bytes().to_vec(),
            });
        }
    }

    fn write_params(&mut self, radio: &mut Radio, interval: (u16, u16), target: &AdvTarget) {
        radio.send(HciCommand::WriteAdvParams {
            interval_min: interval.0,
            interval_max: interval.1,
            event_type: target.event_type,
            own_addr_type: target.own_addr_type,
            peer_addr_type: target.peer.addr_type,
            peer_addr: target.peer.addr,
            channel_map: ADV_CHANNEL_MAP_ALL,
            filter_policy: self.filter_policy,
        });
        self.evt_type = target.event_type;
        self.adv_addr_type = target.own_addr_type;
    }

    fn start_adv(&mut self, radio: &mut Radio) -> Result<(), GapError> {
        let role = GapRole::for_adv_event(self.evt_type);
        radio.topology.request(&radio.caps, role)?;
        radio.send(HciCommand::SetAdvEnable { enable: true });
        self.adv_enabled = true;
        Ok(())
    }

    fn stop_adv(&mut self, radio: &mut Radio) {
        if self.adv_enabled {
            radio.send(HciCommand::SetAdvEnable { enable: false });
            self.fast_adv_on = false;
            self.adv_enabled = false;
            radio.topology.clear_mask(ALL_ADV_MASK);
        }
    }

    /// Bring the controller in line with the current mode pair
    fn apply(&mut self, radio: &mut Radio, resolver: &dyn IdentityResolver) -> Result<(), GapError> {
        let target = self.select_target(resolver);
        let enable = !(self.connectable == Connectability::NonConnectable
            && self.discoverable == Discoverability::NonDiscoverable);
        let interval = adv_interval(target.event_type);

        radio.timers.cancel(TimerKind::FastAdv);

        if enable {
            self.update_adv_flags(radio);
            if target.event_type != self.evt_type
                || target.own_addr_type != self.adv_addr_type
                || !self.fast_adv_on
            {
                self.stop_adv(radio);
                self.write_params(radio, interval, &target);
            }
        }

        let mut result = Ok(());
        if self.adv_enabled != enable {
            if enable {
                result = self.start_adv(radio);
            } else {
                self.stop_adv(radio);
            }
        }

        if self.adv_enabled {
            self.fast_adv_on = true;
            radio
                .timers
                .arm(TimerKind::FastAdv, radio.config.fast_adv_timeout());
        }
        result
    }

    pub(crate) fn set_discoverability(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        mode: Discoverability,
    ) -> GapResult {
        debug!("Set discoverability {:?}", mode);
        self.discoverable = mode;
        self.apply(radio, resolver)?;

        if mode == Discoverability::Limited {
            radio
                .timers
                .arm(TimerKind::LimitedDiscovery, radio.config.limited_disc_timeout());
        } else {
            radio.timers.cancel(TimerKind::LimitedDiscovery);
        }
        Ok(GapStatus::Success)
    }

    pub(crate) fn set_connectability(
        &mut self,
        radio: &mut Radio,
        resolver: &dyn IdentityResolver,
        mode: Connectability,
    ) -> GapResult {
        debug!("Set connectability {:?}", mode);
        self.connectable = mode;
        self.apply(radio, resolver)?;
        Ok(GapStatus::Success)
    }

    /// Fast advertising period over: continue at the slow interval
    pub(crate) fn on_fast_adv_timeout(&mut self, radio: &mut Radio, resolver: &dyn IdentityResolver) {
        if !self.adv_enabled {
            return;
        }
        self.stop_adv(radio);
        let target = self.select_target(resolver);
        self.write_params(radio, (ADV_SLOW_INT, ADV_SLOW_INT), &target);
        if let Err(e) = self.start_adv(radio) {
            warn!("Slow advertising not restarted: {}", e);
        }
    }

    /// Limited discovery window over; only the flags change
    pub(crate) fn on_limited_discovery_timeout(&mut self, radio: &mut Radio) {
        if self.discoverable != Discoverability::Limited {
            return;
        }
        info!("Limited discoverable period ended");
        self.discoverable = Discoverability::NonDiscoverable;
        self.update_adv_flags(radio);
    }

    /// Set Advertising Enable completed. A failure means the controller kept
    /// its previous state.
    pub(crate) fn on_adv_enable_complete(&mut self, radio: &mut Radio, status: u8) {
        if status == HCI_SUCCESS {
            return;
        }
        warn!("Advertising enable/disable failed: status 0x{:02x}", status);
        self.adv_enabled = !self.adv_enabled;
        if self.adv_enabled {
            radio.topology.set(GapRole::for_adv_event(self.evt_type));
        } else {
            radio.topology.clear_mask(ALL_ADV_MASK);
        }
    }

    /// The controller stopped advertising on its own (directed timeout or a
    /// connection as peripheral)
    pub(crate) fn on_adv_stopped_by_controller(&mut self, radio: &mut Radio) {
        self.adv_enabled = false;
        self.directed_conn = AdvEventType::ConnectUndirected;
        radio.topology.clear_mask(ALL_ADV_MASK);
    }

    /// Link state changed: connectable devices go back to advertising
    pub(crate) fn update_mode_operation(&mut self, radio: &mut Radio, resolver: &dyn IdentityResolver) {
        if self.connectable == Connectability::Connectable {
            if let Err(e) = self.apply(radio, resolver) {
                warn!("Could not resume connectable advertising: {}", e);
            }
        }
    }
}
