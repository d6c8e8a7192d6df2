//! HCI boundary: outbound commands, controller capabilities and the host-side
//! collaborators (identity resolution, ACL directory) the GAP engine consults.
//!
//! Everything here is fire-and-forget. Completions come back later as
//! [`crate::gap::GapEvent`]s through the single dispatch context.

pub mod event;

use crate::address::{AddrType, BdAddr, TypedAddr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub use event::{
    AdvEventProps, AdvReport, BigInfoReport, HciParseError, LeMetaEvent, PeriodicReport,
    ReportBatch, SyncEstablished, SyncTransferReceived,
};

// ============================================================================
// STATUS CODES
// ============================================================================

pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_COMMAND_DISALLOWED: u8 = 0x0C;
pub const HCI_ERR_HOST_TIMEOUT: u8 = 0x10;
pub const HCI_ERR_ADVERTISING_TIMEOUT: u8 = 0x3C;
pub const HCI_ERR_OPERATION_CANCELLED_BY_HOST: u8 = 0x44;

/// LE feature bit: Periodic Advertising Sync Transfer - Recipient
pub const LE_FEATURE_PAST_RECIPIENT: u8 = 25;

/// Test a bit in an LE feature or supported-states vector
pub fn bit_is_set(vector: &[u8; 8], bit: u8) -> bool {
    let byte = usize::from(bit / 8);
    byte < vector.len() && vector[byte] & (1 << (bit % 8)) != 0
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Advertising PDU type written with the advertising parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvEventType {
    ConnectUndirected = 0x00,
    ConnectDirected = 0x01,
    Discoverable = 0x02,
    NonConnectable = 0x03,
    ConnectLowDutyDirected = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Passive = 0x00,
    Active = 0x01,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HciCommand {
    WriteAdvParams {
        interval_min: u16,
        interval_max: u16,
        event_type: AdvEventType,
        own_addr_type: AddrType,
        peer_addr_type: AddrType,
        peer_addr: BdAddr,
        channel_map: u8,
        filter_policy: u8,
    },
    SetAdvEnable {
        enable: bool,
    },
    SetAdvData {
        data: Vec<u8>,
    },
    SetScanParams {
        scan_type: ScanType,
        interval: u16,
        window: u16,
        own_addr_type: AddrType,
        filter_policy: u8,
    },
    SetScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },
    PeriodicCreateSync {
        options: u8,
        sid: u8,
        addr_type: AddrType,
        addr: BdAddr,
        skip: u16,
        timeout: u16,
        cte_type: u8,
    },
    PeriodicCreateSyncCancel,
    PeriodicTerminateSync {
        sync_handle: u16,
    },
    PeriodicSyncTransfer {
        conn_handle: u16,
        service_data: u16,
        sync_handle: u16,
    },
    PeriodicSetInfoTransfer {
        conn_handle: u16,
        service_data: u16,
        adv_handle: u8,
    },
    SetPastParams {
        conn_handle: u16,
        mode: u8,
        skip: u16,
        timeout: u16,
        cte_type: u8,
    },
}

/// Outbound command transport. Sending never blocks and never fails
/// synchronously; the controller answers through a later event.
pub trait HciSink: Send {
    fn send(&mut self, command: HciCommand);
}

/// Sink that keeps every command, shared so a caller can inspect it after the
/// sink has been handed to the subsystem.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<HciCommand>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<HciCommand> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<HciCommand> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn count(&self, matcher: impl Fn(&HciCommand) -> bool) -> usize {
        self.sent.lock().iter().filter(|c| matcher(c)).count()
    }
}

impl HciSink for RecordingSink {
    fn send(&mut self, command: HciCommand) {
        debug!("HCI <- {:?}", command);
        self.sent.lock().push(command);
    }
}

// ============================================================================
// CONTROLLER CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerCapabilities {
    pub supports_ble: bool,
    /// LE Supported States bit vector as read from the controller
    pub le_supported_states: [u8; 8],
    pub simultaneous_le_bredr: bool,
    /// Scan interval/window may go up to 0xFFFF
    pub extended_scan: bool,
    pub privacy_supported: bool,
    pub max_adv_instances: u8,
    pub max_filters: u8,
}

impl Default for ControllerCapabilities {
    fn default() -> Self {
        Self {
            supports_ble: true,
            // bits 0..=41 are defined
            le_supported_states: [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x03, 0x00, 0x00],
            simultaneous_le_bredr: false,
            extended_scan: false,
            privacy_supported: true,
            max_adv_instances: 1,
            max_filters: 0,
        }
    }
}

impl ControllerCapabilities {
    pub fn supports_state(&self, bit: u8) -> bool {
        bit_is_set(&self.le_supported_states, bit)
    }

    /// Clear one LE supported-states bit
    pub fn without_state(mut self, bit: u8) -> Self {
        let byte = usize::from(bit / 8);
        if byte < self.le_supported_states.len() {
            self.le_supported_states[byte] &= !(1 << (bit % 8));
        }
        self
    }

    pub fn max_scan_param(&self) -> u16 {
        if self.extended_scan {
            0xFFFF
        } else {
            0x4000
        }
    }
}

// ============================================================================
// HOST COLLABORATORS
// ============================================================================

/// Identity resolution backed by the security database
#[cfg_attr(test, mockall::automock)]
pub trait IdentityResolver: Send {
    /// Address an advertising report should be keyed by. `None` keeps the
    /// received address.
    fn resolve_report_address(&self, addr: &BdAddr, addr_type: AddrType) -> Option<TypedAddr>;

    /// Identity of a bonded peer that has a controller resolving-list entry
    fn resolving_list_identity(&self, peer: &BdAddr) -> Option<TypedAddr>;

    /// Any bonded device currently in the controller resolving list
    fn first_resolving_list_entry(&self) -> Option<TypedAddr>;

    /// Pseudo (random) address of a bonded peer to its identity address
    fn identity_of(&self, pseudo: &BdAddr) -> Option<TypedAddr>;

    /// Identity address back to the pseudo address upper layers know
    fn pseudo_of(&self, identity: &BdAddr) -> Option<TypedAddr>;
}

/// Resolver with an empty bond table
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBonds;

impl IdentityResolver for NoBonds {
    fn resolve_report_address(&self, _addr: &BdAddr, _addr_type: AddrType) -> Option<TypedAddr> {
        None
    }

    fn resolving_list_identity(&self, _peer: &BdAddr) -> Option<TypedAddr> {
        None
    }

    fn first_resolving_list_entry(&self) -> Option<TypedAddr> {
        None
    }

    fn identity_of(&self, _pseudo: &BdAddr) -> Option<TypedAddr> {
        None
    }

    fn pseudo_of(&self, _identity: &BdAddr) -> Option<TypedAddr> {
        None
    }
}

/// LE ACL links known to the connection manager
#[cfg_attr(test, mockall::automock)]
pub trait AclDirectory: Send {
    fn le_connection_handle(&self, peer: &BdAddr) -> Option<u16>;

    fn peer_le_features(&self, peer: &BdAddr) -> Option<[u8; 8]>;

    /// Start a GATT device-name read. `false` if it could not be started.
    fn request_device_name(&mut self, peer: &BdAddr) -> bool;

    fn cancel_device_name(&mut self, peer: &BdAddr) -> bool;
}

#[derive(Debug, Clone)]
struct LinkInfo {
    conn_handle: u16,
    le_features: [u8; 8],
}

/// In-memory ACL directory
#[derive(Debug, Clone, Default)]
pub struct StaticAclDirectory {
    links: HashMap<BdAddr, LinkInfo>,
}

impl StaticAclDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, peer: BdAddr, conn_handle: u16, le_features: [u8; 8]) {
        self.links.insert(peer, LinkInfo { conn_handle, le_features });
    }

    pub fn remove_link(&mut self, peer: &BdAddr) {
        self.links.remove(peer);
    }
}

impl AclDirectory for StaticAclDirectory {
    fn le_connection_handle(&self, peer: &BdAddr) -> Option<u16> {
        self.links.get(peer).map(|l| l.conn_handle)
    }

    fn peer_le_features(&self, peer: &BdAddr) -> Option<[u8; 8]> {
        self.links.get(peer).map(|l| l.le_features)
    }

    fn request_device_name(&mut self, peer: &BdAddr) -> bool {
        self.links.contains_key(peer)
    }

    fn cancel_device_name(&mut self, peer: &BdAddr) -> bool {
        self.links.contains_key(peer)
    }
}
