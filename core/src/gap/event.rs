//! Inbound events and outbound notifications of the GAP subsystem.

use super::inquiry::InquiryRecord;
use super::timer::TimerKind;
use super::topology::LinkRole;
use crate::address::{AddrType, BdAddr};
use crate::hci::{BigInfoReport, SyncTransferReceived};
use serde::{Deserialize, Serialize};

/// Everything that re-enters the subsystem: controller events, collaborator
/// completions and timer expiries. Processed one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GapEvent {
    /// Raw LE meta event; `params` excludes the subevent code
    LeMeta {
        subevent: u8,
        #[serde(with = "hex_bytes")]
        params: Vec<u8>,
    },
    AdvEnableComplete {
        status: u8,
    },
    /// High duty cycle directed advertising ended without a connection
    DirectedAdvTimeout,
    LinkUp {
        role: LinkRole,
        peer: BdAddr,
    },
    LinkDown {
        role: LinkRole,
        peer: BdAddr,
    },
    /// Command status of a PAST transfer or set-info transfer
    PastCommandComplete {
        conn_handle: u16,
        status: u8,
    },
    RemoteNameResponse {
        peer: BdAddr,
        status: u8,
        name: String,
    },
    FeatureDiscoveryComplete {
        peer: BdAddr,
        status: u8,
        #[serde(default)]
        features: Option<u16>,
        #[serde(default)]
        network: Option<u8>,
        #[serde(default)]
        version: Option<u16>,
    },
    TimerExpired {
        kind: TimerKind,
        generation: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub record: InquiryRecord,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum GapNotification {
    ObserveResult(ScanResult),
    InquiryResult(ScanResult),
    OpportunisticResult(ScanResult),
    ObserveComplete,
    InquiryComplete {
        num_responses: u16,
    },
    SyncStarted {
        status: u8,
        sync_handle: u16,
        sid: u8,
        addr_type: AddrType,
        addr: BdAddr,
        phy: u8,
        interval: u16,
    },
    SyncReport {
        sync_handle: u16,
        tx_power: i8,
        rssi: i8,
        data_status: u8,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    SyncLost {
        sync_handle: u16,
    },
    BigInfo(BigInfoReport),
    SyncTransferComplete {
        status: u8,
        peer: BdAddr,
    },
    SyncTransferReceived(SyncTransferReceived),
    RemoteNameComplete {
        peer: BdAddr,
        status: u8,
        name: String,
    },
    PeerFeaturesDiscovered {
        peer: BdAddr,
        status: u8,
        features: u16,
        version: u16,
    },
}

/// Byte buffers as lowercase hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}
