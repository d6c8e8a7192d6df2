//! Profile feature records and peer feature discovery over SDP.
//!
//! The local record is created at most once and deleted at most once.
//! Discovered peer features are kept per peer until the link goes down.

use crate::address::BdAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Local supported-features bitmap
pub mod features {
    pub const ECNR: u16 = 0x0001;
    pub const THREE_WAY: u16 = 0x0002;
    pub const CLI: u16 = 0x0004;
    pub const VOICE_RECOGNITION: u16 = 0x0008;
    pub const REMOTE_VOLUME: u16 = 0x0010;
    pub const CODEC: u16 = 0x0080;

    /// Bits that mean the same in the bitmap and in the SDP attribute
    pub const SDP_COMMON_MASK: u16 = 0x001F;
    /// Wide band speech in the SDP attribute
    pub const SDP_CODEC: u16 = 0x0020;

    /// Peer can reject calls (from the SDP network attribute)
    pub const PEER_REJECT: u16 = 0x0020;
    pub const PEER_CODEC: u16 = 0x0200;
}

/// Peer profile version assumed when the record does not carry one (1.1)
pub const DEFAULT_PEER_VERSION: u16 = 0x0101;

/// Network attribute value meaning "ability to reject a call"
const NETWORK_REJECT_CAPABLE: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Profile record already registered (handle 0x{0:08x})")]
    AlreadyRegistered(u32),
    #[error("Profile record registration failed")]
    RegistrationFailed,
    #[error("No profile record registered")]
    NotRegistered,
    #[error("Feature discovery of {0} could not be started")]
    NotStarted(BdAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryRole {
    Initiator,
    Acceptor,
}

/// Service discovery database and client
#[cfg_attr(test, mockall::automock)]
pub trait FeatureDiscovery: Send {
    /// Create a service record; `None` if the database refused it
    fn register_record(&mut self, service_name: &str, features: u16) -> Option<u32>;

    fn unregister_record(&mut self, handle: u32) -> bool;

    /// Start a search of `peer`'s records. The result comes back as
    /// `GapEvent::FeatureDiscoveryComplete`.
    fn discover(&mut self, peer: &BdAddr, role: DiscoveryRole) -> bool;
}

/// In-memory record database; searches always start
#[derive(Debug, Default)]
pub struct SdpDatabase {
    records: HashMap<u32, (String, u16)>,
    next_handle: u32,
}

impl SdpDatabase {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_handle: 0x0001_0000,
        }
    }

    pub fn record(&self, handle: u32) -> Option<(&str, u16)> {
        self.records
            .get(&handle)
            .map(|(name, features)| (name.as_str(), *features))
    }
}

impl FeatureDiscovery for SdpDatabase {
    fn register_record(&mut self, service_name: &str, features: u16) -> Option<u32> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.checked_add(1)?;
        self.records
            .insert(handle, (service_name.to_string(), features));
        Some(handle)
    }

    fn unregister_record(&mut self, handle: u32) -> bool {
        self.records.remove(&handle).is_some()
    }

    fn discover(&mut self, peer: &BdAddr, role: DiscoveryRole) -> bool {
        debug!("SDP search of {} as {:?}", peer, role);
        true
    }
}

/// Bitmap to SDP attribute form: the codec bit moves from bit 7 to bit 5
pub fn local_to_sdp_features(local: u16) -> u16 {
    let mut sdp = local & features::SDP_COMMON_MASK;
    if local & features::CODEC != 0 {
        sdp |= features::SDP_CODEC;
    }
    sdp
}

/// SDP attribute form to peer features
pub fn sdp_to_peer_features(sdp: u16, network: Option<u8>) -> u16 {
    let mut peer = sdp;
    if peer & features::SDP_CODEC != 0 {
        peer = (peer & !features::SDP_CODEC) | features::PEER_CODEC;
    }
    if network == Some(NETWORK_REJECT_CAPABLE) {
        peer |= features::PEER_REJECT;
    }
    peer
}

#[derive(Debug, Default)]
pub struct ProfileRecord {
    handle: Option<u32>,
}

impl ProfileRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    pub fn register(
        &mut self,
        discovery: &mut dyn FeatureDiscovery,
        service_name: &str,
        local_features: u16,
    ) -> Result<u32, DiscoveryError> {
        if let Some(handle) = self.handle {
            return Err(DiscoveryError::AlreadyRegistered(handle));
        }
        let handle = discovery
            .register_record(service_name, local_to_sdp_features(local_features))
            .ok_or(DiscoveryError::RegistrationFailed)?;
        info!("Registered profile record 0x{:08x} ({})", handle, service_name);
        self.handle = Some(handle);
        Ok(handle)
    }

    pub fn unregister(&mut self, discovery: &mut dyn FeatureDiscovery) -> Result<(), DiscoveryError> {
        let handle = self.handle.take().ok_or(DiscoveryError::NotRegistered)?;
        if !discovery.unregister_record(handle) {
            warn!("Profile record 0x{:08x} was already gone", handle);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PeerFeatures {
    pub features: u16,
    pub version: u16,
}

#[derive(Debug, Default)]
pub struct PeerFeatureTable {
    peers: HashMap<BdAddr, PeerFeatures>,
}

impl PeerFeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &BdAddr) -> Option<PeerFeatures> {
        self.peers.get(peer).copied()
    }

    /// Features learned through the in-band channel; they win over SDP
    pub fn set_inband(&mut self, peer: BdAddr, features: u16) {
        self.peers.entry(peer).or_default().features = features;
    }

    /// Fold a completed search into the table and return the result
    pub fn apply_discovery(
        &mut self,
        peer: BdAddr,
        sdp_features: Option<u16>,
        network: Option<u8>,
        version: Option<u16>,
    ) -> PeerFeatures {
        let entry = self.peers.entry(peer).or_default();
        if entry.features == 0 {
            if let Some(sdp) = sdp_features {
                entry.features = sdp_to_peer_features(sdp, network);
            }
        } else {
            debug!("Keeping in-band features 0x{:04x} of {}", entry.features, peer);
        }
        entry.version = version.unwrap_or(DEFAULT_PEER_VERSION);
        *entry
    }

    pub fn remove(&mut self, peer: &BdAddr) {
        self.peers.remove(peer);
    }
}
