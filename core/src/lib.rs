// LE GAP engine: advertising modes, scanning, topology gating and periodic sync
//
// Everything runs in one serialized dispatch context. Controller events,
// collaborator completions and timer expiries re-enter through
// `GapSubsystem::dispatch`; nothing here blocks.

pub mod address;
pub mod config;
pub mod gap;
pub mod hci;
pub mod runtime;
pub mod sdp;

use serde::Serialize;
use thiserror::Error;

pub use address::{AddrType, BdAddr, TypedAddr};
pub use config::{ConfigError, GapConfig, PrivacyMode};
pub use gap::{
    Connectability, Discoverability, GapEvent, GapNotification, GapRole, GapSubsystem, LinkRole,
    SyncError, TimerKind, TopologyError,
};
pub use hci::{ControllerCapabilities, HciCommand, HciParseError, HciSink, RecordingSink};
pub use runtime::GapRuntime;
pub use sdp::DiscoveryError;

// ============================================================================
// STATUS & ERROR TYPES
// ============================================================================

/// Status reported to upper layers for a synchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    /// Accepted; the outcome arrives later as a notification
    Started,
    Success,
    Busy,
    IllegalValue,
    WrongMode,
    NoResources,
    ModeUnsupported,
    UnknownAddress,
    ProcessingError,
}

/// Error taxonomy shared by synchronous failures and asynchronous statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProtocolMalformed,
    ResourceExhausted,
    UnsupportedCombination,
    Busy,
    Timeout,
    PeerUnsupported,
    IllegalValue,
    WrongMode,
}

impl ErrorKind {
    /// Classify a non-success HCI status carried in a notification
    pub fn for_hci_status(status: u8) -> Option<ErrorKind> {
        match status {
            hci::HCI_SUCCESS => None,
            hci::HCI_ERR_ADVERTISING_TIMEOUT | hci::HCI_ERR_HOST_TIMEOUT => Some(ErrorKind::Timeout),
            hci::HCI_ERR_COMMAND_DISALLOWED => Some(ErrorKind::UnsupportedCombination),
            _ => Some(ErrorKind::WrongMode),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GapError {
    #[error("Malformed controller input: {0}")]
    Malformed(#[from] HciParseError),
    #[error("Topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("Periodic sync: {0}")]
    Sync(#[from] SyncError),
    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Feature discovery: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Busy: {0}")]
    Busy(&'static str),
    #[error("Illegal value: {0}")]
    IllegalValue(String),
    #[error("Wrong mode: {0}")]
    WrongMode(String),
    #[error("No connection to {0}")]
    UnknownAddress(BdAddr),
    #[error("{0} does not support the operation")]
    PeerUnsupported(BdAddr),
    #[error("Out of resources: {0}")]
    NoResources(&'static str),
    #[error("Cannot process: {0}")]
    Processing(String),
}

impl GapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GapError::Malformed(_) => ErrorKind::ProtocolMalformed,
            GapError::Topology(TopologyError::IllegalRequest(_)) => ErrorKind::IllegalValue,
            GapError::Topology(_) => ErrorKind::UnsupportedCombination,
            GapError::Sync(SyncError::Duplicate { .. }) => ErrorKind::Busy,
            GapError::Sync(_) => ErrorKind::ResourceExhausted,
            GapError::Config(_) => ErrorKind::IllegalValue,
            GapError::Discovery(DiscoveryError::RegistrationFailed) => ErrorKind::ResourceExhausted,
            GapError::Discovery(DiscoveryError::NotRegistered) => ErrorKind::WrongMode,
            GapError::Discovery(_) => ErrorKind::Busy,
            GapError::Busy(_) => ErrorKind::Busy,
            GapError::IllegalValue(_) | GapError::UnknownAddress(_) => ErrorKind::IllegalValue,
            GapError::WrongMode(_) | GapError::Processing(_) => ErrorKind::WrongMode,
            GapError::PeerUnsupported(_) => ErrorKind::PeerUnsupported,
            GapError::NoResources(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Status code an upper layer sees for this failure
    pub fn status(&self) -> GapStatus {
        match self {
            GapError::Malformed(_) => GapStatus::IllegalValue,
            GapError::Topology(TopologyError::IllegalRequest(_)) => GapStatus::IllegalValue,
            GapError::Topology(_) => GapStatus::WrongMode,
            GapError::Sync(SyncError::Duplicate { .. }) => GapStatus::Busy,
            GapError::Sync(_) => GapStatus::NoResources,
            GapError::Config(_) => GapStatus::IllegalValue,
            GapError::Discovery(DiscoveryError::RegistrationFailed) => GapStatus::NoResources,
            GapError::Discovery(DiscoveryError::NotRegistered) => GapStatus::WrongMode,
            GapError::Discovery(_) => GapStatus::Busy,
            GapError::Busy(_) => GapStatus::Busy,
            GapError::IllegalValue(_) => GapStatus::IllegalValue,
            GapError::WrongMode(_) => GapStatus::WrongMode,
            GapError::UnknownAddress(_) => GapStatus::UnknownAddress,
            GapError::PeerUnsupported(_) => GapStatus::ModeUnsupported,
            GapError::NoResources(_) => GapStatus::NoResources,
            GapError::Processing(_) => GapStatus::ProcessingError,
        }
    }
}

impl From<anyhow::Error> for GapError {
    fn from(err: anyhow::Error) -> Self {
        GapError::Processing(err.to_string())
    }
}

/// Outcome of a synchronous GAP operation
pub type GapResult = Result<GapStatus, GapError>;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`. Safe to call more than once.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .try_init();
}
