// Replay traces for legap-cli
//
// A trace is a JSON array of steps. Each step is an operation, a controller
// event, or a timer to fire:
//
//   [
//     {"op": "start_observe", "duration_secs": 0},
//     {"event": "le_meta", "subevent": 2, "params": "0103..."},
//     {"fire": "observe"}
//   ]

use anyhow::{Context, Result};
use legap_core::hci::ScanType;
use legap_core::{
    AddrType, BdAddr, Connectability, Discoverability, GapEvent, GapResult, GapSubsystem,
    PrivacyMode, TimerKind, TypedAddr,
};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    SetDiscoverability {
        mode: Discoverability,
    },
    SetConnectability {
        mode: Connectability,
    },
    SetDirectedTarget {
        peer: BdAddr,
        #[serde(default)]
        addr_type: AddrType,
        #[serde(default)]
        low_duty: bool,
    },
    ClearDirectedTarget,
    ConfigurePrivacy {
        privacy: PrivacyMode,
    },
    SetAdvPayload {
        #[serde(with = "hex_string")]
        payload: Vec<u8>,
    },
    SetScanParams {
        interval: u16,
        window: u16,
        scan_type: ScanType,
    },
    StartObserve {
        #[serde(default)]
        duration_secs: u16,
    },
    StopObserve,
    StartInquiry {
        #[serde(default)]
        duration_secs: u16,
    },
    StopInquiry,
    ReadRemoteName {
        peer: BdAddr,
    },
    CancelRemoteName {
        peer: BdAddr,
    },
    StartPeriodicSync {
        sid: u8,
        addr: BdAddr,
        #[serde(default)]
        skip: u16,
        timeout: u16,
    },
    StopPeriodicSync {
        sync_handle: u16,
    },
    CancelPeriodicSync {
        sid: u8,
        addr: BdAddr,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Op(Operation),
    Fire { fire: TimerKind },
    Event(GapEvent),
}

pub fn load(path: &Path) -> Result<Vec<Step>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trace {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid trace {}", path.display()))
}

impl Operation {
    pub fn apply(self, gap: &mut GapSubsystem) -> Option<GapResult> {
        let result = match self {
            Operation::SetDiscoverability { mode } => gap.set_discoverability(mode),
            Operation::SetConnectability { mode } => gap.set_connectability(mode),
            Operation::SetDirectedTarget {
                peer,
                addr_type,
                low_duty,
            } => {
                gap.set_directed_target(TypedAddr::new(peer, addr_type), low_duty);
                return None;
            }
            Operation::ClearDirectedTarget => {
                gap.clear_directed_target();
                return None;
            }
            Operation::ConfigurePrivacy { privacy } => {
                gap.configure_privacy(privacy);
                return None;
            }
            Operation::SetAdvPayload { payload } => {
                gap.set_adv_payload(payload);
                return None;
            }
            Operation::SetScanParams {
                interval,
                window,
                scan_type,
            } => gap.set_scan_params(interval, window, scan_type),
            Operation::StartObserve { duration_secs } => gap.start_observe(duration_secs),
            Operation::StopObserve => gap.stop_observe(),
            Operation::StartInquiry { duration_secs } => gap.start_inquiry(duration_secs),
            Operation::StopInquiry => gap.stop_inquiry(),
            Operation::ReadRemoteName { peer } => gap.read_remote_name(peer),
            Operation::CancelRemoteName { peer } => gap.cancel_remote_name(peer),
            Operation::StartPeriodicSync {
                sid,
                addr,
                skip,
                timeout,
            } => gap.start_periodic_sync(sid, addr, skip, timeout),
            Operation::StopPeriodicSync { sync_handle } => gap.stop_periodic_sync(sync_handle),
            Operation::CancelPeriodicSync { sid, addr } => gap.cancel_periodic_sync(sid, addr),
        };
        Some(result)
    }
}

mod hex_string {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}
