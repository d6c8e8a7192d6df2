//! Controller topology gate.
//!
//! Tracks which GAP roles are running and refuses a new role unless the
//! controller's LE Supported States vector allows it alongside every role
//! already active.

use crate::hci::{AdvEventType, ControllerCapabilities};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// Table entry for a combination no controller may run
pub const UNSUPPORTED: u8 = 0xFF;

const U: u8 = UNSUPPORTED;

/// Number of roles, and rows/columns of [`COMBO_TABLE`] past the first row
pub const ROLE_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapRole {
    ConnAdv = 1,
    Init = 2,
    Central = 3,
    Peripheral = 4,
    LoDutyDirAdv = 5,
    HiDutyDirAdv = 6,
    NonConnAdv = 7,
    PassiveScan = 8,
    ActiveScan = 9,
    ScanAdv = 10,
}

impl GapRole {
    pub const ALL: [GapRole; ROLE_COUNT] = [
        GapRole::ConnAdv,
        GapRole::Init,
        GapRole::Central,
        GapRole::Peripheral,
        GapRole::LoDutyDirAdv,
        GapRole::HiDutyDirAdv,
        GapRole::NonConnAdv,
        GapRole::PassiveScan,
        GapRole::ActiveScan,
        GapRole::ScanAdv,
    ];

    pub fn mask(self) -> u16 {
        1 << (self as u16 - 1)
    }

    /// Zero-based column in [`COMBO_TABLE`]
    fn index(self) -> usize {
        self as usize - 1
    }

    /// Advertising role for an advertising PDU type
    pub fn for_adv_event(event_type: AdvEventType) -> GapRole {
        match event_type {
            AdvEventType::ConnectUndirected => GapRole::ConnAdv,
            AdvEventType::ConnectDirected => GapRole::HiDutyDirAdv,
            AdvEventType::ConnectLowDutyDirected => GapRole::LoDutyDirAdv,
            AdvEventType::Discoverable => GapRole::ScanAdv,
            AdvEventType::NonConnectable => GapRole::NonConnAdv,
        }
    }
}

pub const ALL_ADV_MASK: u16 = (1 << (GapRole::ConnAdv as u16 - 1))
    | (1 << (GapRole::LoDutyDirAdv as u16 - 1))
    | (1 << (GapRole::HiDutyDirAdv as u16 - 1))
    | (1 << (GapRole::NonConnAdv as u16 - 1))
    | (1 << (GapRole::ScanAdv as u16 - 1));
pub const ALL_SCAN_MASK: u16 =
    (1 << (GapRole::PassiveScan as u16 - 1)) | (1 << (GapRole::ActiveScan as u16 - 1));
pub const ALL_CONN_MASK: u16 =
    (1 << (GapRole::Central as u16 - 1)) | (1 << (GapRole::Peripheral as u16 - 1));
pub const ALL_MASK: u16 = (1 << ROLE_COUNT) - 1;

/// LE Supported States bit required for each role alone (row 0) and for each
/// pair of roles (row = requested role, column = active role).
pub const COMBO_TABLE: [[u8; ROLE_COUNT]; ROLE_COUNT + 1] = [
    // single state
    [2, 6, 6, 7, U, 3, 0, 4, 5, 1],
    // conn adv
    [U, 32, 35, 38, U, U, U, 10, 14, U],
    // init
    [32, U, 28, 41, 34, 33, 16, 22, 23, 17],
    // central
    [35, 28, 28, 32, 37, 36, 18, 24, 25, 19],
    // peripheral
    [38, 41, 41, 38, 40, 39, 20, 26, 27, 21],
    // low duty directed adv
    [U, 34, 37, 40, U, U, U, U, U, U],
    // high duty directed adv
    [U, 33, 36, 39, U, U, U, 11, 15, U],
    // non-connectable adv
    [U, 16, 18, 20, U, U, U, 8, 12, U],
    // passive scan
    [10, 22, 24, 26, U, 11, 8, U, U, 9],
    // active scan
    [14, 23, 25, 27, U, 15, 12, U, U, 13],
    // scannable adv
    [U, 17, 19, 21, U, U, U, 9, 13, U],
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Illegal state request mask 0x{0:04x}")]
    IllegalRequest(u16),
    #[error("Controller does not support {0:?}")]
    StateUnsupported(GapRole),
    #[error("{requested:?} cannot run alongside {active:?}")]
    CombinationUnsupported { requested: GapRole, active: GapRole },
    #[error("Controller does not support {requested:?} alongside {active:?} (state bit {bit})")]
    CombinationNotInController {
        requested: GapRole,
        active: GapRole,
        bit: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    current: u16,
    central_links: u16,
    peripheral_links: u16,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask(&self) -> u16 {
        self.current
    }

    pub fn is_active(&self, role: GapRole) -> bool {
        self.current & role.mask() != 0
    }

    pub fn active_roles(&self) -> Vec<GapRole> {
        GapRole::ALL
            .iter()
            .copied()
            .filter(|r| self.is_active(*r))
            .collect()
    }

    /// Validate a raw request mask. Exactly one role bit must be set.
    pub fn check_mask(
        &self,
        caps: &ControllerCapabilities,
        request_mask: u16,
    ) -> Result<(), TopologyError> {
        if request_mask == 0 || request_mask > ALL_MASK || !request_mask.is_power_of_two() {
            error!("Illegal state requested: 0x{:04x}", request_mask);
            return Err(TopologyError::IllegalRequest(request_mask));
        }
        let position = request_mask.trailing_zeros() as usize;
        self.check(caps, GapRole::ALL[position])
    }

    /// Would `requested` be allowed next to every currently active role
    pub fn check(
        &self,
        caps: &ControllerCapabilities,
        requested: GapRole,
    ) -> Result<(), TopologyError> {
        let single = COMBO_TABLE[0][requested.index()];
        if single == UNSUPPORTED || !caps.supports_state(single) {
            error!("State requested not supported: {:?}", requested);
            return Err(TopologyError::StateUnsupported(requested));
        }

        let row = &COMBO_TABLE[requested as usize];
        for active in self.active_roles() {
            let bit = row[active.index()];
            if bit == UNSUPPORTED {
                debug!("{:?} refused: incompatible with {:?}", requested, active);
                return Err(TopologyError::CombinationUnsupported { requested, active });
            }
            if !caps.supports_state(bit) {
                debug!("{:?} refused: state bit {} missing for {:?}", requested, bit, active);
                return Err(TopologyError::CombinationNotInController {
                    requested,
                    active,
                    bit,
                });
            }
        }
        Ok(())
    }

    /// Check and, on approval, mark the role active
    pub fn request(
        &mut self,
        caps: &ControllerCapabilities,
        role: GapRole,
    ) -> Result<(), TopologyError> {
        self.check(caps, role)?;
        self.set(role);
        Ok(())
    }

    pub fn set(&mut self, role: GapRole) {
        self.current |= role.mask();
    }

    pub fn clear(&mut self, role: GapRole) {
        self.current &= !role.mask();
    }

    pub fn clear_mask(&mut self, mask: u16) {
        self.current &= !(mask & ALL_MASK);
    }

    pub fn link_count(&self, role: LinkRole) -> u16 {
        match role {
            LinkRole::Central => self.central_links,
            LinkRole::Peripheral => self.peripheral_links,
        }
    }

    /// Adjust the link counters and rebuild the connection role bits. A new
    /// peripheral link means the controller stopped advertising, so every
    /// advertising role is cleared too; the return value reports that case.
    pub fn update_link(&mut self, role: LinkRole, increase: bool) -> bool {
        self.clear_mask(ALL_CONN_MASK);

        let counter = match role {
            LinkRole::Central => &mut self.central_links,
            LinkRole::Peripheral => &mut self.peripheral_links,
        };
        if increase {
            *counter = counter.saturating_add(1);
        } else {
            *counter = counter.saturating_sub(1);
        }

        if self.central_links > 0 {
            self.set(GapRole::Central);
        }
        if self.peripheral_links > 0 {
            self.set(GapRole::Peripheral);
        }

        if role == LinkRole::Peripheral && increase {
            self.clear_mask(ALL_ADV_MASK);
            return true;
        }
        false
    }
}
