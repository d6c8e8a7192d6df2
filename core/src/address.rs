//! Device addresses and LE address types.
//!
//! Addresses are stored most-significant byte first, the way they are printed.
//! HCI carries them little-endian; use [`BdAddr::from_le_slice`] and
//! [`BdAddr::to_le_bytes`] at the wire boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address length: expected 6 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Invalid address string: {0}")]
    InvalidFormat(String),
    #[error("Unknown LE address type: 0x{0:02x}")]
    UnknownType(u8),
}

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const EMPTY: BdAddr = BdAddr([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build an address from its little-endian HCI encoding
    pub fn from_le_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != 6 {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 6];
        for (i, b) in bytes.iter().rev().enumerate() {
            out[i] = *b;
        }
        Ok(Self(out))
    }

    /// Little-endian HCI encoding
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut out = self.0;
        out.reverse();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 6]
    }

    /// True for a resolvable private address (top two bits `01`)
    pub fn is_resolvable_private(&self) -> bool {
        self.0[0] & 0xC0 == 0x40
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| hex::encode([*b])).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for BdAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes =
            hex::decode(&compact).map_err(|e| AddressError::InvalidFormat(format!("{s}: {e}")))?;
        if bytes.len() != 6 {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 6];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl TryFrom<String> for BdAddr {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BdAddr> for String {
    fn from(addr: BdAddr) -> Self {
        addr.to_string()
    }
}

/// LE address type as carried in HCI events and commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrType {
    #[default]
    Public,
    Random,
    /// Public identity resolved by the controller
    PublicId,
    /// Random static identity resolved by the controller
    RandomId,
    /// No address present (extended advertising only)
    Anonymous,
}

impl AddrType {
    pub fn to_raw(self) -> u8 {
        match self {
            AddrType::Public => 0x00,
            AddrType::Random => 0x01,
            AddrType::PublicId => 0x02,
            AddrType::RandomId => 0x03,
            AddrType::Anonymous => 0xFF,
        }
    }

    pub fn is_identity(self) -> bool {
        matches!(self, AddrType::PublicId | AddrType::RandomId)
    }

    /// Clear the identity bit (`PublicId` -> `Public`, `RandomId` -> `Random`)
    pub fn without_identity(self) -> Self {
        match self {
            AddrType::PublicId => AddrType::Public,
            AddrType::RandomId => AddrType::Random,
            other => other,
        }
    }
}

impl TryFrom<u8> for AddrType {
    type Error = AddressError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0x00 => Ok(AddrType::Public),
            0x01 => Ok(AddrType::Random),
            0x02 => Ok(AddrType::PublicId),
            0x03 => Ok(AddrType::RandomId),
            0xFF => Ok(AddrType::Anonymous),
            other => Err(AddressError::UnknownType(other)),
        }
    }
}

/// Address paired with its LE type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypedAddr {
    pub addr: BdAddr,
    pub addr_type: AddrType,
}

impl TypedAddr {
    pub fn new(addr: BdAddr, addr_type: AddrType) -> Self {
        Self { addr, addr_type }
    }
}
