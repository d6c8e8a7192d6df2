//! LE meta event parsing.
//!
//! Controllers occasionally deliver reports whose declared lengths overrun the
//! event. Parsing of such an event stops at the first bad report; everything
//! decoded before it is still returned.

use crate::address::{AddrType, AddressError, BdAddr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const SUBEVENT_ADVERTISING_REPORT: u8 = 0x02;
pub const SUBEVENT_EXT_ADVERTISING_REPORT: u8 = 0x0D;
pub const SUBEVENT_PERIODIC_SYNC_ESTABLISHED: u8 = 0x0E;
pub const SUBEVENT_PERIODIC_REPORT: u8 = 0x0F;
pub const SUBEVENT_PERIODIC_SYNC_LOST: u8 = 0x10;
pub const SUBEVENT_PERIODIC_SYNC_TRANSFER_RECEIVED: u8 = 0x18;
pub const SUBEVENT_BIGINFO_REPORT: u8 = 0x22;

const LEGACY_REPORT_HEADER_LEN: usize = 10;
const EXT_REPORT_HEADER_LEN: usize = 24;

const PHY_LE_1M: u8 = 0x01;
const PHY_LE_NO_PACKET: u8 = 0x00;
const NO_ADI_PRESENT: u8 = 0xFF;
const TX_POWER_NOT_PRESENT: i8 = 0x7F;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciParseError {
    #[error("Truncated {what}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("Unsupported legacy advertising event type 0x{0:02x}")]
    UnknownLegacyEventType(u8),
    #[error("Bad address: {0}")]
    Address(#[from] AddressError),
    #[error("Unhandled LE meta subevent 0x{0:02x}")]
    UnknownSubevent(u8),
}

// ============================================================================
// EVENT TYPE BITS
// ============================================================================

/// Extended advertising event-type bit field. Legacy reports are normalized
/// into this vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AdvEventProps(pub u16);

impl AdvEventProps {
    pub const CONNECTABLE: u16 = 1 << 0;
    pub const SCANNABLE: u16 = 1 << 1;
    pub const DIRECTED: u16 = 1 << 2;
    pub const SCAN_RESPONSE: u16 = 1 << 3;
    pub const LEGACY: u16 = 1 << 4;

    pub const DATA_COMPLETE: u8 = 0x00;
    pub const DATA_INCOMPLETE: u8 = 0x01;
    pub const DATA_TRUNCATED: u8 = 0x02;

    /// Legacy ADV_* PDU type to extended bits
    pub fn from_legacy(legacy: u8) -> Option<Self> {
        let bits = match legacy {
            // ADV_IND
            0x00 => Self::LEGACY | Self::CONNECTABLE | Self::SCANNABLE,
            // ADV_DIRECT_IND
            0x01 => Self::LEGACY | Self::CONNECTABLE | Self::DIRECTED,
            // ADV_SCAN_IND
            0x02 => Self::LEGACY | Self::SCANNABLE,
            // ADV_NONCONN_IND
            0x03 => Self::LEGACY,
            // SCAN_RSP: the originating PDU is unknown, report it as a response to ADV_IND
            0x04 => Self::LEGACY | Self::CONNECTABLE | Self::SCANNABLE | Self::SCAN_RESPONSE,
            _ => return None,
        };
        Some(Self(bits))
    }

    pub fn is_connectable(self) -> bool {
        self.0 & Self::CONNECTABLE != 0
    }

    pub fn is_scannable(self) -> bool {
        self.0 & Self::SCANNABLE != 0
    }

    pub fn is_directed(self) -> bool {
        self.0 & Self::DIRECTED != 0
    }

    pub fn is_scan_response(self) -> bool {
        self.0 & Self::SCAN_RESPONSE != 0
    }

    pub fn is_legacy(self) -> bool {
        self.0 & Self::LEGACY != 0
    }

    pub fn data_status(self) -> u8 {
        ((self.0 >> 5) & 0x03) as u8
    }

    pub fn with_data_status(self, status: u8) -> Self {
        Self((self.0 & !(0x03 << 5)) | (u16::from(status & 0x03) << 5))
    }

    /// Legacy SCAN_RSP as normalized by [`AdvEventProps::from_legacy`]
    pub fn is_legacy_scan_response(self) -> bool {
        self.0 == Self::LEGACY | Self::CONNECTABLE | Self::SCANNABLE | Self::SCAN_RESPONSE
    }
}

// ============================================================================
// PARSED EVENTS
// ============================================================================

/// One advertising report, legacy or extended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReport {
    pub event_type: AdvEventProps,
    pub addr_type: AddrType,
    pub addr: BdAddr,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_interval: u16,
    pub data: Vec<u8>,
}

/// Reports decoded from one event plus the error that stopped decoding, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBatch {
    pub reports: Vec<AdvReport>,
    pub aborted: Option<HciParseError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEstablished {
    pub status: u8,
    pub sync_handle: u16,
    pub sid: u8,
    pub addr_type: AddrType,
    pub addr: BdAddr,
    pub phy: u8,
    pub interval: u16,
    pub clock_accuracy: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicReport {
    pub sync_handle: u16,
    pub tx_power: i8,
    pub rssi: i8,
    pub cte_type: u8,
    pub data_status: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTransferReceived {
    pub status: u8,
    pub conn_handle: u16,
    pub service_data: u16,
    pub sync_handle: u16,
    pub sid: u8,
    pub addr_type: AddrType,
    pub addr: BdAddr,
    pub phy: u8,
    pub interval: u16,
    pub clock_accuracy: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BigInfoReport {
    pub sync_handle: u16,
    pub num_bis: u8,
    pub nse: u8,
    pub iso_interval: u16,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u16,
    pub sdu_interval: u32,
    pub max_sdu: u16,
    pub phy: u8,
    pub framing: u8,
    pub encryption: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeMetaEvent {
    AdvertisingReports(ReportBatch),
    ExtendedAdvertisingReports(ReportBatch),
    SyncEstablished(SyncEstablished),
    PeriodicReport(PeriodicReport),
    SyncLost { sync_handle: u16 },
    SyncTransferReceived(SyncTransferReceived),
    BigInfo(BigInfoReport),
}

impl LeMetaEvent {
    /// Decode the parameters of an LE meta event (subevent code excluded)
    pub fn parse(subevent: u8, params: &[u8]) -> Result<Self, HciParseError> {
        match subevent {
            SUBEVENT_ADVERTISING_REPORT => Ok(Self::AdvertisingReports(parse_legacy_reports(params))),
            SUBEVENT_EXT_ADVERTISING_REPORT => {
                Ok(Self::ExtendedAdvertisingReports(parse_extended_reports(params)))
            }
            SUBEVENT_PERIODIC_SYNC_ESTABLISHED => {
                let mut r = Reader::new(params, "sync established");
                Ok(Self::SyncEstablished(SyncEstablished {
                    status: r.u8()?,
                    sync_handle: r.u16()?,
                    sid: r.u8()?,
                    addr_type: AddrType::try_from(r.u8()?)?,
                    addr: r.addr()?,
                    phy: r.u8()?,
                    interval: r.u16()?,
                    clock_accuracy: r.u8()?,
                }))
            }
            SUBEVENT_PERIODIC_REPORT => {
                let mut r = Reader::new(params, "periodic report");
                let sync_handle = r.u16()?;
                let tx_power = r.i8()?;
                let rssi = r.i8()?;
                let cte_type = r.u8()?;
                let data_status = r.u8()?;
                let len = usize::from(r.u8()?);
                let data = r.bytes(len)?.to_vec();
                Ok(Self::PeriodicReport(PeriodicReport {
                    sync_handle,
                    tx_power,
                    rssi,
                    cte_type,
                    data_status,
                    data,
                }))
            }
            SUBEVENT_PERIODIC_SYNC_LOST => {
                let mut r = Reader::new(params, "sync lost");
                Ok(Self::SyncLost { sync_handle: r.u16()? })
            }
            SUBEVENT_PERIODIC_SYNC_TRANSFER_RECEIVED => {
                let mut r = Reader::new(params, "sync transfer received");
                Ok(Self::SyncTransferReceived(SyncTransferReceived {
                    status: r.u8()?,
                    conn_handle: r.u16()?,
                    service_data: r.u16()?,
                    sync_handle: r.u16()?,
                    sid: r.u8()?,
                    addr_type: AddrType::try_from(r.u8()?)?,
                    addr: r.addr()?,
                    phy: r.u8()?,
                    interval: r.u16()?,
                    clock_accuracy: r.u8()?,
                }))
            }
            SUBEVENT_BIGINFO_REPORT => {
                let mut r = Reader::new(params, "BIGInfo report");
                Ok(Self::BigInfo(BigInfoReport {
                    sync_handle: r.u16()?,
                    num_bis: r.u8()?,
                    nse: r.u8()?,
                    iso_interval: r.u16()?,
                    bn: r.u8()?,
                    pto: r.u8()?,
                    irc: r.u8()?,
                    max_pdu: r.u16()?,
                    sdu_interval: r.u24()?,
                    max_sdu: r.u16()?,
                    phy: r.u8()?,
                    framing: r.u8()?,
                    encryption: r.u8()?,
                }))
            }
            other => Err(HciParseError::UnknownSubevent(other)),
        }
    }
}

fn log_suspicious_rssi(rssi: i8, addr: &BdAddr) {
    if (21..=126).contains(&rssi) {
        warn!("Bad rssi value {} in advertising report from {}", rssi, addr);
    }
}

/// LE Advertising Report: `num_reports` then per report
/// `{evt_type, addr_type, addr[6], len, data[len], rssi}`
pub fn parse_legacy_reports(params: &[u8]) -> ReportBatch {
    let mut batch = ReportBatch::default();
    let mut r = Reader::new(params, "advertising report");
    let num_reports = match r.u8() {
        Ok(n) => n,
        Err(e) => {
            batch.aborted = Some(e);
            return batch;
        }
    };

    for _ in 0..num_reports {
        match parse_one_legacy(&mut r) {
            Ok(report) => batch.reports.push(report),
            Err(e) => {
                warn!("Malformed LE Advertising Report event: {}", e);
                batch.aborted = Some(e);
                break;
            }
        }
    }
    batch
}

fn parse_one_legacy(r: &mut Reader<'_>) -> Result<AdvReport, HciParseError> {
    r.require(LEGACY_REPORT_HEADER_LEN)?;
    let legacy_type = r.u8()?;
    let addr_type = AddrType::try_from(r.u8()?)?;
    let addr = r.addr()?;
    let len = usize::from(r.u8()?);
    // data plus the trailing rssi byte
    r.require(len + 1)?;
    let data = r.bytes(len)?.to_vec();
    let rssi = r.i8()?;
    log_suspicious_rssi(rssi, &addr);

    let event_type = AdvEventProps::from_legacy(legacy_type)
        .ok_or(HciParseError::UnknownLegacyEventType(legacy_type))?;

    Ok(AdvReport {
        event_type,
        addr_type,
        addr,
        primary_phy: PHY_LE_1M,
        secondary_phy: PHY_LE_NO_PACKET,
        sid: NO_ADI_PRESENT,
        tx_power: TX_POWER_NOT_PRESENT,
        rssi,
        periodic_interval: 0,
        data,
    })
}

/// LE Extended Advertising Report: `num_reports` then per report a 24-byte
/// header followed by `data_len` bytes
pub fn parse_extended_reports(params: &[u8]) -> ReportBatch {
    let mut batch = ReportBatch::default();
    let mut r = Reader::new(params, "extended advertising report");
    let num_reports = match r.u8() {
        Ok(n) => n,
        Err(e) => {
            batch.aborted = Some(e);
            return batch;
        }
    };

    for _ in 0..num_reports {
        match parse_one_extended(&mut r) {
            Ok(report) => batch.reports.push(report),
            Err(e) => {
                warn!("Malformed LE Extended Advertising Report event: {}", e);
                batch.aborted = Some(e);
                break;
            }
        }
    }
    batch
}

fn parse_one_extended(r: &mut Reader<'_>) -> Result<AdvReport, HciParseError> {
    r.require(EXT_REPORT_HEADER_LEN)?;
    let event_type = AdvEventProps(r.u16()?);
    let addr_type = AddrType::try_from(r.u8()?)?;
    let addr = r.addr()?;
    let primary_phy = r.u8()?;
    let secondary_phy = r.u8()?;
    let sid = r.u8()?;
    let tx_power = r.i8()?;
    let rssi = r.i8()?;
    let periodic_interval = r.u16()?;
    let _direct_addr_type = r.u8()?;
    let _direct_addr = r.addr()?;
    let len = usize::from(r.u8()?);
    let data = r.bytes(len)?.to_vec();
    log_suspicious_rssi(rssi, &addr);

    Ok(AdvReport {
        event_type,
        addr_type,
        addr,
        primary_phy,
        secondary_phy,
        sid,
        tx_power,
        rssi,
        periodic_interval,
        data,
    })
}

// ============================================================================
// BYTE READER
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn require(&self, needed: usize) -> Result<(), HciParseError> {
        if needed > self.remaining() {
            return Err(HciParseError::Truncated {
                what: self.what,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], HciParseError> {
        self.require(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, HciParseError> {
        Ok(self.bytes(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, HciParseError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, HciParseError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32, HciParseError> {
        let b = self.bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn addr(&mut self) -> Result<BdAddr, HciParseError> {
        Ok(BdAddr::from_le_slice(self.bytes(6)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_LE: [u8; 6] = [0x66, 0x55, 0x44, 0x33, 0x22, 0x11];

    fn legacy_report(evt: u8, data: &[u8], rssi: i8) -> Vec<u8> {
        let mut out = vec![evt, 0x00];
        out.extend_from_slice(&ADDR_LE);
        out.push(data.len() as u8);
        out.extend_from_slice(data);
        out.push(rssi as u8);
        out
    }

    fn ext_report(evt: u16, data: &[u8]) -> Vec<u8> {
        let mut out = evt.to_le_bytes().to_vec();
        out.push(0x01);
        out.extend_from_slice(&ADDR_LE);
        out.extend_from_slice(&[0x01, 0x02, 0x03, 0x7F, (-60i8) as u8]);
        out.extend_from_slice(&0x0050u16.to_le_bytes());
        out.push(0x00);
        out.extend_from_slice(&[0; 6]);
        out.push(data.len() as u8);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_legacy_type_mapping() {
        let ind = AdvEventProps::from_legacy(0x00).expect("ADV_IND");
        assert!(ind.is_legacy() && ind.is_connectable() && ind.is_scannable());
        let direct = AdvEventProps::from_legacy(0x01).expect("ADV_DIRECT_IND");
        assert!(direct.is_directed() && !direct.is_scannable());
        let nonconn = AdvEventProps::from_legacy(0x03).expect("ADV_NONCONN_IND");
        assert_eq!(nonconn.0, AdvEventProps::LEGACY);
        let rsp = AdvEventProps::from_legacy(0x04).expect("SCAN_RSP");
        assert!(rsp.is_scan_response() && rsp.is_legacy_scan_response());
        assert!(AdvEventProps::from_legacy(0x05).is_none());
    }

    #[test]
    fn test_data_status_bits() {
        let props = AdvEventProps(0x0000).with_data_status(AdvEventProps::DATA_INCOMPLETE);
        assert_eq!(props.0, 0x0020);
        assert_eq!(props.data_status(), AdvEventProps::DATA_INCOMPLETE);
        assert_eq!(props.with_data_status(0).data_status(), 0);
    }

    #[test]
    fn test_parse_two_legacy_reports() {
        let mut params = vec![2];
        params.extend(legacy_report(0x00, &[0x02, 0x01, 0x06], -40));
        params.extend(legacy_report(0x03, &[], -70));
        let batch = parse_legacy_reports(&params);
        assert!(batch.aborted.is_none());
        assert_eq!(batch.reports.len(), 2);
        assert_eq!(batch.reports[0].addr.to_string(), "11:22:33:44:55:66");
        assert_eq!(batch.reports[0].data, vec![0x02, 0x01, 0x06]);
        assert_eq!(batch.reports[0].rssi, -40);
        assert_eq!(batch.reports[0].sid, 0xFF);
        assert_eq!(batch.reports[1].rssi, -70);
    }

    #[test]
    fn test_legacy_overrun_keeps_earlier_reports() {
        let mut params = vec![3];
        params.extend(legacy_report(0x00, &[0x02, 0x01, 0x06], -40));
        let mut bad = legacy_report(0x00, &[0x02, 0x01, 0x06], -40);
        // claim more data than the event carries
        bad[8] = 30;
        params.extend(bad);
        let batch = parse_legacy_reports(&params);
        assert_eq!(batch.reports.len(), 1);
        assert!(matches!(batch.aborted, Some(HciParseError::Truncated { .. })));
    }

    #[test]
    fn test_legacy_unknown_type_aborts() {
        let mut params = vec![2];
        params.extend(legacy_report(0x09, &[], -40));
        params.extend(legacy_report(0x00, &[], -40));
        let batch = parse_legacy_reports(&params);
        assert!(batch.reports.is_empty());
        assert_eq!(batch.aborted, Some(HciParseError::UnknownLegacyEventType(0x09)));
    }

    #[test]
    fn test_parse_extended_report() {
        let mut params = vec![1];
        params.extend(ext_report(0x0001 | 0x0020, &[0x03, 0xFF, 0xAA, 0xBB]));
        let batch = parse_extended_reports(&params);
        assert!(batch.aborted.is_none());
        let report = &batch.reports[0];
        assert_eq!(report.addr_type, AddrType::Random);
        assert_eq!(report.sid, 0x03);
        assert_eq!(report.rssi, -60);
        assert_eq!(report.periodic_interval, 0x0050);
        assert_eq!(report.event_type.data_status(), AdvEventProps::DATA_INCOMPLETE);
        assert_eq!(report.data, vec![0x03, 0xFF, 0xAA, 0xBB]);
    }

    #[test]
    fn test_extended_header_overrun() {
        let mut params = vec![2];
        params.extend(ext_report(0x0000, &[]));
        params.extend_from_slice(&[0x00; 10]);
        let batch = parse_extended_reports(&params);
        assert_eq!(batch.reports.len(), 1);
        assert!(batch.aborted.is_some());
    }

    #[test]
    fn test_positive_rssi_is_tolerated() {
        let mut params = vec![1];
        params.extend(legacy_report(0x03, &[], 50));
        let batch = parse_legacy_reports(&params);
        assert_eq!(batch.reports[0].rssi, 50);
    }

    #[test]
    fn test_parse_sync_established() {
        let mut params = vec![0x00, 0x01, 0x02, 0x05, 0x01];
        params.extend_from_slice(&ADDR_LE);
        params.extend_from_slice(&[0x02, 0x40, 0x00, 0x05]);
        match LeMetaEvent::parse(SUBEVENT_PERIODIC_SYNC_ESTABLISHED, &params) {
            Ok(LeMetaEvent::SyncEstablished(ev)) => {
                assert_eq!(ev.sync_handle, 0x0201);
                assert_eq!(ev.sid, 5);
                assert_eq!(ev.interval, 0x0040);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_biginfo() {
        let params = [
            0x10, 0x00, 2, 4, 0x18, 0x00, 1, 0, 2, 0xFB, 0x00, 0x10, 0x27, 0x00, 0x64, 0x00, 2, 0, 1,
        ];
        match LeMetaEvent::parse(SUBEVENT_BIGINFO_REPORT, &params) {
            Ok(LeMetaEvent::BigInfo(info)) => {
                assert_eq!(info.sync_handle, 0x0010);
                assert_eq!(info.num_bis, 2);
                assert_eq!(info.sdu_interval, 10_000);
                assert_eq!(info.max_sdu, 100);
                assert_eq!(info.encryption, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncated_sync_lost() {
        assert!(matches!(
            LeMetaEvent::parse(SUBEVENT_PERIODIC_SYNC_LOST, &[0x01]),
            Err(HciParseError::Truncated { .. })
        ));
        assert_eq!(
            LeMetaEvent::parse(0x7E, &[]),
            Err(HciParseError::UnknownSubevent(0x7E))
        );
    }
}
