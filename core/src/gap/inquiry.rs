//! Inquiry result store.
//!
//! Bounded table of LE devices seen while scanning. A per-inquiry counter tells
//! first sightings in the current cycle apart from repeats, and the AD Flags
//! field decides whether a device is reported to the inquiry stream, the
//! observer stream, or both.

use super::ad;
use crate::address::{AddrType, BdAddr};
use crate::hci::{AdvEventProps, AdvReport};
use serde::Serialize;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// 16-bit UUID of the HID over GATT service
pub const UUID_SERVCLASS_LE_HID: u16 = 0x1812;

/// Result routed to the inquiry stream
pub const RESULT_INQUIRY: u8 = 0x01;
/// Result routed to the observer stream
pub const RESULT_OBSERVER: u8 = 0x02;

// ============================================================================
// DEVICE CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceType(pub u8);

impl DeviceType {
    pub const UNKNOWN: DeviceType = DeviceType(0x00);
    pub const BREDR: DeviceType = DeviceType(0x01);
    pub const BLE: DeviceType = DeviceType(0x02);
    pub const DUMO: DeviceType = DeviceType(0x03);

    pub fn has_ble(self) -> bool {
        self.0 & Self::BLE.0 != 0
    }

    pub fn union(self, other: DeviceType) -> DeviceType {
        DeviceType(self.0 | other.0)
    }
}

pub mod cod {
    pub const MAJOR_COMPUTER: u8 = 0x01;
    pub const MAJOR_PHONE: u8 = 0x02;
    pub const MAJOR_AUDIO: u8 = 0x04;
    pub const MAJOR_PERIPHERAL: u8 = 0x05;
    pub const MAJOR_IMAGING: u8 = 0x06;
    pub const MAJOR_WEARABLE: u8 = 0x07;
    pub const MAJOR_HEALTH: u8 = 0x09;
    pub const MAJOR_UNCLASSIFIED: u8 = 0x1F;

    pub const MINOR_UNCLASSIFIED: u8 = 0x00;
    pub const MINOR_KEYBOARD: u8 = 0x40;
    pub const MINOR_POINTING: u8 = 0x80;
    pub const MINOR_JOYSTICK: u8 = 0x04;
    pub const MINOR_GAMEPAD: u8 = 0x08;
    pub const MINOR_REMOTE_CONTROL: u8 = 0x0C;
    pub const MINOR_DIGITIZING_TABLET: u8 = 0x14;
    pub const MINOR_CARD_READER: u8 = 0x18;
    pub const MINOR_DIGITAL_PEN: u8 = 0x1C;
    pub const MINOR_BLOOD_MONITOR: u8 = 0x04;
    pub const MINOR_THERMOMETER: u8 = 0x08;
    pub const MINOR_WEIGHING_SCALE: u8 = 0x0C;
    pub const MINOR_GLUCOSE_METER: u8 = 0x10;
    pub const MINOR_PULSE_OXIMETER: u8 = 0x14;
    pub const MINOR_HEART_PULSE_MONITOR: u8 = 0x18;
    pub const MINOR_STEP_COUNTER: u8 = 0x20;
    pub const MINOR_WRIST_WATCH: u8 = 0x04;
    pub const MINOR_GLASSES: u8 = 0x14;
    pub const MINOR_DISPLAY: u8 = 0x10;
    pub const MINOR_WEARABLE_HEADSET: u8 = 0x04;
}

/// Class of device as `[service, major, minor]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClassOfDevice(pub [u8; 3]);

impl ClassOfDevice {
    pub fn major(&self) -> u8 {
        self.0[1]
    }

    pub fn minor(&self) -> u8 {
        self.0[2]
    }

    fn set(&mut self, major: u8, minor: u8) {
        self.0[1] = major;
        self.0[2] = minor;
    }
}

/// Coarse class of device for an LE appearance value
pub fn appearance_to_cod(appearance: u16) -> (u8, u8) {
    use cod::*;
    match appearance {
        0x0040 => (MAJOR_PHONE, MINOR_UNCLASSIFIED),
        0x0080 => (MAJOR_COMPUTER, MINOR_UNCLASSIFIED),
        0x0180 => (MAJOR_PERIPHERAL, MINOR_REMOTE_CONTROL),
        0x0300 | 0x0301 => (MAJOR_HEALTH, MINOR_THERMOMETER),
        0x0340 | 0x0341 => (MAJOR_HEALTH, MINOR_HEART_PULSE_MONITOR),
        0x0380..=0x0382 => (MAJOR_HEALTH, MINOR_BLOOD_MONITOR),
        0x0C40..=0x0C42 => (MAJOR_HEALTH, MINOR_PULSE_OXIMETER),
        0x0400 => (MAJOR_HEALTH, MINOR_GLUCOSE_METER),
        0x0C80 => (MAJOR_HEALTH, MINOR_WEIGHING_SCALE),
        0x0440..=0x0443 => (MAJOR_HEALTH, MINOR_STEP_COUNTER),
        0x00C0 | 0x00C1 => (MAJOR_WEARABLE, MINOR_WRIST_WATCH),
        0x01C0 => (MAJOR_WEARABLE, MINOR_GLASSES),
        0x0140 => (MAJOR_IMAGING, MINOR_DISPLAY),
        0x0280 => (MAJOR_AUDIO, MINOR_UNCLASSIFIED),
        0x0941 => (MAJOR_AUDIO, MINOR_WEARABLE_HEADSET),
        // barcode scanner, HID barcode scanner, generic HID
        0x02C0 | 0x03C8 | 0x03C0 => (MAJOR_PERIPHERAL, MINOR_UNCLASSIFIED),
        0x03C1 => (MAJOR_PERIPHERAL, MINOR_KEYBOARD),
        0x03C2 => (MAJOR_PERIPHERAL, MINOR_POINTING),
        0x03C3 => (MAJOR_PERIPHERAL, MINOR_JOYSTICK),
        0x03C4 => (MAJOR_PERIPHERAL, MINOR_GAMEPAD),
        0x03C5 => (MAJOR_PERIPHERAL, MINOR_DIGITIZING_TABLET),
        0x03C6 => (MAJOR_PERIPHERAL, MINOR_CARD_READER),
        0x03C7 => (MAJOR_PERIPHERAL, MINOR_DIGITAL_PEN),
        _ => (MAJOR_UNCLASSIFIED, MINOR_UNCLASSIFIED),
    }
}

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InquiryRecord {
    pub addr: BdAddr,
    pub addr_type: AddrType,
    /// Address as received over the air, before identity resolution
    pub original_addr: BdAddr,
    pub rssi: i8,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub sid: u8,
    pub tx_power: i8,
    pub periodic_interval: u16,
    /// Last advertising event type; scan responses leave it untouched
    pub event_type: AdvEventProps,
    pub flags: u8,
    pub dev_class: ClassOfDevice,
    pub device_type: DeviceType,
    pub include_rsi: bool,
    /// False while a scan response is still outstanding
    pub scan_rsp: bool,
    pub inq_count: u32,
    pub last_seen_ms: u64,
}

impl InquiryRecord {
    fn new(addr: BdAddr) -> Self {
        Self {
            addr,
            addr_type: AddrType::Public,
            original_addr: addr,
            rssi: 0,
            primary_phy: 0,
            secondary_phy: 0,
            sid: 0,
            tx_power: 0,
            periodic_interval: 0,
            event_type: AdvEventProps::default(),
            flags: 0,
            dev_class: ClassOfDevice::default(),
            device_type: DeviceType::UNKNOWN,
            include_rsi: false,
            scan_rsp: false,
            inq_count: 0,
            last_seen_ms: 0,
        }
    }
}

/// Scanner state needed to interpret a report
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanContext {
    pub active_scan: bool,
    pub observe_active: bool,
    pub general_inquiry_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InquiryUpdate {
    /// Already reported this cycle and nothing new to say
    Skipped,
    /// Record refreshed; `report_inquiry` is false when only the observer
    /// stream should hear about it
    Updated { record: InquiryRecord, report_inquiry: bool },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct InquiryDb {
    entries: Vec<InquiryRecord>,
    capacity: usize,
    counter: u32,
    /// Addresses already reported during the running inquiry
    seen: Option<HashSet<BdAddr>>,
    num_responses: u16,
}

impl InquiryDb {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            counter: 0,
            seen: None,
            num_responses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn num_responses(&self) -> u16 {
        self.num_responses
    }

    pub fn find(&self, addr: &BdAddr) -> Option<&InquiryRecord> {
        self.entries.iter().find(|e| e.addr == *addr)
    }

    /// Start a new inquiry cycle
    pub fn begin_inquiry(&mut self) {
        self.counter = self.counter.wrapping_add(1);
        self.seen = Some(HashSet::new());
        self.num_responses = 0;
    }

    pub fn end_inquiry(&mut self) {
        self.seen = None;
    }

    /// Returns true if `addr` was already reported this cycle, recording it
    /// otherwise. Outside an inquiry nothing is deduplicated.
    fn check_and_mark_seen(&mut self, addr: &BdAddr) -> bool {
        match self.seen.as_mut() {
            Some(seen) => !seen.insert(*addr),
            None => false,
        }
    }

    /// Forget LE-only devices still waiting for a scan response
    pub fn clear_pending_le_entries(&mut self) {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.device_type == DeviceType::BLE && !e.scan_rsp));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("Cleared {} pending LE inquiry entries", dropped);
        }
    }

    fn index_or_insert(&mut self, addr: BdAddr) -> usize {
        if let Some(i) = self.entries.iter().position(|e| e.addr == addr) {
            return i;
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.inq_count == self.counter, e.last_seen_ms))
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                trace!("Inquiry DB full, replacing {}", self.entries[i].addr);
                self.entries.swap_remove(i);
            }
        }
        self.entries.push(InquiryRecord::new(addr));
        self.entries.len() - 1
    }

    /// Fold a reassembled report into the table
    pub fn process_report(
        &mut self,
        report: &AdvReport,
        original_addr: BdAddr,
        payload: &[u8],
        ctx: ScanContext,
    ) -> InquiryUpdate {
        let addr = report.addr;
        let include_rsi = ad::field_by_type(payload, ad::AD_TYPE_RSI).is_some();
        let mut report_inquiry = true;

        if self.check_and_mark_seen(&addr) {
            let worth_update = self.find(&addr).is_some_and(|e| {
                !e.device_type.has_ble() || !e.scan_rsp || (!e.include_rsi && include_rsi)
            });
            if !worth_update {
                if ctx.observe_active {
                    report_inquiry = false;
                } else {
                    return InquiryUpdate::Skipped;
                }
            }
        }

        let counter = self.counter;
        let existed = self.entries.iter().any(|e| e.addr == addr);
        let i = self.index_or_insert(addr);
        if !existed || self.entries[i].inq_count != counter {
            self.entries[i].last_seen_ms = now_ms();
            self.num_responses = self.num_responses.saturating_add(1);
        }

        let entry = &mut self.entries[i];
        update_record(entry, report, payload, ctx.active_scan, counter);
        if include_rsi {
            entry.include_rsi = true;
        }
        entry.original_addr = original_addr;

        InquiryUpdate::Updated {
            record: entry.clone(),
            report_inquiry,
        }
    }
}

fn update_record(
    entry: &mut InquiryRecord,
    report: &AdvReport,
    payload: &[u8],
    active_scan: bool,
    counter: u32,
) {
    let evt = report.event_type;
    entry.addr_type = report.addr_type;
    entry.rssi = report.rssi;
    entry.primary_phy = report.primary_phy;
    entry.secondary_phy = report.secondary_phy;
    entry.sid = report.sid;
    entry.tx_power = report.tx_power;
    entry.periodic_interval = report.periodic_interval;

    entry.scan_rsp = !(active_scan && evt.is_scannable() && !evt.is_scan_response());

    entry.device_type = if entry.inq_count != counter {
        DeviceType::BLE
    } else {
        entry.device_type.union(DeviceType::BLE)
    };

    if !evt.is_legacy_scan_response() {
        entry.event_type = evt;
    }
    entry.inq_count = counter;

    let mut has_flags = false;
    if let Some(flags) = ad::field_by_type(payload, ad::AD_TYPE_FLAGS).and_then(|v| v.first()) {
        has_flags = true;
        entry.flags = *flags;
    }

    match ad::field_by_type(payload, ad::AD_TYPE_APPEARANCE) {
        Some(value) if value.len() == 2 => {
            let (major, minor) = appearance_to_cod(u16::from_le_bytes([value[0], value[1]]));
            entry.dev_class.set(major, minor);
        }
        _ => {
            if let Some(uuids) = ad::field_by_type(payload, ad::AD_TYPE_16BIT_UUID_COMPLETE) {
                let has_hid = uuids
                    .chunks_exact(2)
                    .any(|c| u16::from_le_bytes([c[0], c[1]]) == UUID_SERVCLASS_LE_HID);
                if has_hid {
                    entry.dev_class = ClassOfDevice([0, cod::MAJOR_PERIPHERAL, 0]);
                }
            }
        }
    }

    // Non-connectable packets may omit flags entirely; nothing is inferred then.
    let should_process_flags = has_flags || evt.is_connectable();
    if should_process_flags
        && entry.flags & ad::FLAG_BREDR_NOT_SUPPORTED == 0
        && !evt.is_directed()
    {
        if entry.addr_type != AddrType::Random {
            trace!("BR/EDR not-supported bit clear, treating {} as dual mode", entry.addr);
            entry.device_type = entry.device_type.union(DeviceType::DUMO);
        } else {
            trace!("Random address, treating {} as LE only", entry.addr);
        }
    }
}

/// Which result streams a payload qualifies for
pub fn discoverability(payload: &[u8], observe_active: bool, general_inquiry_active: bool) -> u8 {
    let mut result = 0;
    if observe_active {
        result |= RESULT_OBSERVER;
    }
    if let Some(flags) = ad::field_by_type(payload, ad::AD_TYPE_FLAGS).and_then(|v| v.first()) {
        if general_inquiry_active
            && flags & (ad::FLAG_LE_LIMITED_DISC | ad::FLAG_LE_GENERAL_DISC) != 0
        {
            result |= RESULT_INQUIRY;
        }
    }
    result
}
