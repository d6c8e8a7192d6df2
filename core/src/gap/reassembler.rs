//! Advertising report reassembly.
//!
//! Extended advertising trains arrive as several reports flagged
//! "incomplete, more to come", and active scanning pairs an advertisement with
//! its scan response. Fragments are accumulated per (address type, address)
//! until a complete, well-formed payload can be delivered.

use super::ad;
use crate::address::{AddrType, BdAddr};
use crate::hci::AdvEventProps;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Maximum number of addresses with partial data held at once
pub const CACHE_MAX_ENTRIES: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    addr_type: AddrType,
    addr: BdAddr,
    data: Vec<u8>,
}

/// Bounded most-recent-first list of partial payloads
#[derive(Debug, Clone, Default)]
pub struct AdvertisingCache {
    items: VecDeque<CacheEntry>,
}

impl AdvertisingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, addr_type: AddrType, addr: &BdAddr) -> Option<usize> {
        self.items
            .iter()
            .position(|e| e.addr_type == addr_type && e.addr == *addr)
    }

    pub fn exists(&self, addr_type: AddrType, addr: &BdAddr) -> bool {
        self.position(addr_type, addr).is_some()
    }

    pub fn get(&self, addr_type: AddrType, addr: &BdAddr) -> Option<&[u8]> {
        self.position(addr_type, addr).map(|i| self.items[i].data.as_slice())
    }

    /// Replace the data held for an address, inserting it if absent. Inserting
    /// into a full cache evicts the oldest entry.
    pub fn set(&mut self, addr_type: AddrType, addr: BdAddr, data: Vec<u8>) -> &[u8] {
        if let Some(i) = self.position(addr_type, &addr) {
            self.items[i].data = data;
            return &self.items[i].data;
        }
        if self.items.len() >= CACHE_MAX_ENTRIES {
            if let Some(evicted) = self.items.pop_back() {
                trace!("Advertising cache full, evicting {}", evicted.addr);
            }
        }
        self.items.push_front(CacheEntry { addr_type, addr, data });
        &self.items[0].data
    }

    pub fn append(&mut self, addr_type: AddrType, addr: BdAddr, data: Vec<u8>) -> &[u8] {
        match self.position(addr_type, &addr) {
            Some(i) => {
                self.items[i].data.extend_from_slice(&data);
                &self.items[i].data
            }
            None => self.set(addr_type, addr, data),
        }
    }

    pub fn clear(&mut self, addr_type: AddrType, addr: &BdAddr) {
        if let Some(i) = self.position(addr_type, addr) {
            self.items.remove(i);
        }
    }

    pub fn clear_all(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Why a report produced nothing and left nothing behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Legacy scan response without a cached advertisement
    OrphanScanResponse,
    /// Reassembled payload failed the AD structure check
    InvalidPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Payload ready for delivery; the cache entry has been released
    Complete(Vec<u8>),
    /// More fragments or a scan response are expected
    Pending,
    Dropped(DropReason),
}

#[derive(Debug, Default)]
pub struct Reassembler {
    cache: AdvertisingCache,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &AdvertisingCache {
        &self.cache
    }

    /// Called whenever scanning (re)starts
    pub fn reset(&mut self) {
        self.cache.clear_all();
    }

    /// Release the entry for an address, e.g. when the device is filtered out
    /// after delivery
    pub fn discard(&mut self, addr_type: AddrType, addr: &BdAddr) {
        self.cache.clear(addr_type, addr);
    }

    /// Feed one report. `active_scan` tells whether the scanner sends scan
    /// requests, in which case scannable advertisements wait for their response.
    pub fn feed(
        &mut self,
        event_type: AdvEventProps,
        addr_type: AddrType,
        addr: BdAddr,
        data: &[u8],
        active_scan: bool,
    ) -> Reassembly {
        let is_legacy = event_type.is_legacy();
        let is_scannable = event_type.is_scannable();
        let is_scan_resp = event_type.is_scan_response();

        // A response can be seen without its advertisement; nothing useful can
        // be said about the device from the response alone.
        if is_legacy && is_scan_resp && !self.cache.exists(addr_type, &addr) {
            debug!("Dropping scan response from {} without advertisement", addr);
            return Reassembly::Dropped(DropReason::OrphanScanResponse);
        }

        let is_start = is_legacy && is_scannable && !is_scan_resp;

        let mut fragment = data.to_vec();
        if is_legacy {
            ad::remove_trailing_zeros(&mut fragment);
        }

        // A scan request may have gone unanswered earlier: a new advertisement
        // always restarts the buffer.
        if is_start {
            self.cache.set(addr_type, addr, fragment);
        } else {
            self.cache.append(addr_type, addr, fragment);
        }

        if event_type.data_status() == AdvEventProps::DATA_INCOMPLETE {
            trace!("Data not complete yet, waiting for more from {}", addr);
            return Reassembly::Pending;
        }

        if active_scan && is_scannable && !is_scan_resp {
            trace!("Waiting for scan response from {}", addr);
            return Reassembly::Pending;
        }

        let payload = match self.cache.position(addr_type, &addr) {
            Some(i) => self.cache.items.remove(i).map(|e| e.data).unwrap_or_default(),
            None => Vec::new(),
        };

        if !ad::is_valid(&payload) {
            debug!(
                "Dropping bad advertisement from {}: {}",
                addr,
                hex::encode(&payload)
            );
            return Reassembly::Dropped(DropReason::InvalidPayload);
        }

        Reassembly::Complete(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([0xC0, 0, 0, 0, 0, last])
    }

    fn legacy(kind: u8) -> AdvEventProps {
        AdvEventProps::from_legacy(kind).expect("legacy type")
    }

    fn ext(bits: u16, status: u8) -> AdvEventProps {
        AdvEventProps(bits).with_data_status(status)
    }

    #[test]
    fn test_cache_bounded_to_seven() {
        let mut cache = AdvertisingCache::new();
        for i in 0..8 {
            cache.set(AddrType::Random, addr(i), vec![i]);
        }
        assert_eq!(cache.len(), CACHE_MAX_ENTRIES);
        assert!(!cache.exists(AddrType::Random, &addr(0)));
        assert!(cache.exists(AddrType::Random, &addr(7)));
    }

    #[test]
    fn test_cache_keyed_by_type_and_address() {
        let mut cache = AdvertisingCache::new();
        cache.set(AddrType::Public, addr(1), vec![1]);
        cache.append(AddrType::Random, addr(1), vec![2]);
        assert_eq!(cache.len(), 2);
        cache.append(AddrType::Public, addr(1), vec![3]);
        assert_eq!(cache.get(AddrType::Public, &addr(1)), Some(&[1, 3][..]));
        cache.clear(AddrType::Public, &addr(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_legacy_nonconnectable_delivered_immediately() {
        let mut r = Reassembler::new();
        let out = r.feed(legacy(0x03), AddrType::Public, addr(1), &[0x02, 0x01, 0x06, 0, 0], true);
        assert_eq!(out, Reassembly::Complete(vec![0x02, 0x01, 0x06]));
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_active_scan_waits_for_scan_response() {
        let mut r = Reassembler::new();
        let adv = [0x02, 0x01, 0x06];
        let rsp = [0x03, 0x19, 0xC1, 0x03];
        assert_eq!(
            r.feed(legacy(0x00), AddrType::Public, addr(1), &adv, true),
            Reassembly::Pending
        );
        let out = r.feed(legacy(0x04), AddrType::Public, addr(1), &rsp, true);
        assert_eq!(
            out,
            Reassembly::Complete(vec![0x02, 0x01, 0x06, 0x03, 0x19, 0xC1, 0x03])
        );
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_passive_scan_does_not_wait() {
        let mut r = Reassembler::new();
        let out = r.feed(legacy(0x00), AddrType::Public, addr(1), &[0x02, 0x01, 0x06], false);
        assert!(matches!(out, Reassembly::Complete(_)));
    }

    #[test]
    fn test_orphan_scan_response_dropped() {
        let mut r = Reassembler::new();
        let out = r.feed(legacy(0x04), AddrType::Public, addr(1), &[0x02, 0x01, 0x06], true);
        assert_eq!(out, Reassembly::Dropped(DropReason::OrphanScanResponse));
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_repeated_advertisement_restarts_buffer() {
        let mut r = Reassembler::new();
        r.feed(legacy(0x00), AddrType::Public, addr(1), &[0x02, 0x01, 0x06], true);
        r.feed(legacy(0x00), AddrType::Public, addr(1), &[0x02, 0x01, 0x05], true);
        let out = r.feed(legacy(0x04), AddrType::Public, addr(1), &[], true);
        assert_eq!(out, Reassembly::Complete(vec![0x02, 0x01, 0x05]));
    }

    #[test]
    fn test_invalid_payload_dropped_and_cleared() {
        let mut r = Reassembler::new();
        let out = r.feed(ext(0x0000, 0), AddrType::Random, addr(2), &[0x07, 0x01], true);
        assert_eq!(out, Reassembly::Dropped(DropReason::InvalidPayload));
        assert!(!r.cache().exists(AddrType::Random, &addr(2)));
    }

    #[test]
    fn test_extended_fragments_concatenate() {
        let mut r = Reassembler::new();
        let a = addr(3);
        assert_eq!(
            r.feed(ext(0x0000, 1), AddrType::Random, a, &[0x05, 0xFF, 0x01], true),
            Reassembly::Pending
        );
        assert_eq!(
            r.feed(ext(0x0000, 1), AddrType::Random, a, &[0x02, 0x03], true),
            Reassembly::Pending
        );
        let out = r.feed(ext(0x0000, 0), AddrType::Random, a, &[0x04], true);
        assert_eq!(out, Reassembly::Complete(vec![0x05, 0xFF, 0x01, 0x02, 0x03, 0x04]));
        assert!(!r.cache().exists(AddrType::Random, &a));
    }

    proptest! {
        #[test]
        fn prop_fragments_delivered_in_order(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..20), 1..6)
        ) {
            // one manufacturer-specific field spread over every fragment
            let body: Vec<u8> = chunks.concat();
            prop_assume!(!body.is_empty() && body.len() < 250);
            let mut payload = vec![(body.len() + 1) as u8, 0xFF];
            payload.extend_from_slice(&body);

            let mut pieces: Vec<Vec<u8>> = vec![payload[..2].to_vec()];
            pieces.extend(chunks.iter().cloned());

            let mut r = Reassembler::new();
            let a = addr(9);
            let last = pieces.len() - 1;
            let mut delivered = None;
            for (i, piece) in pieces.iter().enumerate() {
                let status = if i == last { 0 } else { 1 };
                match r.feed(ext(0x0000, status), AddrType::Random, a, piece, true) {
                    Reassembly::Complete(data) => delivered = Some(data),
                    Reassembly::Pending => prop_assert!(i < last),
                    Reassembly::Dropped(reason) => prop_assert!(false, "dropped: {:?}", reason),
                }
            }
            prop_assert_eq!(delivered, Some(payload));
            prop_assert!(!r.cache().exists(AddrType::Random, &a));
        }

        #[test]
        fn prop_cache_never_exceeds_bound(keys in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut cache = AdvertisingCache::new();
            for k in keys {
                cache.append(AddrType::Public, addr(k), vec![k]);
                prop_assert!(cache.len() <= CACHE_MAX_ENTRIES);
            }
        }
    }
}
