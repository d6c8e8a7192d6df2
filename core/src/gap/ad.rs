//! Advertising data (AD) structure helpers.
//!
//! AD payloads are a sequence of `{len, type, value[len - 1]}` fields. A zero
//! length byte marks the start of padding.

pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_16BIT_UUID_COMPLETE: u8 = 0x03;
pub const AD_TYPE_APPEARANCE: u8 = 0x19;
pub const AD_TYPE_RSI: u8 = 0x2E;

pub const FLAG_LE_LIMITED_DISC: u8 = 0x01;
pub const FLAG_LE_GENERAL_DISC: u8 = 0x02;
pub const FLAG_BREDR_NOT_SUPPORTED: u8 = 0x04;
pub const FLAG_SIMULTANEOUS_CONTROLLER: u8 = 0x08;
pub const FLAG_SIMULTANEOUS_HOST: u8 = 0x10;

/// Legacy advertising payload cap
pub const MAX_LEGACY_AD_LEN: usize = 31;

/// Check that `ad` is a well-formed field sequence. Trailing zero padding is
/// accepted; any non-zero byte after a zero length is not.
pub fn is_valid(ad: &[u8]) -> bool {
    let mut position = 0;
    while position != ad.len() {
        let len = usize::from(ad[position]);
        if len == 0 {
            return ad[position + 1..].iter().all(|b| *b == 0);
        }
        if position + len >= ad.len() {
            return false;
        }
        position += len + 1;
    }
    true
}

/// Drop everything from the first zero-length field onwards
pub fn remove_trailing_zeros(ad: &mut Vec<u8>) {
    let mut position = 0;
    while position != ad.len() {
        let len = usize::from(ad[position]);
        if len == 0 {
            ad.truncate(position);
            return;
        }
        if position + len >= ad.len() {
            return;
        }
        position += len + 1;
    }
}

/// Value of the first field of type `ad_type`
pub fn field_by_type(ad: &[u8], ad_type: u8) -> Option<&[u8]> {
    fields(ad).find(|(t, _)| *t == ad_type).map(|(_, v)| v)
}

/// Iterate `(type, value)` pairs up to the first malformed or zero-length field
pub fn fields(ad: &[u8]) -> AdFields<'_> {
    AdFields { ad, position: 0 }
}

pub struct AdFields<'a> {
    ad: &'a [u8],
    position: usize,
}

impl<'a> Iterator for AdFields<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.ad.len() {
            return None;
        }
        let len = usize::from(self.ad[self.position]);
        if len == 0 || self.position + len >= self.ad.len() {
            self.position = self.ad.len();
            return None;
        }
        let ad_type = self.ad[self.position + 1];
        let value = &self.ad[self.position + 2..self.position + 1 + len];
        self.position += len + 1;
        Some((ad_type, value))
    }
}

/// Local advertising payload whose Flags field is kept in sync with the
/// discoverability state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAdvData {
    data: Vec<u8>,
    /// Offset of the flags value byte, once a Flags field exists
    flags_offset: Option<usize>,
}

impl LocalAdvData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn flags(&self) -> Option<u8> {
        self.flags_offset.map(|i| self.data[i])
    }

    /// Replace the payload. An existing Flags field is tracked.
    pub fn set_payload(&mut self, mut payload: Vec<u8>) {
        payload.truncate(MAX_LEGACY_AD_LEN);
        remove_trailing_zeros(&mut payload);
        self.flags_offset = None;
        let mut position = 0;
        for (ad_type, value) in fields(&payload) {
            if ad_type == AD_TYPE_FLAGS && !value.is_empty() {
                self.flags_offset = Some(position + 2);
                break;
            }
            position += value.len() + 2;
        }
        self.data = payload;
    }

    /// Write the flags value, appending a Flags field when there is none.
    /// With fewer than three bytes left the payload is reset to just the flags.
    pub fn set_flags(&mut self, flags: u8) {
        if let Some(offset) = self.flags_offset {
            self.data[offset] = flags;
            return;
        }
        if MAX_LEGACY_AD_LEN - self.data.len() < 3 {
            self.data.clear();
        }
        self.data.extend_from_slice(&[2, AD_TYPE_FLAGS]);
        self.flags_offset = Some(self.data.len());
        self.data.push(flags);
    }
}
