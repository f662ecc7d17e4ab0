//! Address type and byte-padding helpers shared by every layer.

use std::fmt;
use std::str::FromStr;

/// 20-byte identity: Keccak-160 of an uncompressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Parse from a byte slice; anything but exactly 20 bytes is rejected.
    pub fn from_slice(raw: &[u8]) -> Option<Address> {
        if raw.len() != 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(raw);
        Some(Address(out))
    }

    /// Take the last 20 bytes of a 32-byte storage slot value. Short values
    /// are left-padded with zeros first, the way the chain pads slots.
    pub fn from_slot_value(raw: &[u8]) -> Address {
        let padded = pad32(raw);
        let mut out = [0u8; 20];
        out.copy_from_slice(&padded[12..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(s)?;
        Address::from_slice(&raw).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

/// Left-pad to 32 bytes; longer inputs keep their trailing 32 bytes.
pub fn pad32(raw: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    if raw.len() >= 32 {
        out.copy_from_slice(&raw[raw.len() - 32..]);
    } else {
        out[32 - raw.len()..].copy_from_slice(raw);
    }
    out
}

/// 32-byte big-endian encoding of a u64.
pub fn pad32_u64(v: u64) -> [u8; 32] {
    pad32(&v.to_be_bytes())
}

/// Interpret a big-endian slot value as a u64 (truncating high bytes).
pub fn slot_to_u64(raw: &[u8]) -> u64 {
    let padded = pad32(raw);
    let mut out = [0u8; 8];
    out.copy_from_slice(&padded[24..]);
    u64::from_be_bytes(out)
}

/// Best-effort hex decoding: servers sometimes return hex text where raw
/// bytes are expected. If the input parses as hex it is decoded, otherwise
/// it is returned as-is.
pub fn decode_force(raw: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return raw.to_vec();
    };
    let text = text.strip_prefix("0x").unwrap_or(text);
    match hex::decode(text) {
        Ok(decoded) => decoded,
        Err(_) => raw.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_roundtrip() {
        let a: Address = "0xaf60faa5cd840b724742f1af116168276112d6a6".parse().unwrap();
        assert_eq!(a.to_string(), "0xaf60faa5cd840b724742f1af116168276112d6a6");
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn slot_value_extraction() {
        let mut slot = [0u8; 32];
        slot[12..].copy_from_slice(&[0xaa; 20]);
        assert_eq!(Address::from_slot_value(&slot), Address([0xaa; 20]));
        // short values are padded before the slice
        assert_eq!(Address::from_slot_value(&[0x01]), Address({
            let mut b = [0u8; 20];
            b[19] = 0x01;
            b
        }));
    }

    #[test]
    fn decode_force_hex_and_raw() {
        assert_eq!(decode_force(b"0a0b"), vec![0x0a, 0x0b]);
        assert_eq!(decode_force(&[0xff, 0x00]), vec![0xff, 0x00]);
    }

    #[test]
    fn slot_to_u64_truncates() {
        assert_eq!(slot_to_u64(&pad32_u64(300)), 300);
        assert_eq!(slot_to_u64(&[]), 0);
    }
}
