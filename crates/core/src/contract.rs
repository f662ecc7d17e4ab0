//! Storage-slot locations for the on-chain contracts the client reads.
//!
//! All lookups follow the chain's mapping layout: the slot of
//! `mapping[key]` at mapping slot `n` is `keccak256(pad32(key) ++ pad32(n))`,
//! and dynamic array elements live at `keccak256(pad32(slot)) + i`.

use crate::crypto::keccak256;
use crate::util::{pad32, pad32_u64, Address};

/// The name-service registry contract.
pub const BNS_ADDR: Address = Address([
    0xaf, 0x60, 0xfa, 0xa5, 0xcd, 0x84, 0x0b, 0x72, 0x47, 0x42, 0xf1, 0xaf, 0x11, 0x61, 0x68,
    0x27, 0x61, 0x12, 0xd6, 0xa6,
]);

/// Fleet used when the operator configured none.
pub const DEFAULT_FLEET_ADDR: Address = Address([
    0x60, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
]);

// BNS registry layout: entries mapping at slot 0 (destination, owner and
// the destination array occupy consecutive slots of the entry struct),
// reverse mapping at slot 1. Fleet allowlist mapping at slot 0.
const BNS_ENTRY_SLOT: u64 = 0;
const BNS_REVERSE_SLOT: u64 = 1;
const FLEET_ALLOWLIST_SLOT: u64 = 0;

fn mapping_slot(key: &[u8; 32], slot: u64) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(key);
    buf[32..].copy_from_slice(&pad32_u64(slot));
    keccak256(&buf)
}

fn slot_add(slot: [u8; 32], offset: u64) -> [u8; 32] {
    // 256-bit big-endian addition; offsets are tiny
    let mut out = slot;
    let mut carry = offset;
    for byte in out.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u64 + (carry & 0xff);
        *byte = sum as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
    out
}

fn name_key(name: &str) -> [u8; 32] {
    keccak256(name.as_bytes())
}

/// Slot of the single destination address of `name`.
pub fn bns_entry_location(name: &str) -> [u8; 32] {
    mapping_slot(&name_key(name), BNS_ENTRY_SLOT)
}

/// Slot of the owner address of `name`.
pub fn bns_owner_location(name: &str) -> [u8; 32] {
    slot_add(bns_entry_location(name), 1)
}

/// Slot holding the destination array length of `name`.
pub fn bns_destination_array_location(name: &str) -> [u8; 32] {
    slot_add(bns_entry_location(name), 2)
}

/// Slot of element `index` of the destination array of `name`.
pub fn bns_destination_array_element_location(name: &str, index: u64) -> [u8; 32] {
    let base = keccak256(&bns_destination_array_location(name));
    slot_add(base, index)
}

/// Slot of the reverse entry (address -> name) of `addr`.
pub fn bns_reverse_entry_location(addr: Address) -> [u8; 32] {
    mapping_slot(&pad32(addr.as_bytes()), BNS_REVERSE_SLOT)
}

/// Slot of the allowlist flag for `client` inside a fleet contract.
pub fn device_allowlist_key(client: Address) -> [u8; 32] {
    mapping_slot(&pad32(client.as_bytes()), FLEET_ALLOWLIST_SLOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_are_distinct_and_stable() {
        let entry = bns_entry_location("pi");
        assert_eq!(entry, bns_entry_location("pi"));
        assert_ne!(entry, bns_entry_location("pj"));
        assert_ne!(entry, bns_owner_location("pi"));
        assert_ne!(entry, bns_destination_array_location("pi"));
    }

    #[test]
    fn array_elements_are_consecutive() {
        let e0 = bns_destination_array_element_location("pi", 0);
        let e1 = bns_destination_array_element_location("pi", 1);
        assert_eq!(slot_add(e0, 1), e1);
    }

    #[test]
    fn slot_add_carries() {
        let mut base = [0u8; 32];
        base[31] = 0xff;
        let bumped = slot_add(base, 1);
        assert_eq!(bumped[31], 0);
        assert_eq!(bumped[30], 1);
    }
}
