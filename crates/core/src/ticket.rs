//! Signed usage tickets submitted to edge servers.

use crate::bert::{self, Term};
use crate::blockquick::Hash;
use crate::crypto::{self, Signature65};
use crate::util::Address;
use k256::ecdsa::SigningKey;

/// One usage record. `total_bytes` and `total_connections` never decrease
/// for a given (client, server, fleet) triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTicket {
    pub server_id: Address,
    pub block_number: u64,
    pub block_hash: Hash,
    pub fleet_addr: Address,
    pub total_connections: u64,
    pub total_bytes: u64,
    pub local_addr: Vec<u8>,
    pub device_sig: Signature65,
}

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("ticket field out of range: {0}")]
    BadValue(&'static str),
    #[error("ticket not verifiable after signing")]
    NotVerifiable,
}

impl DeviceTicket {
    /// The digest the device signs: server, block hash, fleet and the
    /// usage counters. The block number is committed via the hash.
    pub fn signing_digest(&self) -> Hash {
        let term = Term::Tuple(vec![
            Term::bytes(self.server_id.as_bytes().to_vec()),
            Term::bytes(self.block_hash.to_vec()),
            Term::bytes(self.fleet_addr.as_bytes().to_vec()),
            Term::Int(self.total_connections),
            Term::Int(self.total_bytes),
            Term::bytes(self.local_addr.clone()),
        ]);
        let encoded = bert::encode(&term).unwrap_or_default();
        crypto::sha256(&encoded)
    }

    /// Sanity-check fields before signing.
    pub fn validate_values(&self) -> Result<(), TicketError> {
        if self.server_id.is_zero() {
            return Err(TicketError::BadValue("server_id"));
        }
        if self.fleet_addr.is_zero() {
            return Err(TicketError::BadValue("fleet_addr"));
        }
        if self.local_addr.len() > 128 {
            return Err(TicketError::BadValue("local_addr"));
        }
        Ok(())
    }

    pub fn sign(&mut self, key: &SigningKey) -> Result<(), TicketError> {
        self.device_sig = crypto::sign_digest(key, &self.signing_digest())
            .map_err(|_| TicketError::NotVerifiable)?;
        Ok(())
    }

    /// True iff the device signature recovers to `device`.
    pub fn validate_device_sig(&self, device: Address) -> bool {
        crypto::verify_recoverable(&self.signing_digest(), &self.device_sig, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{signing_key_address, signing_key_from_bytes};

    fn test_key() -> SigningKey {
        let mut raw = [5u8; 32];
        raw[0] = 1;
        signing_key_from_bytes(&raw).unwrap()
    }

    fn base_ticket() -> DeviceTicket {
        DeviceTicket {
            server_id: Address([1u8; 20]),
            block_number: 1234,
            block_hash: [7u8; 32],
            fleet_addr: Address([2u8; 20]),
            total_connections: 3,
            total_bytes: 4_200_000,
            local_addr: b"127.0.0.1:41046".to_vec(),
            device_sig: [0u8; 65],
        }
    }

    #[test]
    fn sign_then_validate() {
        let key = test_key();
        let me = signing_key_address(&key);
        let mut ticket = base_ticket();
        ticket.validate_values().unwrap();
        ticket.sign(&key).unwrap();
        assert!(ticket.validate_device_sig(me));
        assert!(!ticket.validate_device_sig(Address([9u8; 20])));
    }

    #[test]
    fn counters_change_digest() {
        let key = test_key();
        let me = signing_key_address(&key);
        let mut ticket = base_ticket();
        ticket.sign(&key).unwrap();
        let mut bumped = ticket.clone();
        bumped.total_bytes += 1;
        // old signature no longer covers the bumped counters
        assert!(!bumped.validate_device_sig(me));
    }

    #[test]
    fn zero_fleet_is_rejected() {
        let mut ticket = base_ticket();
        ticket.fleet_addr = Address::ZERO;
        assert!(ticket.validate_values().is_err());
    }
}
