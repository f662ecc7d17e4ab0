//! Crypto helpers: SHA-256 for protocol digests, Keccak-256 for addresses,
//! secp256k1 ECDSA with public-key recovery for everything signed.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint as _;
use sha2::{Digest as _, Sha256};
use sha3::{Digest as _, Keccak256};

use crate::util::Address;

/// Recoverable signature on the wire: r (32) || s (32) || recovery id (1).
pub type Signature65 = [u8; 65];

#[derive(Debug, thiserror::Error)]
#[error("signature invalid")]
pub struct SignatureError;

/// sha256(data) -> 32-byte digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// keccak256(data) -> 32-byte digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Derive the 20-byte address of a public key: last 20 bytes of
/// keccak256 over the uncompressed point without its 0x04 prefix.
pub fn public_key_to_address(vk: &VerifyingKey) -> Address {
    let point = vk.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address(out)
}

/// Address of the signing key's public half.
pub fn signing_key_address(sk: &SigningKey) -> Address {
    public_key_to_address(sk.verifying_key())
}

/// Sign a 32-byte digest, returning the recoverable 65-byte form.
pub fn sign_digest(sk: &SigningKey, digest: &[u8; 32]) -> Result<Signature65, SignatureError> {
    let (sig, rec_id) = sk
        .sign_prehash_recoverable(digest)
        .map_err(|_| SignatureError)?;
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&sig.to_bytes());
    out[64] = rec_id.to_byte();
    Ok(out)
}

/// Recover the signer's address from a digest and a 65-byte signature.
pub fn recover_address(digest: &[u8; 32], sig: &Signature65) -> Result<Address, SignatureError> {
    let signature = Signature::from_slice(&sig[..64]).map_err(|_| SignatureError)?;
    let rec_id = RecoveryId::from_byte(sig[64]).ok_or(SignatureError)?;
    let vk = VerifyingKey::recover_from_prehash(digest, &signature, rec_id)
        .map_err(|_| SignatureError)?;
    Ok(public_key_to_address(&vk))
}

/// Recover the uncompressed public key (65 bytes, 0x04-prefixed).
pub fn recover_public_key(digest: &[u8; 32], sig: &Signature65) -> Result<Vec<u8>, SignatureError> {
    let signature = Signature::from_slice(&sig[..64]).map_err(|_| SignatureError)?;
    let rec_id = RecoveryId::from_byte(sig[64]).ok_or(SignatureError)?;
    let vk = VerifyingKey::recover_from_prehash(digest, &signature, rec_id)
        .map_err(|_| SignatureError)?;
    Ok(vk.to_encoded_point(false).as_bytes().to_vec())
}

/// True iff `sig` over `digest` recovers to `signer`.
pub fn verify_recoverable(digest: &[u8; 32], sig: &Signature65, signer: Address) -> bool {
    matches!(recover_address(digest, sig), Ok(addr) if addr == signer)
}

/// Address of an uncompressed (or compressed) SEC1 public key encoding.
pub fn raw_public_key_to_address(raw: &[u8]) -> Result<Address, SignatureError> {
    let vk = VerifyingKey::from_sec1_bytes(raw).map_err(|_| SignatureError)?;
    Ok(public_key_to_address(&vk))
}

/// Parse a signing key from its 32-byte scalar.
pub fn signing_key_from_bytes(raw: &[u8]) -> Result<SigningKey, SignatureError> {
    SigningKey::from_slice(raw).map_err(|_| SignatureError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SigningKey {
        let mut raw = [seed; 32];
        raw[0] = 1; // keep the scalar nonzero and in range
        signing_key_from_bytes(&raw).unwrap()
    }

    #[test]
    fn sign_recover_roundtrip() {
        let sk = test_key(7);
        let me = signing_key_address(&sk);
        let digest = sha256(b"payload");
        let sig = sign_digest(&sk, &digest).unwrap();
        assert_eq!(recover_address(&digest, &sig).unwrap(), me);
        assert!(verify_recoverable(&digest, &sig, me));
    }

    #[test]
    fn tampered_digest_recovers_other_address() {
        let sk = test_key(9);
        let me = signing_key_address(&sk);
        let digest = sha256(b"payload");
        let sig = sign_digest(&sk, &digest).unwrap();
        let other = sha256(b"other");
        assert!(!verify_recoverable(&other, &sig, me));
    }

    #[test]
    fn bad_recovery_id_is_rejected() {
        let sk = test_key(11);
        let digest = sha256(b"payload");
        let mut sig = sign_digest(&sk, &digest).unwrap();
        sig[64] = 17;
        assert!(recover_address(&digest, &sig).is_err());
    }
}
