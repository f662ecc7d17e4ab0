//! Verified account reads: every storage value is checked against the
//! account roots of the validated block before it is believed.

use async_trait::async_trait;

use diode_core::blockquick::Hash;
use diode_core::merkle::MerkleTree;
use diode_core::util::{pad32, Address};

use crate::error::{Error, Result};

/// Raw chain access needed for a verified read; implemented by the RPC
/// client and by test fixtures.
#[async_trait]
pub trait AccountReader {
    /// `getaccountvalue` proof for `(addr, key)` at `block` (0 = last valid).
    async fn account_value(&self, block: u64, addr: Address, key: [u8; 32]) -> Result<MerkleTree>;
    /// `getaccountroots` for `addr` at `block`.
    async fn account_roots(&self, block: u64, addr: Address) -> Result<Vec<Hash>>;
}

/// Read one storage slot, verifying the proof root against the account
/// roots at the proof's modulo. Missing keys read as empty.
pub async fn get_account_value_raw<R>(
    reader: &R,
    block: u64,
    addr: Address,
    key: &[u8],
) -> Result<Vec<u8>>
where
    R: AccountReader + Sync,
{
    let key = pad32(key);
    let tree = reader.account_value(block, addr, key).await?;
    let roots = reader.account_roots(block, addr).await?;

    let position = roots.iter().position(|root| *root == tree.root_hash);
    if position != Some(tree.modulo as usize) {
        tracing::error!(
            ?position,
            modulo = tree.modulo,
            "received wrong merkle proof"
        );
        return Err(Error::BadMerkleProof);
    }
    Ok(tree.get(&key).map(|v| v.to_vec()).unwrap_or_default())
}

/// Like [`get_account_value_raw`] but interpreting the slot as a number.
pub async fn get_account_value_int<R>(
    reader: &R,
    block: u64,
    addr: Address,
    key: &[u8],
) -> Result<u64>
where
    R: AccountReader + Sync,
{
    let raw = get_account_value_raw(reader, block, addr, key).await?;
    Ok(diode_core::util::slot_to_u64(&raw))
}
