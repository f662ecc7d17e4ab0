//! Name resolution against the on-chain registry, over verified reads.

use tracing::{error, info};

use diode_core::contract;
use diode_core::util::{slot_to_u64, Address};

use crate::chain::{get_account_value_int, get_account_value_raw, AccountReader};
use crate::error::{Error, Result};

/// Registry entries may not fan out to more than this many destinations.
const MAX_BNS_ENTRIES: u64 = 128;

/// Resolve `name` to its destination addresses, in registry order.
pub async fn resolve_bns<R>(reader: &R, name: &str) -> Result<Vec<Address>>
where
    R: AccountReader + Sync,
{
    info!(name, "resolving name");
    let array_key = contract::bns_destination_array_location(name);
    let mut size = get_account_value_int(reader, 0, contract::BNS_ADDR, &array_key).await?;

    if size > MAX_BNS_ENTRIES {
        error!(size, "read invalid entry count");
        size = 0;
    }

    // Old single-destination entries have no array at all.
    if size == 0 {
        let key = contract::bns_entry_location(name);
        let raw = get_account_value_raw(reader, 0, contract::BNS_ADDR, &key).await?;
        let addr = Address::from_slot_value(&raw);
        if addr.is_zero() {
            return Err(Error::EmptyBnsResult);
        }
        return Ok(vec![addr]);
    }

    let mut out = Vec::with_capacity(size as usize);
    for i in 0..size {
        let key = contract::bns_destination_array_element_location(name, i);
        match get_account_value_raw(reader, 0, contract::BNS_ADDR, &key).await {
            Ok(raw) => out.push(Address::from_slot_value(&raw)),
            Err(err) => {
                error!(index = i, %err, "skipping unreadable entry");
            }
        }
    }
    if out.is_empty() {
        return Err(Error::EmptyBnsResult);
    }
    Ok(out)
}

/// Resolve the owner of `name`.
pub async fn resolve_bns_owner<R>(reader: &R, name: &str) -> Result<Address>
where
    R: AccountReader + Sync,
{
    let key = contract::bns_owner_location(name);
    let raw = get_account_value_raw(reader, 0, contract::BNS_ADDR, &key).await?;
    let addr = Address::from_slot_value(&raw);
    if addr.is_zero() {
        return Err(Error::EmptyBnsResult);
    }
    Ok(addr)
}

/// Reverse-resolve `addr` to its primary name. The name is stored as a
/// length-tagged string in one slot; an odd length tag marks a
/// multi-slot entry of which only the first 30 bytes are read here.
pub async fn resolve_reverse_bns<R>(reader: &R, addr: Address) -> Result<String>
where
    R: AccountReader + Sync,
{
    let key = contract::bns_reverse_entry_location(addr);
    let raw = get_account_value_raw(reader, 0, contract::BNS_ADDR, &key).await?;
    if raw.len() < 2 {
        return Err(Error::EmptyBnsResult);
    }

    let size = slot_to_u64(&raw[raw.len() - 2..]);
    if size % 2 == 0 {
        let size = ((size / 2) as usize).min(raw.len());
        return Ok(String::from_utf8_lossy(&raw[..size]).into_owned());
    }
    // TODO: fetch the remaining string slots of long names
    let size = 30usize.min(raw.len());
    Ok(String::from_utf8_lossy(&raw[..size]).into_owned())
}
