//! Network validation: bootstrap the BlockQuick window from the stored
//! anchor and advance it to the server's confirmed peak.

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use diode_core::blockquick::{BlockHeader, Hash, Window, CONFIRMATION_SIZE, WINDOW_SIZE};
use diode_store::ClientDb;

use crate::error::{Error, Result};

/// Header supply for validation; implemented by the RPC client and by
/// the test fixtures.
#[async_trait]
pub trait ChainSource {
    async fn block_peak(&self) -> Result<u64>;
    async fn block_header(&self, number: u64) -> Result<BlockHeader>;
    /// `getblockquick2`: block numbers continuing the chain above
    /// `last_valid`, at most `count` of them.
    async fn block_sequence(&self, last_valid: u64, count: u64) -> Result<Vec<u64>>;
}

/// Trust anchor used when the store holds nothing.
#[derive(Clone, Copy, Debug)]
pub struct AnchorConfig {
    pub genesis_number: u64,
    pub genesis_hash: Hash,
}

/// Run the BlockQuick bootstrap. On success the new `Last()` anchor is
/// persisted and the fresh window returned. `AnchorLost` means the
/// stored reference block did not match and was dropped; the caller may
/// retry once to start over from the defaults.
pub async fn validate_network<S>(source: &S, db: &ClientDb, anchor: &AnchorConfig) -> Result<Window>
where
    S: ChainSource + Sync,
{
    let (lvbn, lvbh) = db
        .last_valid()
        .unwrap_or_default()
        .unwrap_or((anchor.genesis_number, anchor.genesis_hash));
    let window_min = lvbn.saturating_sub(WINDOW_SIZE as u64 - 1);
    debug!(lvbn, window_min, "fetching trusted window");

    let headers = fetch_headers(source, (window_min..=lvbn).collect()).await?;
    if headers.len() != WINDOW_SIZE {
        return Err(Error::Validation(format!(
            "expected {} window headers, got {}",
            WINDOW_SIZE,
            headers.len()
        )));
    }

    // The reference block must match the stored anchor hash; a mismatch
    // drops the anchor so the retry starts from the defaults.
    let tail_hash = headers[WINDOW_SIZE - 1].hash();
    if tail_hash != lvbh {
        warn!(lvbn, "reference block does not match, resetting anchor");
        db.clear_last_valid()
            .map_err(|e| Error::Validation(e.to_string()))?;
        return Err(Error::AnchorLost);
    }

    // Window::new validates chain linkage and every miner signature.
    let mut window = Window::new(headers)?;

    let peak = source.block_peak().await?;
    let block_max = peak.saturating_sub(CONFIRMATION_SIZE as u64) + 1;
    let sequence = source
        .block_sequence(lvbn, (WINDOW_SIZE + CONFIRMATION_SIZE + 1) as u64)
        .await?;
    let fresh = fetch_headers(source, sequence).await?;
    for header in fresh {
        // blocks arrive ordered by number; stop at the confirmed peak
        if header.number > block_max {
            break;
        }
        window.add_block(header)?;
    }

    let (new_lvbn, new_lvbh) = window.last();
    if new_lvbn == lvbn && peak.saturating_sub(WINDOW_SIZE as u64) > lvbn {
        return Err(Error::NoProgress);
    }

    db.set_last_valid(new_lvbn, new_lvbh)
        .map_err(|e| Error::Validation(e.to_string()))?;
    info!(lvbn = new_lvbn, "network validated");
    Ok(window)
}

async fn fetch_headers<S>(source: &S, numbers: Vec<u64>) -> Result<Vec<BlockHeader>>
where
    S: ChainSource + Sync,
{
    try_join_all(numbers.into_iter().map(|n| source.block_header(n))).await
}
