//! BlockQuick bootstrap scenarios against a scripted header source.

use async_trait::async_trait;
use tempfile::TempDir;

use diode_core::blockquick::{BlockHeader, WINDOW_SIZE};
use diode_core::crypto::{sign_digest, signing_key_from_bytes};
use diode_net::error::Error;
use diode_net::validate::{validate_network, AnchorConfig, ChainSource};
use diode_store::{ClientDb, StoreOptions};
use k256::ecdsa::SigningKey;

fn miner_key() -> SigningKey {
    let mut raw = [42u8; 32];
    raw[0] = 1;
    signing_key_from_bytes(&raw).unwrap()
}

/// Consecutive signed headers numbered 1..=len.
fn make_chain(len: usize) -> Vec<BlockHeader> {
    let key = miner_key();
    let mut out = Vec::with_capacity(len);
    let mut parent = [0u8; 32];
    for i in 0..len {
        let mut header = BlockHeader {
            parent_hash: parent,
            state_root: [2u8; 32],
            transaction_root: [3u8; 32],
            receipt_root: [4u8; 32],
            number: (i + 1) as u64,
            timestamp: 1_600_000_000 + i as u64,
            nonce: i as u64,
            miner_sig: [0u8; 65],
        };
        header.miner_sig = sign_digest(&key, &header.signing_digest()).unwrap();
        parent = header.hash();
        out.push(header);
    }
    out
}

struct MockSource {
    chain: Vec<BlockHeader>,
    peak: u64,
    /// When set, `getblockquick2` pretends there is nothing new.
    empty_sequence: bool,
}

impl MockSource {
    fn new(chain: Vec<BlockHeader>) -> MockSource {
        let peak = chain.len() as u64;
        MockSource {
            chain,
            peak,
            empty_sequence: false,
        }
    }

    fn header(&self, number: u64) -> Option<BlockHeader> {
        if number == 0 {
            return None;
        }
        self.chain.get(number as usize - 1).cloned()
    }
}

#[async_trait]
impl ChainSource for MockSource {
    async fn block_peak(&self) -> diode_net::Result<u64> {
        Ok(self.peak)
    }

    async fn block_header(&self, number: u64) -> diode_net::Result<BlockHeader> {
        self.header(number)
            .ok_or_else(|| Error::rpc("getblockheader2", format!("no block {}", number)))
    }

    async fn block_sequence(&self, last_valid: u64, count: u64) -> diode_net::Result<Vec<u64>> {
        if self.empty_sequence {
            return Ok(Vec::new());
        }
        let top = (last_valid + count).min(self.chain.len() as u64);
        Ok((last_valid + 1..=top).collect())
    }
}

fn open_db(dir: &TempDir) -> ClientDb {
    ClientDb::open(dir.path(), StoreOptions::default()).unwrap()
}

fn anchor_at(chain: &[BlockHeader], number: u64) -> AnchorConfig {
    AnchorConfig {
        genesis_number: number,
        genesis_hash: chain[number as usize - 1].hash(),
    }
}

#[tokio::test]
async fn validates_from_stored_anchor() {
    let chain = make_chain(220);
    let source = MockSource::new(chain.clone());
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    // stored anchor at block 100
    db.set_last_valid(100, chain[99].hash()).unwrap();
    let window = validate_network(&source, &db, &anchor_at(&chain, 100))
        .await
        .unwrap();

    let (lvbn, lvbh) = window.last();
    assert!(lvbn >= 100, "window must not move backwards");
    assert_eq!(window.len(), WINDOW_SIZE);
    // the new anchor is persisted
    assert_eq!(db.last_valid().unwrap(), Some((lvbn, lvbh)));
    // advanced by one full getblockquick2 batch, still under the peak
    assert_eq!(lvbn, 100 + (WINDOW_SIZE + 6 + 1) as u64);
}

#[tokio::test]
async fn anchor_mismatch_recovers_on_retry() {
    let chain = make_chain(220);
    let source = MockSource::new(chain.clone());
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    // stored hash disagrees with the served chain
    db.set_last_valid(100, [0xee; 32]).unwrap();
    let anchor = anchor_at(&chain, 100);

    let err = validate_network(&source, &db, &anchor).await.unwrap_err();
    assert!(matches!(err, Error::AnchorLost));
    // the bad anchor was dropped
    assert_eq!(db.last_valid().unwrap(), None);

    // second run starts from the default anchor and succeeds
    let window = validate_network(&source, &db, &anchor).await.unwrap();
    assert!(window.last().0 > 100);
}

#[tokio::test]
async fn stalled_chain_is_no_progress() {
    let chain = make_chain(400);
    let mut source = MockSource::new(chain.clone());
    source.empty_sequence = true;

    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.set_last_valid(100, chain[99].hash()).unwrap();

    // the peak is far ahead but the server feeds no new headers
    let err = validate_network(&source, &db, &anchor_at(&chain, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoProgress));
}

#[tokio::test]
async fn short_window_fails() {
    // only 50 blocks exist below the anchor
    let chain = make_chain(50);
    let source = MockSource::new(chain.clone());
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.set_last_valid(50, chain[49].hash()).unwrap();

    let err = validate_network(&source, &db, &anchor_at(&chain, 50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rpc { .. } | Error::Validation(_)));
}
