//! Name resolution and verified account reads against a scripted slot
//! store with real proof trees.

use std::collections::HashMap;

use async_trait::async_trait;

use diode_core::bert::Term;
use diode_core::blockquick::Hash;
use diode_core::contract;
use diode_core::merkle::MerkleTree;
use diode_core::util::{pad32_u64, Address};
use diode_net::bns::{resolve_bns, resolve_bns_owner, resolve_reverse_bns};
use diode_net::chain::{get_account_value_raw, AccountReader};
use diode_net::error::Error;

/// Slot store backed by one single-leaf proof per key; each proof's
/// modulo is its index in the served root list.
#[derive(Default)]
struct MockReader {
    trees: HashMap<[u8; 32], MerkleTree>,
    roots: Vec<Hash>,
    /// Serve a wrong root at this modulo (merkle tampering).
    corrupt_at: Option<usize>,
}

impl MockReader {
    fn insert(&mut self, key: [u8; 32], value: Vec<u8>) {
        let leaf = Term::Tuple(vec![
            Term::bytes(vec![0u8]),
            Term::Int(self.roots.len() as u64),
            Term::Tuple(vec![Term::bytes(key.to_vec()), Term::Bytes(value)]),
        ]);
        let tree = MerkleTree::parse(&leaf).unwrap();
        self.roots.push(tree.root_hash);
        self.trees.insert(key, tree);
    }

    fn insert_address(&mut self, key: [u8; 32], addr: Address) {
        let mut value = [0u8; 32];
        value[12..].copy_from_slice(addr.as_bytes());
        self.insert(key, value.to_vec());
    }
}

#[async_trait]
impl AccountReader for MockReader {
    async fn account_value(
        &self,
        _block: u64,
        _addr: Address,
        key: [u8; 32],
    ) -> diode_net::Result<MerkleTree> {
        self.trees
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::rpc("getaccountvalue", "no such key"))
    }

    async fn account_roots(&self, _block: u64, _addr: Address) -> diode_net::Result<Vec<Hash>> {
        let mut roots = self.roots.clone();
        if let Some(at) = self.corrupt_at {
            roots[at] = [0xcc; 32];
        }
        Ok(roots)
    }
}

#[tokio::test]
async fn resolves_multi_destination_names() {
    let mut reader = MockReader::default();
    let aa = Address([0xaa; 20]);
    let bb = Address([0xbb; 20]);

    reader.insert(
        contract::bns_destination_array_location("pi"),
        pad32_u64(2).to_vec(),
    );
    reader.insert_address(contract::bns_destination_array_element_location("pi", 0), aa);
    reader.insert_address(contract::bns_destination_array_element_location("pi", 1), bb);

    let addrs = resolve_bns(&reader, "pi").await.unwrap();
    assert_eq!(addrs, vec![aa, bb]);
}

#[tokio::test]
async fn resolves_legacy_single_entry() {
    let mut reader = MockReader::default();
    let dest = Address([0x11; 20]);
    // no destination array stored at all
    reader.insert(
        contract::bns_destination_array_location("solo"),
        pad32_u64(0).to_vec(),
    );
    reader.insert_address(contract::bns_entry_location("solo"), dest);

    let addrs = resolve_bns(&reader, "solo").await.unwrap();
    assert_eq!(addrs, vec![dest]);
}

#[tokio::test]
async fn empty_entry_is_an_error() {
    let mut reader = MockReader::default();
    reader.insert(
        contract::bns_destination_array_location("ghost"),
        pad32_u64(0).to_vec(),
    );
    reader.insert(contract::bns_entry_location("ghost"), vec![0u8; 32]);

    let err = resolve_bns(&reader, "ghost").await.unwrap_err();
    assert!(matches!(err, Error::EmptyBnsResult));
}

#[tokio::test]
async fn oversized_entry_count_falls_back() {
    let mut reader = MockReader::default();
    // implausible array length is ignored; the legacy slot wins
    reader.insert(
        contract::bns_destination_array_location("big"),
        pad32_u64(1000).to_vec(),
    );
    let dest = Address([0x22; 20]);
    reader.insert_address(contract::bns_entry_location("big"), dest);

    let addrs = resolve_bns(&reader, "big").await.unwrap();
    assert_eq!(addrs, vec![dest]);
}

#[tokio::test]
async fn owner_lookup() {
    let mut reader = MockReader::default();
    let owner = Address([0x33; 20]);
    reader.insert_address(contract::bns_owner_location("pi"), owner);
    assert_eq!(resolve_bns_owner(&reader, "pi").await.unwrap(), owner);
}

#[tokio::test]
async fn reverse_lookup_even_and_odd_tags() {
    let device = Address([0x44; 20]);
    let key = contract::bns_reverse_entry_location(device);

    // even tag: length*2 in the trailing two bytes
    let mut reader = MockReader::default();
    let mut slot = vec![0u8; 32];
    slot[..6].copy_from_slice(b"mypi42");
    slot[30..].copy_from_slice(&(12u16).to_be_bytes());
    reader.insert(key, slot);
    assert_eq!(resolve_reverse_bns(&reader, device).await.unwrap(), "mypi42");

    // odd tag: the name spills into further slots; only the first 30
    // bytes are read
    let mut reader = MockReader::default();
    let mut slot = vec![0x61u8; 32]; // 'a' everywhere
    slot[30..].copy_from_slice(&(61u16).to_be_bytes());
    reader.insert(key, slot);
    let name = resolve_reverse_bns(&reader, device).await.unwrap();
    assert_eq!(name.len(), 30);
}

#[tokio::test]
async fn bad_merkle_proof_is_rejected() {
    let mut reader = MockReader::default();
    let key = contract::bns_entry_location("pi");
    reader.insert_address(key, Address([0xaa; 20]));
    reader.corrupt_at = Some(0);

    let err = get_account_value_raw(&reader, 0, contract::BNS_ADDR, &key)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadMerkleProof));
}

#[tokio::test]
async fn verified_read_returns_leaf_bytes() {
    let mut reader = MockReader::default();
    let key = pad32_u64(7);
    reader.insert(key, b"leaf-value".to_vec());

    let raw = get_account_value_raw(&reader, 0, contract::BNS_ADDR, &key)
        .await
        .unwrap();
    assert_eq!(raw, b"leaf-value");
}
