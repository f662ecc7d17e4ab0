//! Merkle proof trees returned by `getaccountvalue` and `getaccount`.
//!
//! A proof is a path through a binary trie encoded as nested terms. An
//! inner node is a two-element list where each side is either the bare
//! 32-byte hash of a pruned subtree or the subtree itself; the node hash
//! is sha256 over the encoded pair of child hashes. The leaf is a tuple
//! `(prefix, modulo, (key, value), ...)` and hashes as its own encoding.

use crate::bert::{self, Term};
use crate::blockquick::Hash;
use crate::crypto;

#[derive(Clone, Debug)]
pub struct MerkleTree {
    pub root_hash: Hash,
    /// Slot index of the proven leaf inside the root set.
    pub modulo: u64,
    leaves: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed merkle proof: {0}")]
pub struct ProofError(pub &'static str);

struct Parsed {
    hash: Hash,
    leaf: Option<(u64, Vec<(Vec<u8>, Vec<u8>)>)>,
}

impl MerkleTree {
    pub fn parse(term: &Term) -> Result<MerkleTree, ProofError> {
        let parsed = parse_node(term, 0)?;
        let (modulo, leaves) = parsed.leaf.ok_or(ProofError("no leaf in proof"))?;
        Ok(MerkleTree {
            root_hash: parsed.hash,
            modulo,
            leaves,
        })
    }

    /// Value bytes for `key`, if the proven leaf holds it.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.leaves
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn leaves(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.leaves
    }
}

const MAX_PROOF_DEPTH: usize = 64;

fn parse_node(term: &Term, depth: usize) -> Result<Parsed, ProofError> {
    if depth > MAX_PROOF_DEPTH {
        return Err(ProofError("proof too deep"));
    }
    match term {
        // leaf: (prefix, modulo, (key, value)...)
        Term::Tuple(items) => {
            if items.len() < 2 {
                return Err(ProofError("short leaf tuple"));
            }
            items[0].as_bytes().ok_or(ProofError("leaf prefix"))?;
            let modulo = items[1].as_u64().ok_or(ProofError("leaf modulo"))?;
            let mut pairs = Vec::with_capacity(items.len() - 2);
            for item in &items[2..] {
                let pair = item.as_tuple().ok_or(ProofError("leaf pair"))?;
                if pair.len() != 2 {
                    return Err(ProofError("leaf pair arity"));
                }
                let key = pair[0].as_bytes().ok_or(ProofError("leaf key"))?;
                let value = pair[1].as_bytes().ok_or(ProofError("leaf value"))?;
                pairs.push((key.to_vec(), value.to_vec()));
            }
            let encoded = bert::encode(term).map_err(|_| ProofError("leaf too large"))?;
            Ok(Parsed {
                hash: crypto::sha256(&encoded),
                leaf: Some((modulo, pairs)),
            })
        }
        // inner node: [left, right]
        Term::List(items) => {
            if items.len() != 2 {
                return Err(ProofError("inner node arity"));
            }
            let left = parse_side(&items[0], depth)?;
            let right = parse_side(&items[1], depth)?;
            let leaf = match (left.leaf, right.leaf) {
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (None, None) => None,
                (Some(_), Some(_)) => return Err(ProofError("two leaves in proof")),
            };
            let pair = Term::List(vec![
                Term::bytes(left.hash.to_vec()),
                Term::bytes(right.hash.to_vec()),
            ]);
            let encoded = bert::encode(&pair).map_err(|_| ProofError("node too large"))?;
            Ok(Parsed {
                hash: crypto::sha256(&encoded),
                leaf,
            })
        }
        _ => Err(ProofError("unexpected node term")),
    }
}

fn parse_side(term: &Term, depth: usize) -> Result<Parsed, ProofError> {
    // a pruned sibling is its bare 32-byte hash
    if let Some(hash) = term.as_hash() {
        return Ok(Parsed { hash, leaf: None });
    }
    parse_node(term, depth + 1)
}
