//! BlockQuick sliding-window header verification.
//!
//! The window holds the last `WINDOW_SIZE` accepted headers. Each miner's
//! weight is the number of headers they mined inside the window. A new
//! header is admitted when it chains on the tail, its signature recovers,
//! and the distinct miners of the confirmation tail (the last
//! `CONFIRMATION_SIZE` accepted headers) hold a summed weight strictly
//! above half the window.

use std::collections::{HashMap, VecDeque};

use crate::bert::{self, Term};
use crate::crypto::{self, Signature65};
use crate::util::Address;

pub const WINDOW_SIZE: usize = 100;
pub const CONFIRMATION_SIZE: usize = 6;

pub type Hash = [u8; 32];

#[derive(Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: Hash,
    pub state_root: Hash,
    pub transaction_root: Hash,
    pub receipt_root: Hash,
    pub number: u64,
    pub timestamp: u64,
    pub nonce: u64,
    pub miner_sig: Signature65,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window needs exactly {expected} headers, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("header {number} does not chain on its parent")]
    BrokenChain { number: u64 },
    #[error("header {number} carries an invalid miner signature")]
    SignatureInvalid { number: u64 },
    #[error("header {number} lacks miner majority in the window")]
    InsufficientWeight { number: u64 },
}

impl BlockHeader {
    fn unsigned_term(&self) -> Term {
        Term::Tuple(vec![
            Term::bytes(self.parent_hash.to_vec()),
            Term::bytes(self.state_root.to_vec()),
            Term::bytes(self.transaction_root.to_vec()),
            Term::bytes(self.receipt_root.to_vec()),
            Term::Int(self.number),
            Term::Int(self.timestamp),
            Term::Int(self.nonce),
        ])
    }

    /// Digest the miner signed.
    pub fn signing_digest(&self) -> Hash {
        // header terms always fit the frame limit, encoding cannot fail
        let encoded = bert::encode(&self.unsigned_term()).unwrap_or_default();
        crypto::sha256(&encoded)
    }

    /// The 32-byte hash commitment, covering the miner signature too.
    pub fn hash(&self) -> Hash {
        let term = match self.unsigned_term() {
            Term::Tuple(mut items) => {
                items.push(Term::bytes(self.miner_sig.to_vec()));
                Term::Tuple(items)
            }
            other => other,
        };
        let encoded = bert::encode(&term).unwrap_or_default();
        crypto::sha256(&encoded)
    }

    /// Recover the miner address; `None` when the signature is garbage.
    pub fn miner(&self) -> Option<Address> {
        crypto::recover_address(&self.signing_digest(), &self.miner_sig).ok()
    }

    pub fn validate_sig(&self) -> bool {
        self.miner().is_some()
    }
}

impl std::fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHeader")
            .field("number", &self.number)
            .field("hash", &hex::encode(self.hash()))
            .field("parent", &hex::encode(self.parent_hash))
            .finish()
    }
}

pub struct Window {
    headers: VecDeque<BlockHeader>,
    miners: VecDeque<Address>,
    weights: HashMap<Address, usize>,
}

impl Window {
    /// Build a window from exactly `WINDOW_SIZE` consecutive headers.
    /// Chain linkage and every miner signature are validated here.
    pub fn new(headers: Vec<BlockHeader>) -> Result<Window, WindowError> {
        if headers.len() != WINDOW_SIZE {
            return Err(WindowError::WrongLength {
                expected: WINDOW_SIZE,
                got: headers.len(),
            });
        }
        let mut miners = VecDeque::with_capacity(WINDOW_SIZE);
        let mut weights: HashMap<Address, usize> = HashMap::new();
        for (i, header) in headers.iter().enumerate() {
            if i > 0 && header.parent_hash != headers[i - 1].hash() {
                return Err(WindowError::BrokenChain { number: header.number });
            }
            let miner = header
                .miner()
                .ok_or(WindowError::SignatureInvalid { number: header.number })?;
            *weights.entry(miner).or_default() += 1;
            miners.push_back(miner);
        }
        Ok(Window {
            headers: headers.into(),
            miners,
            weights,
        })
    }

    /// Number and hash of the highest accepted header.
    pub fn last(&self) -> (u64, Hash) {
        // the window is never empty by construction
        let tail = self.headers.back().expect("window is non-empty");
        (tail.number, tail.hash())
    }

    /// Look up a header still inside the window.
    pub fn get(&self, number: u64) -> Option<&BlockHeader> {
        self.headers.iter().find(|h| h.number == number)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Admit one header and slide the window.
    pub fn add_block(&mut self, header: BlockHeader) -> Result<(), WindowError> {
        let tail_hash = self.last().1;
        if header.parent_hash != tail_hash {
            return Err(WindowError::BrokenChain { number: header.number });
        }
        let miner = header
            .miner()
            .ok_or(WindowError::SignatureInvalid { number: header.number })?;

        // distinct miners of the confirmation tail must hold a majority
        let mut tail_miners: Vec<Address> = self
            .miners
            .iter()
            .rev()
            .take(CONFIRMATION_SIZE)
            .copied()
            .collect();
        tail_miners.sort_unstable();
        tail_miners.dedup();
        let weight: usize = tail_miners
            .iter()
            .map(|m| self.weights.get(m).copied().unwrap_or(0))
            .sum();
        if weight * 2 <= WINDOW_SIZE {
            return Err(WindowError::InsufficientWeight { number: header.number });
        }

        // slide: evict the oldest, append the candidate
        if let Some(evicted) = self.miners.pop_front() {
            self.headers.pop_front();
            match self.weights.get_mut(&evicted) {
                Some(w) if *w > 1 => *w -= 1,
                _ => {
                    self.weights.remove(&evicted);
                }
            }
        }
        *self.weights.entry(miner).or_default() += 1;
        self.miners.push_back(miner);
        self.headers.push_back(header);
        Ok(())
    }
}
