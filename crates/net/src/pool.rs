//! Shared registry of open tunnel ports, keyed by (client id, server
//! reference). Ports hold the client id only; the client walks the pool
//! by id on shutdown, so there is no handle cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use diode_core::util::Address;

/// Per-port bounded inbound queue depth. Frames beyond this block the
/// demultiplexer for this port only; frames for closed ports are dropped.
pub const PORT_QUEUE: usize = 64;

pub struct PortEntry {
    pub in_tx: mpsc::Sender<Vec<u8>>,
    pub closed: Arc<AtomicBool>,
    pub device: Address,
}

#[derive(Default)]
pub struct Pool {
    ports: Mutex<HashMap<(u64, Vec<u8>), PortEntry>>,
}

impl Pool {
    pub fn new() -> Arc<Pool> {
        Arc::new(Pool::default())
    }

    pub fn insert(&self, client_id: u64, ref_id: Vec<u8>, entry: PortEntry) {
        let mut ports = self.ports.lock().expect("pool lock");
        if ports.insert((client_id, ref_id), entry).is_some() {
            warn!(client_id, "server reused a live port reference");
        }
    }

    /// Remove and mark closed; idempotent. Dropping the entry closes the
    /// inbound queue, which reads as EOF on the local side.
    pub fn remove(&self, client_id: u64, ref_id: &[u8]) -> Option<PortEntry> {
        let entry = self
            .ports
            .lock()
            .expect("pool lock")
            .remove(&(client_id, ref_id.to_vec()));
        if let Some(entry) = &entry {
            entry.closed.store(true, Ordering::Relaxed);
        }
        entry
    }

    /// Inbound sender for a live port.
    pub fn sender(&self, client_id: u64, ref_id: &[u8]) -> Option<mpsc::Sender<Vec<u8>>> {
        self.ports
            .lock()
            .expect("pool lock")
            .get(&(client_id, ref_id.to_vec()))
            .map(|entry| entry.in_tx.clone())
    }

    pub fn contains(&self, client_id: u64, ref_id: &[u8]) -> bool {
        self.ports
            .lock()
            .expect("pool lock")
            .contains_key(&(client_id, ref_id.to_vec()))
    }

    /// Close every port of one client in a single sweep.
    pub fn close_ports(&self, client_id: u64) -> usize {
        let mut ports = self.ports.lock().expect("pool lock");
        let refs: Vec<_> = ports
            .keys()
            .filter(|(cid, _)| *cid == client_id)
            .cloned()
            .collect();
        for key in &refs {
            if let Some(entry) = ports.remove(key) {
                entry.closed.store(true, Ordering::Relaxed);
            }
        }
        if !refs.is_empty() {
            debug!(client_id, count = refs.len(), "closed client ports");
        }
        refs.len()
    }

    pub fn len(&self) -> usize {
        self.ports.lock().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
