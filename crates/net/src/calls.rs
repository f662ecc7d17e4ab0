//! In-flight call bookkeeping for one RPC client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::debug;

use diode_core::bert::Term;

use crate::edge::Response;
use crate::error::{Error, Result};

pub const CALL_QUEUE_SIZE: usize = 1024;

static GLOBAL_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide monotonic request id, seeded from 1.
pub fn next_request_id() -> u64 {
    GLOBAL_REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// One submitted request. `reply` is the waiter's one-shot slot; `port`
/// names the ConnectedPort whose send side an error response must close.
pub struct Call {
    pub id: u64,
    pub method: &'static str,
    pub data: Vec<u8>,
    pub reply: Option<oneshot::Sender<Result<Response>>>,
    pub port: Option<Vec<u8>>,
    pub parse: fn(&'static str, &[Term]) -> Result<Response>,
}

impl Call {
    /// Calls without a waiter and without an owning port are write-only;
    /// nothing routes back to them.
    pub fn expects_response(&self) -> bool {
        self.reply.is_some() || self.port.is_some()
    }
}

#[derive(Default)]
pub struct CallManager {
    inflight: HashMap<u64, Call>,
}

/// What `deliver` did with a response, so the actor can react to port
/// errors without the manager knowing about the pool.
pub enum Delivery {
    Done,
    /// An error response owned by a port: close that port's send side.
    PortError(Vec<u8>),
    /// No matching call; dropped with a debug log.
    Unknown,
}

impl CallManager {
    /// Track a call; a full queue hands the call back so the caller can
    /// fail its waiter with `BackpressureFull`.
    pub fn insert(&mut self, call: Call) -> std::result::Result<(), Call> {
        if self.inflight.len() >= CALL_QUEUE_SIZE {
            return Err(call);
        }
        self.inflight.insert(call.id, call);
        Ok(())
    }

    /// Pull a tracked call back out (write failures).
    pub fn take(&mut self, id: u64) -> Option<Call> {
        self.inflight.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Idempotent removal; dropping the call closes its reply slot.
    pub fn remove(&mut self, id: u64) {
        self.inflight.remove(&id);
    }

    /// Route a correlated response payload to its waiter.
    pub fn deliver(&mut self, id: u64, payload: &[Term]) -> Delivery {
        let Some(call) = self.inflight.remove(&id) else {
            debug!(id, "response for unknown or removed call, dropped");
            return Delivery::Unknown;
        };
        let result = (call.parse)(call.method, payload);
        if let Some(reply) = call.reply {
            // a cancelled waiter dropped its receiver; that is fine
            let _ = reply.send(result);
        }
        Delivery::Done
    }

    /// Route an error response.
    pub fn deliver_error(&mut self, id: u64, method: &str, message: &str) -> Delivery {
        let Some(call) = self.inflight.remove(&id) else {
            debug!(id, method, "error for unknown or removed call, dropped");
            return Delivery::Unknown;
        };
        let err = Error::rpc(method, message);
        if let Some(reply) = call.reply {
            let _ = reply.send(Err(err));
            Delivery::Done
        } else if let Some(port) = call.port {
            Delivery::PortError(port)
        } else {
            Delivery::Done
        }
    }

    /// Fail every waiter with `Cancelled(host)`; used on close and on
    /// transport loss.
    pub fn cancel_all(&mut self, host: &str) {
        for (_, call) in self.inflight.drain() {
            if let Some(reply) = call.reply {
                let _ = reply.send(Err(Error::Cancelled(host.to_string())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge;

    fn dummy_call(id: u64, reply: Option<oneshot::Sender<Result<Response>>>) -> Call {
        Call {
            id,
            method: "ping",
            data: Vec::new(),
            reply,
            port: None,
            parse: edge::parse_response,
        }
    }

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[test]
    fn insert_fails_when_full() {
        let mut cm = CallManager::default();
        for i in 0..CALL_QUEUE_SIZE as u64 {
            assert!(cm.insert(dummy_call(i + 1, None)).is_ok());
        }
        let rejected = cm.insert(dummy_call(9999, None)).unwrap_err();
        assert_eq!(rejected.id, 9999);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut cm = CallManager::default();
        cm.insert(dummy_call(7, None)).unwrap();
        cm.remove(7);
        cm.remove(7);
        assert!(cm.is_empty());
    }

    #[test]
    fn unknown_response_is_dropped() {
        let mut cm = CallManager::default();
        assert!(matches!(cm.deliver(99, &[]), Delivery::Unknown));
    }

    #[tokio::test]
    async fn cancel_all_signals_waiters() {
        let mut cm = CallManager::default();
        let (tx, rx) = oneshot::channel();
        cm.insert(dummy_call(1, Some(tx))).unwrap();
        cm.cancel_all("edge.example:41046");
        match rx.await.unwrap() {
            Err(Error::Cancelled(host)) => assert_eq!(host, "edge.example:41046"),
            other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
        }
    }
}
