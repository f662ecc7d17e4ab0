//! Server pool: a set of connected edge clients, name-based dialing and
//! selection by handshake latency.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use k256::ecdsa::SigningKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use diode_core::util::Address;
use diode_store::ClientDb;

use crate::client::{Client, Config};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::port::{e2e_connect, ConnectedPort};

/// Tunnel payload treatment: raw bytes, or a nested TLS handshake that
/// hides the traffic from the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Raw,
    Tls,
}

/// What the caller may read from and write to; `dial` returns one.
pub trait DiodeStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DiodeStream for T {}

pub type DiodeConn = Box<dyn DiodeStream>;

/// Parsed dial target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Address(Address),
    Name(String),
}

const DEFAULT_PORT: u64 = 80;
const DEFAULT_MODE: &str = "rw";

/// Parse `<name>.<tld>[:port]` or `<hexaddr>[:port]`.
pub fn parse_host(addr: &str) -> Result<(Target, u64)> {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u64>()
                .map_err(|_| Error::rpc("dial", format!("bad port in {}", addr)))?;
            (host, port)
        }
        None => (addr, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(Error::rpc("dial", "empty host"));
    }
    if let Ok(address) = host.parse::<Address>() {
        return Ok((Target::Address(address), port));
    }
    // strip the name-service TLD; a bare label is looked up as-is
    let name = host.split('.').next().unwrap_or(host);
    Ok((Target::Name(name.to_string()), port))
}

pub struct ServerPool {
    clients: Vec<Client>,
    e2e: Protocol,
}

impl ServerPool {
    /// Connect to every configured edge server concurrently; servers
    /// that fail to bootstrap are skipped. Fails when none survive.
    pub async fn start(
        configs: Vec<Config>,
        key: SigningKey,
        db: ClientDb,
        pool: Arc<Pool>,
        e2e: Protocol,
    ) -> Result<ServerPool> {
        let attempts = join_all(configs.into_iter().map(|config| {
            let key = key.clone();
            let db = db.clone();
            let pool = pool.clone();
            async move {
                let host = config.host.clone();
                match Client::connect(config, key, db, pool).await {
                    Ok(client) => {
                        info!(host, latency_ms = client.latency_ms(), "edge server ready");
                        Some(client)
                    }
                    Err(err) => {
                        warn!(host, %err, "edge server unavailable");
                        None
                    }
                }
            }
        }))
        .await;

        let clients: Vec<Client> = attempts.into_iter().flatten().collect();
        if clients.is_empty() {
            return Err(Error::ClientClosed);
        }
        Ok(ServerPool { clients, e2e })
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    /// The healthy client with the lowest handshake latency.
    pub fn best_client(&self) -> Result<Client> {
        self.clients
            .iter()
            .filter(|c| !c.is_closed())
            .min_by_key(|c| c.latency_ms())
            .cloned()
            .ok_or(Error::ClientClosed)
    }

    /// Resolve `addr` and open a tunnel on the best client. Multiple
    /// name destinations are tried in order; connect failures fall
    /// through to the next candidate.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<DiodeConn> {
        if !network.starts_with("tcp") {
            return Err(Error::rpc("dial", format!("unsupported network {}", network)));
        }
        let (target, port) = parse_host(addr)?;
        let client = self.best_client()?;
        let candidates = match target {
            Target::Address(address) => vec![address],
            Target::Name(name) => client.resolve_bns(&name).await?,
        };

        let mut last_err = Error::EmptyBnsResult;
        for device in candidates {
            match client.port_open(device, port, DEFAULT_MODE).await {
                Ok(open) => return self.wrap(open).await,
                Err(err) => {
                    warn!(%device, %err, "port open failed, trying next candidate");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// `dial` bounded by a deadline, the context-carrying variant.
    pub async fn dial_with_timeout(
        &self,
        deadline: Duration,
        network: &str,
        addr: &str,
    ) -> Result<DiodeConn> {
        tokio::time::timeout(deadline, self.dial(network, addr))
            .await
            .map_err(|_| Error::PortOpenTimeout)?
    }

    async fn wrap(&self, port: ConnectedPort) -> Result<DiodeConn> {
        let stream = port.into_stream();
        match self.e2e {
            Protocol::Raw => Ok(Box::new(stream)),
            Protocol::Tls => Ok(Box::new(e2e_connect(stream).await?)),
        }
    }

    /// Close every client (and with them, every port).
    pub async fn close(&self) {
        for client in &self.clients {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_addresses() {
        let (target, port) =
            parse_host("0xaf60faa5cd840b724742f1af116168276112d6a6:8080").unwrap();
        assert!(matches!(target, Target::Address(_)));
        assert_eq!(port, 8080);

        let (target, port) = parse_host("af60faa5cd840b724742f1af116168276112d6a6").unwrap();
        assert!(matches!(target, Target::Address(_)));
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn parse_names_strips_tld() {
        let (target, port) = parse_host("mydevice.diode:3000").unwrap();
        assert_eq!(target, Target::Name("mydevice".to_string()));
        assert_eq!(port, 3000);

        let (target, _) = parse_host("plainname").unwrap();
        assert_eq!(target, Target::Name("plainname".to_string()));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_host("").is_err());
        assert!(parse_host("host:notaport").is_err());
    }
}
