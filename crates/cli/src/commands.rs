//! Command implementations on top of the client stack.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use k256::ecdsa::SigningKey;
use tokio::net::TcpListener;
use tracing::{error, info};

use diode_core::crypto::{signing_key_address, signing_key_from_bytes};
use diode_core::util::Address;
use diode_net::client::Config;
use diode_net::pool::Pool;
use diode_net::{Protocol, ServerPool};
use diode_store::{ClientDb, StoreOptions};

use crate::Cli;

pub struct Setup {
    servers: Vec<String>,
    db: ClientDb,
    fleet: Option<Address>,
    genesis_number: u64,
    genesis_hash: [u8; 32],
    e2e: Protocol,
    key: SigningKey,
}

impl Setup {
    pub fn from_cli(cli: &Cli) -> Result<Setup> {
        let db = ClientDb::open(&cli.db_path, StoreOptions::default())?;
        let key = load_or_create_key(&db)?;
        let genesis_hash = match &cli.genesis_hash {
            Some(raw) => {
                let raw = raw.strip_prefix("0x").unwrap_or(raw);
                let bytes = hex::decode(raw).context("parse --genesis-hash")?;
                bytes
                    .try_into()
                    .map_err(|_| anyhow!("--genesis-hash must be 32 bytes"))?
            }
            None => [0u8; 32],
        };
        Ok(Setup {
            servers: cli.servers.clone(),
            db,
            fleet: cli.fleet,
            genesis_number: cli.genesis_number,
            genesis_hash,
            e2e: if cli.e2e { Protocol::Tls } else { Protocol::Raw },
            key,
        })
    }

    fn config_for(&self, host: &str, publish: &HashMap<u64, SocketAddr>) -> Config {
        let mut config = Config::new(host);
        if let Some(fleet) = self.fleet {
            config.fleet_addr = fleet;
        }
        config.genesis_number = self.genesis_number;
        config.genesis_hash = self.genesis_hash;
        config.publish = publish.clone();
        config
    }

    async fn server_pool(self, publish: HashMap<u64, SocketAddr>) -> Result<ServerPool> {
        info!(address = %signing_key_address(&self.key), "client identity");
        let configs = self
            .servers
            .iter()
            .map(|host| self.config_for(host, &publish))
            .collect();
        let pool = ServerPool::start(configs, self.key, self.db, Pool::new(), self.e2e)
            .await
            .context("no edge server available")?;
        Ok(pool)
    }
}

fn load_or_create_key(db: &ClientDb) -> Result<SigningKey> {
    if let Some(raw) = db.private_key()? {
        return signing_key_from_bytes(&raw).map_err(|e| anyhow!("stored key invalid: {}", e));
    }
    loop {
        let raw: [u8; 32] = rand::random();
        if let Ok(key) = signing_key_from_bytes(&raw) {
            db.set_private_key(raw)?;
            return Ok(key);
        }
    }
}

pub async fn time(setup: Setup) -> Result<()> {
    let pool = setup.server_pool(HashMap::new()).await?;
    let client = pool.best_client()?;
    let (number, hash) = client
        .last_valid()
        .await?
        .ok_or_else(|| anyhow!("no validated window"))?;
    println!("Block: {} 0x{}", number, hex::encode(hash));
    pool.close().await;
    Ok(())
}

pub async fn resolve(setup: Setup, name: &str) -> Result<()> {
    let pool = setup.server_pool(HashMap::new()).await?;
    let client = pool.best_client()?;
    let label = name.split('.').next().unwrap_or(name);

    let addresses = client.resolve_bns(label).await?;
    for addr in &addresses {
        println!("{}", addr);
    }
    match client.resolve_bns_owner(label).await {
        Ok(owner) => println!("owner: {}", owner),
        Err(err) => info!(%err, "no owner record"),
    }
    pool.close().await;
    Ok(())
}

pub async fn forward(setup: Setup, local_port: u16, remote: &str) -> Result<()> {
    let pool = Arc::new(setup.server_pool(HashMap::new()).await?);
    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .with_context(|| format!("bind local port {}", local_port))?;
    info!(local_port, remote, "forwarding");

    loop {
        let (mut tcp, peer) = listener.accept().await?;
        let pool = pool.clone();
        let remote = remote.to_string();
        tokio::spawn(async move {
            match pool.dial("tcp", &remote).await {
                Ok(mut conn) => {
                    if let Err(err) = tokio::io::copy_bidirectional(&mut tcp, &mut conn).await {
                        info!(%peer, %err, "forward connection ended");
                    }
                }
                Err(err) => error!(%peer, %err, "dial failed"),
            }
        });
    }
}

pub async fn publish(setup: Setup, ports: &[String]) -> Result<()> {
    let mut publish = HashMap::new();
    for mapping in ports {
        let (device_port, local) = mapping
            .split_once('=')
            .ok_or_else(|| anyhow!("expected <device_port>=<local_addr>, got {}", mapping))?;
        let device_port: u64 = device_port
            .parse()
            .with_context(|| format!("bad device port in {}", mapping))?;
        let local: SocketAddr = local
            .parse()
            .with_context(|| format!("bad local address in {}", mapping))?;
        publish.insert(device_port, local);
    }
    if publish.is_empty() {
        bail!("nothing to publish");
    }

    let pool = setup.server_pool(publish).await?;
    info!("published ports are live; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    pool.close().await;
    Ok(())
}
