//! In-process edge server speaking the framed term protocol over TLS,
//! plus a signed test chain. Shared by the client integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use diode_core::bert::{self, Term};
use diode_core::blockquick::BlockHeader;
use diode_core::crypto::{sign_digest, signing_key_from_bytes};
use diode_net::channel::{insecure_server_config, read_frame_from, write_frame_to};
use diode_net::edge::header_to_term;
use k256::ecdsa::SigningKey;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "diode_net=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn client_key() -> SigningKey {
    let mut raw = [77u8; 32];
    raw[0] = 1;
    signing_key_from_bytes(&raw).unwrap()
}

pub struct TestChain {
    pub headers: Vec<BlockHeader>,
}

impl TestChain {
    /// Consecutive headers 1..=len signed by one miner.
    pub fn generate(len: usize) -> TestChain {
        let mut key_raw = [13u8; 32];
        key_raw[0] = 1;
        let key = signing_key_from_bytes(&key_raw).unwrap();
        let mut headers = Vec::with_capacity(len);
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
            headers.push(header);
        }
        TestChain { headers }
    }

    pub fn header(&self, number: u64) -> Option<&BlockHeader> {
        if number == 0 {
            return None;
        }
        self.headers.get(number as usize - 1)
    }

    pub fn peak(&self) -> u64 {
        self.headers.len() as u64
    }
}

/// Encoded reply frames the handler hands back per request.
pub fn response_frame(id: u64, mut payload: Vec<Term>) -> Vec<u8> {
    let mut items = vec![Term::Int(id), Term::atom("response")];
    items.append(&mut payload);
    bert::encode(&Term::Tuple(items)).unwrap()
}

pub fn error_frame(id: u64, method: &str, message: &[u8]) -> Vec<u8> {
    bert::encode(&Term::Tuple(vec![
        Term::Int(id),
        Term::atom("error"),
        Term::atom(method),
        Term::bytes(message.to_vec()),
    ]))
    .unwrap()
}

/// Server-initiated request frame (inbound portopen/portsend/...).
pub fn push_frame(id: u64, method: &str, mut args: Vec<Term>) -> Vec<u8> {
    let mut items = vec![Term::Int(id), Term::atom(method)];
    items.append(&mut args);
    bert::encode(&Term::Tuple(items)).unwrap()
}

pub type Handler = dyn Fn(u64, &str, &[Term]) -> Vec<Vec<u8>> + Send + Sync;

/// One-connection edge server; each request frame is mapped to zero or
/// more reply frames by the handler.
pub struct EdgeServer {
    pub addr: SocketAddr,
}

impl EdgeServer {
    pub async fn spawn(handler: Arc<Handler>) -> EdgeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(insecure_server_config().unwrap()));
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(tcp).await else {
                        return;
                    };
                    serve_connection(stream, handler).await;
                });
            }
        });
        EdgeServer { addr }
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }
}

async fn serve_connection(mut stream: tokio_rustls::server::TlsStream<TcpStream>, handler: Arc<Handler>) {
    loop {
        let Ok(payload) = read_frame_from(&mut stream).await else {
            return;
        };
        let Ok(term) = bert::decode(&payload) else {
            continue;
        };
        let Some(items) = term.as_tuple() else {
            continue;
        };
        if items.len() < 2 {
            continue;
        }
        let (Some(id), Some(method)) = (items[0].as_u64(), items[1].as_atom()) else {
            continue;
        };
        for frame in handler(id, method, &items[2..]) {
            if write_frame_to(&mut stream, &frame).await.is_err() {
                return;
            }
        }
    }
}

/// A handler covering the full client bootstrap against `chain`, with a
/// ticket log and echoing port semantics:
/// - `portopen` grants ref `"r1"`,
/// - `portsend` is acked and echoed back as inbound traffic,
/// - `ticket` replies `thanks` and records the submitted values.
pub struct ChainBehavior {
    pub chain: Arc<TestChain>,
    pub tickets: Arc<Mutex<Vec<Vec<Term>>>>,
    pub portsends: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ChainBehavior {
    pub fn new(chain: Arc<TestChain>) -> ChainBehavior {
        ChainBehavior {
            chain,
            tickets: Arc::new(Mutex::new(Vec::new())),
            portsends: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn into_handler(self) -> Arc<Handler> {
        let ChainBehavior {
            chain,
            tickets,
            portsends,
        } = self;
        Arc::new(move |id, method, args| match method {
            "hello" | "ping" | "portclose" => vec![response_frame(id, vec![Term::atom("ok")])],
            "getblockpeak" => vec![response_frame(id, vec![Term::Int(chain.peak())])],
            "getblockheader2" => {
                let number = args[0].as_u64().unwrap_or(0);
                match chain.header(number) {
                    Some(header) => vec![response_frame(id, vec![header_to_term(header)])],
                    None => vec![error_frame(id, "getblockheader2", b"not found")],
                }
            }
            "getblockquick2" => {
                let last_valid = args[0].as_u64().unwrap_or(0);
                let count = args[1].as_u64().unwrap_or(0);
                let top = (last_valid + count).min(chain.peak());
                let numbers: Vec<Term> =
                    (last_valid + 1..=top).map(Term::Int).collect();
                vec![response_frame(id, vec![Term::List(numbers)])]
            }
            "ticket" => {
                tickets.lock().unwrap().push(args.to_vec());
                vec![response_frame(id, vec![Term::atom("thanks")])]
            }
            "portopen" => vec![response_frame(
                id,
                vec![Term::bytes(b"r1".to_vec()), Term::atom("ok")],
            )],
            "portsend" => {
                let ref_id = args[0].as_bytes().unwrap_or_default().to_vec();
                let data = args[1].as_bytes().unwrap_or_default().to_vec();
                portsends.lock().unwrap().push(data.clone());
                vec![
                    response_frame(id, vec![Term::atom("ok")]),
                    // echo the bytes back through the tunnel
                    push_frame(
                        id + 100_000,
                        "portsend",
                        vec![Term::Bytes(ref_id), Term::Bytes(data)],
                    ),
                ]
            }
            _ => vec![error_frame(id, "unknown", b"unsupported")],
        })
    }
}
