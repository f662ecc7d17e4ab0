//! Typed layer over the wire terms: request builders, response parsers
//! and classification of server-initiated messages.

use diode_core::bert::{self, Term};
use diode_core::blockquick::{BlockHeader, Hash};
use diode_core::crypto::{self, Signature65};
use diode_core::merkle::MerkleTree;
use diode_core::ticket::DeviceTicket;
use diode_core::util::Address;

use crate::error::{Error, Result};

/// Decoded response payload, shaped per method.
#[derive(Debug)]
pub enum Response {
    /// Plain acknowledgement (`ping`, `portsend`, `portclose`, `hello`).
    Ok,
    BlockPeak(u64),
    BlockHeader(BlockHeader),
    BlockSequence(Vec<u64>),
    Block(Vec<Term>),
    Ticket(TicketReply),
    PortOpen { ref_id: Vec<u8> },
    Account(Account),
    AccountRoots(Vec<Hash>),
    AccountValue(MerkleTree),
    StateRoots(Vec<Hash>),
    Object(DeviceTicket),
    Node(ServerObj),
    TransactionOk(bool),
    Raw(Vec<Term>),
}

/// Server verdict on a submitted ticket.
#[derive(Debug)]
pub enum TicketReply {
    Thanks,
    TooOld,
    /// The server claims a newer ticket exists; carries its view.
    TooLow {
        block_hash: Hash,
        total_connections: u64,
        total_bytes: u64,
        local_addr: Vec<u8>,
        device_sig: Vec<u8>,
    },
}

/// Account summary plus the state proof it came with.
#[derive(Debug)]
pub struct Account {
    pub nonce: u64,
    pub balance: u64,
    pub storage_root: Hash,
    pub code_hash: Vec<u8>,
    pub state_tree: MerkleTree,
}

impl Account {
    pub fn state_root(&self) -> Hash {
        self.state_tree.root_hash
    }
}

/// A signed node record from `getnode`.
#[derive(Debug, Clone)]
pub struct ServerObj {
    pub host: Vec<u8>,
    pub edge_port: u64,
    pub server_port: u64,
    pub sig: Signature65,
}

impl ServerObj {
    fn signing_digest(&self) -> Hash {
        let term = Term::Tuple(vec![
            Term::bytes(self.host.clone()),
            Term::Int(self.edge_port),
            Term::Int(self.server_port),
        ]);
        crypto::sha256(&bert::encode(&term).unwrap_or_default())
    }

    /// Recover the signer and compare against the queried node id.
    pub fn validate_sig(&self, node_id: Address) -> bool {
        crypto::verify_recoverable(&self.signing_digest(), &self.sig, node_id)
    }
}

/// Server-initiated traffic and correlation frames.
#[derive(Debug)]
pub enum Inbound {
    Response {
        id: u64,
        payload: Vec<Term>,
    },
    Error {
        id: u64,
        method: String,
        message: String,
    },
    PortOpen {
        id: u64,
        port: u64,
        ref_id: Vec<u8>,
        device: Address,
    },
    PortSend {
        ref_id: Vec<u8>,
        data: Vec<u8>,
    },
    PortClose {
        ref_id: Vec<u8>,
    },
    Goodbye {
        reason: Vec<String>,
    },
}

/// Encode a request frame: `(request_id, method, arg...)`.
pub fn request(id: u64, method: &str, args: Vec<Term>) -> Result<Vec<u8>> {
    let mut items = Vec::with_capacity(2 + args.len());
    items.push(Term::Int(id));
    items.push(Term::atom(method));
    items.extend(args);
    Ok(bert::encode(&Term::Tuple(items))?)
}

/// Encode an out-of-correlation reply to a server-initiated request:
/// `(request_id, kind, method, arg...)`.
pub fn response_message(id: u64, kind: &str, method: &str, args: Vec<Term>) -> Result<Vec<u8>> {
    let mut items = Vec::with_capacity(3 + args.len());
    items.push(Term::Int(id));
    items.push(Term::atom(kind));
    items.push(Term::atom(method));
    items.extend(args);
    Ok(bert::encode(&Term::Tuple(items))?)
}

/// Split a decoded frame into its inbound shape.
pub fn classify(term: &Term) -> Result<Inbound> {
    let items = term.as_tuple().ok_or(Error::MalformedFrame)?;
    if items.len() < 2 {
        return Err(Error::MalformedFrame);
    }
    let id = items[0].as_u64().ok_or(Error::MalformedFrame)?;
    let kind = items[1].as_atom().ok_or(Error::MalformedFrame)?;
    match kind {
        "response" => Ok(Inbound::Response {
            id,
            payload: items[2..].to_vec(),
        }),
        "error" => {
            // (id, "error", method, message) or (id, "error", message)
            let (method, message) = match items.len() {
                0..=2 => return Err(Error::MalformedFrame),
                3 => (String::new(), text_of(&items[2])),
                _ => (text_of(&items[2]), text_of(&items[3])),
            };
            Ok(Inbound::Error { id, method, message })
        }
        "portopen" => {
            if items.len() < 5 {
                return Err(Error::MalformedFrame);
            }
            let port = items[2].as_u64().ok_or(Error::MalformedFrame)?;
            let ref_id = items[3].as_bytes().ok_or(Error::MalformedFrame)?.to_vec();
            let device = items[4].as_address().ok_or(Error::MalformedFrame)?;
            Ok(Inbound::PortOpen {
                id,
                port,
                ref_id,
                device,
            })
        }
        "portsend" => {
            if items.len() < 4 {
                return Err(Error::MalformedFrame);
            }
            let ref_id = items[2].as_bytes().ok_or(Error::MalformedFrame)?.to_vec();
            let data = items[3].as_bytes().ok_or(Error::MalformedFrame)?.to_vec();
            Ok(Inbound::PortSend { ref_id, data })
        }
        "portclose" => {
            if items.len() < 3 {
                return Err(Error::MalformedFrame);
            }
            let ref_id = items[2].as_bytes().ok_or(Error::MalformedFrame)?.to_vec();
            Ok(Inbound::PortClose { ref_id })
        }
        "goodbye" => Ok(Inbound::Goodbye {
            reason: items[2..].iter().map(text_of).collect(),
        }),
        _ => Err(Error::MalformedFrame),
    }
}

fn text_of(term: &Term) -> String {
    match term {
        Term::Atom(a) => a.clone(),
        Term::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        other => format!("{:?}", other),
    }
}

/// Parse a correlated response payload into the method's typed shape.
pub fn parse_response(method: &'static str, payload: &[Term]) -> Result<Response> {
    match method {
        "getblockpeak" => {
            let peak = first(payload)?.as_u64().ok_or(Error::MalformedFrame)?;
            Ok(Response::BlockPeak(peak))
        }
        "getblockheader2" => Ok(Response::BlockHeader(term_to_header(first(payload)?)?)),
        "getblockquick2" => {
            let items = first(payload)?.as_list().ok_or(Error::MalformedFrame)?;
            let mut numbers = Vec::with_capacity(items.len());
            for item in items {
                numbers.push(item.as_u64().ok_or(Error::MalformedFrame)?);
            }
            Ok(Response::BlockSequence(numbers))
        }
        "getblock" => Ok(Response::Block(payload.to_vec())),
        "ticket" => parse_ticket_reply(payload),
        "portopen" => {
            let ref_id = first(payload)?.as_bytes().ok_or(Error::MalformedFrame)?;
            Ok(Response::PortOpen {
                ref_id: ref_id.to_vec(),
            })
        }
        "getaccount" => parse_account(payload),
        "getaccountroots" => Ok(Response::AccountRoots(parse_roots(payload)?)),
        "getstateroots" => Ok(Response::StateRoots(parse_roots(payload)?)),
        "getaccountvalue" => {
            let tree = MerkleTree::parse(first(payload)?).map_err(|_| Error::MalformedFrame)?;
            Ok(Response::AccountValue(tree))
        }
        "getobject" => Ok(Response::Object(parse_object(first(payload)?)?)),
        "getnode" => Ok(Response::Node(parse_node(first(payload)?)?)),
        "sendtransaction" => {
            let ok = matches!(first(payload)?.as_atom(), Some("ok"));
            Ok(Response::TransactionOk(ok))
        }
        "ping" | "portsend" | "portclose" | "hello" => Ok(Response::Ok),
        _ => Ok(Response::Raw(payload.to_vec())),
    }
}

fn first(payload: &[Term]) -> Result<&Term> {
    payload.first().ok_or(Error::MalformedFrame)
}

fn parse_ticket_reply(payload: &[Term]) -> Result<Response> {
    match first(payload)?.as_atom() {
        Some("thanks") => Ok(Response::Ticket(TicketReply::Thanks)),
        Some("too_old") => Ok(Response::Ticket(TicketReply::TooOld)),
        Some("too_low") => {
            if payload.len() < 6 {
                return Err(Error::MalformedFrame);
            }
            Ok(Response::Ticket(TicketReply::TooLow {
                block_hash: payload[1].as_hash().ok_or(Error::MalformedFrame)?,
                total_connections: payload[2].as_u64().ok_or(Error::MalformedFrame)?,
                total_bytes: payload[3].as_u64().ok_or(Error::MalformedFrame)?,
                local_addr: payload[4].as_bytes().ok_or(Error::MalformedFrame)?.to_vec(),
                device_sig: payload[5].as_bytes().ok_or(Error::MalformedFrame)?.to_vec(),
            }))
        }
        _ => Err(Error::MalformedFrame),
    }
}

fn parse_roots(payload: &[Term]) -> Result<Vec<Hash>> {
    let items = first(payload)?.as_list().ok_or(Error::MalformedFrame)?;
    let mut roots = Vec::with_capacity(items.len());
    for item in items {
        roots.push(item.as_hash().ok_or(Error::MalformedFrame)?);
    }
    Ok(roots)
}

fn parse_account(payload: &[Term]) -> Result<Response> {
    if payload.len() < 2 {
        return Err(Error::MalformedFrame);
    }
    let fields = payload[0].as_tuple().ok_or(Error::MalformedFrame)?;
    if fields.len() < 4 {
        return Err(Error::MalformedFrame);
    }
    let state_tree = MerkleTree::parse(&payload[1]).map_err(|_| Error::MalformedFrame)?;
    Ok(Response::Account(Account {
        nonce: fields[0].as_u64().ok_or(Error::MalformedFrame)?,
        balance: fields[1].as_u64().ok_or(Error::MalformedFrame)?,
        storage_root: fields[2].as_hash().ok_or(Error::MalformedFrame)?,
        code_hash: fields[3].as_bytes().ok_or(Error::MalformedFrame)?.to_vec(),
        state_tree,
    }))
}

fn parse_object(term: &Term) -> Result<DeviceTicket> {
    let fields = term.as_tuple().ok_or(Error::MalformedFrame)?;
    if fields.len() < 7 {
        return Err(Error::MalformedFrame);
    }
    Ok(DeviceTicket {
        server_id: fields[0].as_address().ok_or(Error::MalformedFrame)?,
        block_number: fields[1].as_u64().ok_or(Error::MalformedFrame)?,
        // resolved by the caller from the validated window
        block_hash: [0u8; 32],
        fleet_addr: fields[2].as_address().ok_or(Error::MalformedFrame)?,
        total_connections: fields[3].as_u64().ok_or(Error::MalformedFrame)?,
        total_bytes: fields[4].as_u64().ok_or(Error::MalformedFrame)?,
        local_addr: fields[5].as_bytes().ok_or(Error::MalformedFrame)?.to_vec(),
        device_sig: sig_from(fields[6].as_bytes().ok_or(Error::MalformedFrame)?)?,
    })
}

fn parse_node(term: &Term) -> Result<ServerObj> {
    let fields = term.as_tuple().ok_or(Error::MalformedFrame)?;
    if fields.len() < 4 {
        return Err(Error::MalformedFrame);
    }
    Ok(ServerObj {
        host: fields[0].as_bytes().ok_or(Error::MalformedFrame)?.to_vec(),
        edge_port: fields[1].as_u64().ok_or(Error::MalformedFrame)?,
        server_port: fields[2].as_u64().ok_or(Error::MalformedFrame)?,
        sig: sig_from(fields[3].as_bytes().ok_or(Error::MalformedFrame)?)?,
    })
}

pub fn sig_from(raw: &[u8]) -> Result<Signature65> {
    if raw.len() != 65 {
        return Err(Error::MalformedFrame);
    }
    let mut out = [0u8; 65];
    out.copy_from_slice(raw);
    Ok(out)
}

/// Header term shape: an 8-tuple in field order, hashes as 32-byte
/// binaries and the miner signature as a 65-byte binary.
pub fn term_to_header(term: &Term) -> Result<BlockHeader> {
    let fields = term.as_tuple().ok_or(Error::MalformedFrame)?;
    if fields.len() != 8 {
        return Err(Error::MalformedFrame);
    }
    Ok(BlockHeader {
        parent_hash: fields[0].as_hash().ok_or(Error::MalformedFrame)?,
        state_root: fields[1].as_hash().ok_or(Error::MalformedFrame)?,
        transaction_root: fields[2].as_hash().ok_or(Error::MalformedFrame)?,
        receipt_root: fields[3].as_hash().ok_or(Error::MalformedFrame)?,
        number: fields[4].as_u64().ok_or(Error::MalformedFrame)?,
        timestamp: fields[5].as_u64().ok_or(Error::MalformedFrame)?,
        nonce: fields[6].as_u64().ok_or(Error::MalformedFrame)?,
        miner_sig: sig_from(fields[7].as_bytes().ok_or(Error::MalformedFrame)?)?,
    })
}

pub fn header_to_term(header: &BlockHeader) -> Term {
    Term::Tuple(vec![
        Term::bytes(header.parent_hash.to_vec()),
        Term::bytes(header.state_root.to_vec()),
        Term::bytes(header.transaction_root.to_vec()),
        Term::bytes(header.receipt_root.to_vec()),
        Term::Int(header.number),
        Term::Int(header.timestamp),
        Term::Int(header.nonce),
        Term::bytes(header.miner_sig.to_vec()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_shape() {
        let raw = request(7, "portopen", vec![Term::bytes(vec![1; 20]), Term::Int(80)]).unwrap();
        let term = bert::decode(&raw).unwrap();
        let items = term.as_tuple().unwrap();
        assert_eq!(items[0], Term::Int(7));
        assert_eq!(items[1], Term::atom("portopen"));
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn classify_response_and_error() {
        let term = Term::Tuple(vec![
            Term::Int(3),
            Term::atom("response"),
            Term::atom("ok"),
        ]);
        match classify(&term).unwrap() {
            Inbound::Response { id, payload } => {
                assert_eq!(id, 3);
                assert_eq!(payload.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let term = Term::Tuple(vec![
            Term::Int(4),
            Term::atom("error"),
            Term::atom("portopen"),
            Term::bytes(b"time".to_vec()),
        ]);
        match classify(&term).unwrap() {
            Inbound::Error { id, method, message } => {
                assert_eq!(id, 4);
                assert_eq!(method, "portopen");
                assert_eq!(message, "time");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn classify_rejects_garbage() {
        assert!(classify(&Term::Int(1)).is_err());
        let term = Term::Tuple(vec![Term::Int(1), Term::atom("nonsense")]);
        assert!(classify(&term).is_err());
    }

    #[test]
    fn header_term_roundtrip() {
        let header = BlockHeader {
            parent_hash: [1; 32],
            state_root: [2; 32],
            transaction_root: [3; 32],
            receipt_root: [4; 32],
            number: 42,
            timestamp: 1_700_000_000,
            nonce: 9,
            miner_sig: [5; 65],
        };
        let back = term_to_header(&header_to_term(&header)).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn ticket_too_low_parses() {
        let payload = vec![
            Term::atom("too_low"),
            Term::bytes(vec![7; 32]),
            Term::Int(3),
            Term::Int(9_000_000),
            Term::bytes(b"1.2.3.4:5".to_vec()),
            Term::bytes(vec![0; 65]),
        ];
        match parse_response("ticket", &payload).unwrap() {
            Response::Ticket(TicketReply::TooLow {
                total_bytes,
                total_connections,
                ..
            }) => {
                assert_eq!(total_bytes, 9_000_000);
                assert_eq!(total_connections, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
