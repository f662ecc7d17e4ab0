//! Tagged binary term codec for the edge protocol.
//!
//! The wire format is the Erlang external-term-format subset the edge
//! servers speak: small integers, 32-bit big-endian integers, small bigs,
//! atoms, binaries, proper lists and tuples, all behind the version byte
//! 131. Frames carry a 16-bit big-endian length prefix, so an encoded
//! message may never exceed 65535 bytes.

use std::fmt;

pub const VERSION: u8 = 131;

/// Hard cap for one framed message (16-bit length prefix).
pub const FRAME_LIMIT: usize = u16::MAX as usize;

const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const SMALL_ATOM_UTF8_EXT: u8 = 119;
const ATOM_UTF8_EXT: u8 = 118;

#[derive(Clone, PartialEq, Eq)]
pub enum Term {
    /// Non-negative integer. Values above 2^31-1 travel as small bigs.
    Int(u64),
    Bytes(Vec<u8>),
    Atom(String),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed term: {0}")]
    Malformed(&'static str),
    #[error("term exceeds frame limit")]
    Oversize,
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(v) => write!(f, "{}", v),
            Term::Bytes(b) => write!(f, "<<{}>>", hex::encode(b)),
            Term::Atom(a) => write!(f, ":{}", a),
            Term::List(items) => f.debug_list().entries(items).finish(),
            Term::Tuple(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Term {
    pub fn atom(name: &str) -> Term {
        Term::Atom(name.to_string())
    }

    pub fn bytes(raw: impl Into<Vec<u8>>) -> Term {
        Term::Bytes(raw.into())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Term::Int(v) => Some(*v),
            // numeric fields sometimes arrive as big-endian binaries
            Term::Bytes(b) if b.len() <= 8 => Some(crate::util::slot_to_u64(b)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Term::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// 32-byte hash field.
    pub fn as_hash(&self) -> Option<[u8; 32]> {
        let raw = self.as_bytes()?;
        if raw.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(raw);
        Some(out)
    }

    pub fn as_address(&self) -> Option<crate::util::Address> {
        crate::util::Address::from_slice(self.as_bytes()?)
    }
}

/// Encode one term, version byte included. Fails with `Oversize` when the
/// result would not fit in a 16-bit framed message.
pub fn encode(term: &Term) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(64);
    out.push(VERSION);
    encode_into(term, &mut out)?;
    if out.len() > FRAME_LIMIT {
        return Err(CodecError::Oversize);
    }
    Ok(out)
}

fn encode_into(term: &Term, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match term {
        Term::Int(v) => match *v {
            v if v < 256 => {
                out.push(SMALL_INTEGER_EXT);
                out.push(v as u8);
            }
            v if v <= i32::MAX as u64 => {
                out.push(INTEGER_EXT);
                out.extend_from_slice(&(v as u32).to_be_bytes());
            }
            v => {
                // unsigned small big, little-endian digits
                let digits = v.to_le_bytes();
                let len = digits.iter().rposition(|&d| d != 0).map_or(1, |p| p + 1);
                out.push(SMALL_BIG_EXT);
                out.push(len as u8);
                out.push(0); // sign: positive
                out.extend_from_slice(&digits[..len]);
            }
        },
        Term::Bytes(b) => {
            out.push(BINARY_EXT);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Term::Atom(a) => {
            if a.len() > u16::MAX as usize || !a.is_ascii() {
                return Err(CodecError::Malformed("atom must be short ascii"));
            }
            out.push(ATOM_EXT);
            out.extend_from_slice(&(a.len() as u16).to_be_bytes());
            out.extend_from_slice(a.as_bytes());
        }
        Term::List(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
            } else {
                out.push(LIST_EXT);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    encode_into(item, out)?;
                }
                out.push(NIL_EXT);
            }
        }
        Term::Tuple(items) => {
            if items.len() < 256 {
                out.push(SMALL_TUPLE_EXT);
                out.push(items.len() as u8);
            } else {
                out.push(LARGE_TUPLE_EXT);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            }
            for item in items {
                encode_into(item, out)?;
            }
        }
    }
    Ok(())
}

/// Decode one term from a full frame payload. Trailing garbage, unknown
/// tags and truncated nested terms are all malformed.
pub fn decode(raw: &[u8]) -> Result<Term, CodecError> {
    if raw.len() > FRAME_LIMIT {
        return Err(CodecError::Oversize);
    }
    let mut r = Reader { raw, pos: 0 };
    if r.take_u8()? != VERSION {
        return Err(CodecError::Malformed("bad version byte"));
    }
    let term = decode_term(&mut r)?;
    if r.pos != raw.len() {
        return Err(CodecError::Malformed("trailing bytes"));
    }
    Ok(term)
}

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.raw.len() - self.pos < n {
            return Err(CodecError::Malformed("truncated term"));
        }
        let out = &self.raw[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn decode_term(r: &mut Reader<'_>) -> Result<Term, CodecError> {
    match r.take_u8()? {
        SMALL_INTEGER_EXT => Ok(Term::Int(r.take_u8()? as u64)),
        INTEGER_EXT => {
            let v = r.take_u32()? as i32;
            if v < 0 {
                return Err(CodecError::Malformed("negative integer"));
            }
            Ok(Term::Int(v as u64))
        }
        SMALL_BIG_EXT => {
            let len = r.take_u8()? as usize;
            let sign = r.take_u8()?;
            if sign != 0 {
                return Err(CodecError::Malformed("negative big"));
            }
            if len > 8 {
                return Err(CodecError::Malformed("big integer too wide"));
            }
            let digits = r.take(len)?;
            let mut buf = [0u8; 8];
            buf[..len].copy_from_slice(digits);
            Ok(Term::Int(u64::from_le_bytes(buf)))
        }
        ATOM_EXT | ATOM_UTF8_EXT => {
            let len = r.take_u16()? as usize;
            let raw = r.take(len)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| CodecError::Malformed("atom not utf8"))?;
            Ok(Term::Atom(name.to_string()))
        }
        SMALL_ATOM_UTF8_EXT => {
            let len = r.take_u8()? as usize;
            let raw = r.take(len)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| CodecError::Malformed("atom not utf8"))?;
            Ok(Term::Atom(name.to_string()))
        }
        BINARY_EXT => {
            let len = r.take_u32()? as usize;
            Ok(Term::Bytes(r.take(len)?.to_vec()))
        }
        NIL_EXT => Ok(Term::List(Vec::new())),
        STRING_EXT => {
            // list of small integers, compacted by the sender
            let len = r.take_u16()? as usize;
            let raw = r.take(len)?;
            Ok(Term::List(raw.iter().map(|&b| Term::Int(b as u64)).collect()))
        }
        LIST_EXT => {
            let len = r.take_u32()? as usize;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(decode_term(r)?);
            }
            if r.take_u8()? != NIL_EXT {
                return Err(CodecError::Malformed("improper list"));
            }
            Ok(Term::List(items))
        }
        SMALL_TUPLE_EXT => {
            let len = r.take_u8()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_term(r)?);
            }
            Ok(Term::Tuple(items))
        }
        LARGE_TUPLE_EXT => {
            let len = r.take_u32()? as usize;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(decode_term(r)?);
            }
            Ok(Term::Tuple(items))
        }
        _ => Err(CodecError::Malformed("unknown tag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scalar_roundtrips() {
        for v in [0u64, 1, 255, 256, 65535, i32::MAX as u64, 1 << 40, u64::MAX] {
            let t = Term::Int(v);
            assert_eq!(decode(&encode(&t).unwrap()).unwrap(), t, "value {}", v);
        }
    }

    #[test]
    fn compound_roundtrip() {
        let t = Term::Tuple(vec![
            Term::Int(42),
            Term::atom("response"),
            Term::bytes(vec![1, 2, 3]),
            Term::List(vec![Term::Int(7), Term::bytes(vec![9])]),
            Term::List(vec![]),
        ]);
        assert_eq!(decode(&encode(&t).unwrap()).unwrap(), t);
    }

    #[test]
    fn string_ext_decodes_as_int_list() {
        // 131, 107, len=3, bytes 1 2 3
        let raw = [131, 107, 0, 3, 1, 2, 3];
        assert_eq!(
            decode(&raw).unwrap(),
            Term::List(vec![Term::Int(1), Term::Int(2), Term::Int(3)])
        );
    }

    #[test]
    fn malformed_inputs() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[130, 97, 1]).is_err()); // wrong version
        assert!(decode(&[131, 200]).is_err()); // unknown tag
        assert!(decode(&[131, 109, 0, 0, 0, 9, 1]).is_err()); // binary overrun
        assert!(decode(&[131, 97, 1, 97, 2]).is_err()); // trailing bytes
        // nested overrun: tuple claims two items, contains one
        assert!(decode(&[131, 104, 2, 97, 1]).is_err());
    }

    #[test]
    fn oversize_rejected() {
        let t = Term::Bytes(vec![0u8; FRAME_LIMIT + 1]);
        assert_eq!(encode(&t), Err(CodecError::Oversize));
    }

    fn arb_term() -> impl Strategy<Value = Term> {
        let leaf = prop_oneof![
            any::<u64>().prop_map(Term::Int),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Term::Bytes),
            "[a-z_]{1,12}".prop_map(Term::Atom),
        ];
        leaf.prop_recursive(3, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Term::List),
                proptest::collection::vec(inner, 0..6).prop_map(Term::Tuple),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_roundtrip(t in arb_term()) {
            let encoded = encode(&t).unwrap();
            prop_assert_eq!(decode(&encoded).unwrap(), t);
        }
    }
}
