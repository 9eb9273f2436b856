//! Flat bytecode format.
//!
//! Layout: 4-byte magic `LATC`, little-endian `u16` format version, then the
//! bincode-encoded chunk tree (nested function constants included).

use crate::chunk::Chunk;
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"LATC";
pub const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("not a Lattice bytecode file (bad magic)")]
    BadMagic,
    #[error("unsupported bytecode version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("truncated bytecode header")]
    Truncated,
    #[error("bytecode encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub fn serialize(chunk: &Chunk) -> Result<Vec<u8>, SerializeError> {
    let body = bincode::serialize(chunk)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn deserialize(bytes: &[u8]) -> Result<Chunk, SerializeError> {
    if bytes.len() < HEADER_LEN {
        return Err(SerializeError::Truncated);
    }
    if bytes[..4] != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(SerializeError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    Ok(bincode::deserialize(&bytes[HEADER_LEN..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Capture, ChunkBuilder};
    use crate::opcode::OpCode;

    fn sample() -> Chunk {
        let mut inner = ChunkBuilder::function("inc", &[]);
        inner.get_upvalue(0).int(1).op(OpCode::Add).ret();
        let mut b = ChunkBuilder::script();
        b.int(41).local(1, "n");
        b.closure(inner.build().unwrap(), &[Capture::Local(1)]);
        b.call(0).op(OpCode::Halt);
        b.build().unwrap()
    }

    #[test]
    fn nested_chunks_survive_serialization() {
        let chunk = sample();
        let bytes = serialize(&chunk).unwrap();
        assert_eq!(&bytes[..4], b"LATC");
        let back = deserialize(&bytes).unwrap();
        assert_eq!(back, chunk);
        assert_eq!(back.local_name(1), Some("n"));
    }

    #[test]
    fn rejects_foreign_or_future_buffers() {
        let mut bytes = serialize(&sample()).unwrap();
        assert!(matches!(deserialize(b"LAT"), Err(SerializeError::Truncated)));

        bytes[4] = 9;
        assert!(matches!(
            deserialize(&bytes),
            Err(SerializeError::UnsupportedVersion { found: 9, .. })
        ));

        bytes[0] = b'X';
        assert!(matches!(deserialize(&bytes), Err(SerializeError::BadMagic)));
    }
}
