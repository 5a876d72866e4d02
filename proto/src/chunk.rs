//! Stream chunks and progress records.
//!
//! A file transfer is a sequence of chunks, each a framed message of its own:
//!
//! - `cancel = 0`, non-empty data: more data follows
//! - `cancel = 0`, empty data: end of stream, success
//! - `cancel = 1`: end of stream, transfer cancelled

use crate::error::ProtoError;
use crate::xdr::{XdrDecode, XdrDecoder, XdrEncode, XdrEncoder};
use crate::{MAX_CHUNK_SIZE, PROGRESS_MESSAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub cancel: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    More,
    End,
    Cancel,
}

impl Chunk {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            cancel: false,
            data,
        }
    }

    pub fn end() -> Self {
        Self {
            cancel: false,
            data: Vec::new(),
        }
    }

    pub fn cancel() -> Self {
        Self {
            cancel: true,
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> ChunkKind {
        if self.cancel {
            ChunkKind::Cancel
        } else if self.data.is_empty() {
            ChunkKind::End
        } else {
            ChunkKind::More
        }
    }
}

/// Encode a chunk header and payload without copying the payload first.
pub fn encode_chunk(cancel: bool, data: &[u8]) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.put_i32(cancel as i32);
    enc.put_opaque(data);
    enc.into_inner()
}

impl XdrEncode for Chunk {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_i32(self.cancel as i32);
        enc.put_opaque(&self.data);
    }
}

impl XdrDecode for Chunk {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        let cancel = dec.get_i32()? != 0;
        let data = dec.get_opaque_max(MAX_CHUNK_SIZE)?.to_vec();
        Ok(Self { cancel, data })
    }
}

/// Out-of-band progress notification, sent after a `PROGRESS_FLAG` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub proc_nr: u32,
    pub serial: u32,
    pub position: u64,
    pub total: u64,
}

impl Progress {
    pub fn to_bytes(&self) -> [u8; PROGRESS_MESSAGE_SIZE] {
        let mut out = [0u8; PROGRESS_MESSAGE_SIZE];
        out[0..4].copy_from_slice(&self.proc_nr.to_be_bytes());
        out[4..8].copy_from_slice(&self.serial.to_be_bytes());
        out[8..16].copy_from_slice(&self.position.to_be_bytes());
        out[16..24].copy_from_slice(&self.total.to_be_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        let mut dec = XdrDecoder::new(buf);
        Ok(Self {
            proc_nr: dec.get_u32()?,
            serial: dec.get_u32()?,
            position: dec.get_u64()?,
            total: dec.get_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_kinds() {
        assert_eq!(Chunk::data(vec![1]).kind(), ChunkKind::More);
        assert_eq!(Chunk::end().kind(), ChunkKind::End);
        assert_eq!(Chunk::cancel().kind(), ChunkKind::Cancel);
    }

    #[test]
    fn test_encode_chunk_matches_struct_encoding() {
        let chunk = Chunk::data(b"hello".to_vec());
        assert_eq!(encode_chunk(false, b"hello"), chunk.to_xdr());
        assert_eq!(Chunk::from_xdr(&chunk.to_xdr()).unwrap(), chunk);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let bytes = encode_chunk(false, &vec![0u8; MAX_CHUNK_SIZE + 1]);
        assert!(matches!(
            Chunk::from_xdr(&bytes),
            Err(ProtoError::TooLong { .. })
        ));
    }

    #[test]
    fn test_progress_layout() {
        let progress = Progress {
            proc_nr: 24,
            serial: 9,
            position: 512,
            total: 1024,
        };
        let bytes = progress.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 24]);
        assert_eq!(Progress::from_bytes(&bytes).unwrap(), progress);
    }
}
