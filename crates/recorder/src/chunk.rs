//! Chunk Framing
//!
//! Every recorded chunk is an 8-byte little-endian header (timestamp, payload
//! size) followed by the payload.

use crate::RecordError;

/// Header bytes preceding each payload
pub const CHUNK_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Milliseconds since the start of the recording
    pub timestamp: u32,
    /// Payload bytes
    pub size: u32,
}

impl ChunkHeader {
    /// Little-endian wire form
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[..4].copy_from_slice(&self.timestamp.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Parse the little-endian wire form
    pub fn decode(bytes: &[u8; CHUNK_HEADER_SIZE]) -> Self {
        Self {
            timestamp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// One timestamped unit of recorded data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Encoded size including the header
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.data.len()
    }
}

/// Split a complete recording into chunks
pub fn decode_chunks(mut bytes: &[u8]) -> Result<Vec<Chunk>, RecordError> {
    let mut chunks = Vec::new();

    while !bytes.is_empty() {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(RecordError::Truncated(bytes.len()));
        }
        let (head, rest) = bytes.split_at(CHUNK_HEADER_SIZE);
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        raw.copy_from_slice(head);
        let header = ChunkHeader::decode(&raw);
        let size = header.size as usize;
        if rest.len() < size {
            return Err(RecordError::Truncated(bytes.len()));
        }

        chunks.push(Chunk {
            timestamp: header.timestamp,
            data: rest[..size].to_vec(),
        });
        bytes = &rest[size..];
    }

    Ok(chunks)
}
