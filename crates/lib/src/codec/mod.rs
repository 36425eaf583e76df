//! Entry wire codec.
//!
//! Every message on a replication connection is an envelope
//! `[tag: u8][payload length: u32][payload]`. Two payloads exist:
//!
//! * **Bootstrap** (`tag 1`): `[protocol version: u32][identifier: u8]`
//!   `[pairs: u16]` followed by `pairs × [identifier: u8][timestamp: u64]`.
//! * **Chunk** (`tag 2`): `[entries: u16]` followed by that many entry
//!   frames. A chunk with zero entries doubles as a heartbeat.
//!
//! An entry frame is
//! `[identifier: u8][timestamp: u64][tombstone: u8][key len: u32][key]`
//! and, unless the tombstone flag is set, `[value len: u32][value]`.
//! Integers are big-endian. Frames are never split across chunks.

use crate::record::Mutation;

pub mod errors;
pub mod io;

pub use errors::CodecError;

pub const TAG_BOOTSTRAP: u8 = 1;
pub const TAG_CHUNK: u8 = 2;

/// Envelope header: tag plus payload length.
pub const ENVELOPE_SIZE: usize = 5;

/// Fixed bytes of a frame around its key and value.
pub const FRAME_OVERHEAD: usize = 1 + 8 + 1 + 4 + 4;

/// Upper bound of one encoded frame when key plus value is at most
/// `entry_size` bytes.
pub fn max_entry_size(entry_size: usize) -> usize {
    FRAME_OVERHEAD + entry_size
}

/// How many maximal frames fit a chunk of `chunk_byte_budget` bytes.
pub fn max_entries_per_chunk(chunk_byte_budget: usize, max_entry_size: usize) -> u16 {
    let fit = chunk_byte_budget / max_entry_size.max(1);
    fit.clamp(1, u16::MAX as usize) as u16
}

/// Largest payload of a chunk holding at most `max_entries` frames.
pub fn max_chunk_payload(max_entries: u16, max_entry_size: usize) -> usize {
    2 + max_entries.max(1) as usize * max_entry_size
}

/// Handshake message exchanged when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub protocol_version: u32,
    pub identifier: u8,
    /// Highest timestamp seen per origin identifier; origins never seen are
    /// omitted.
    pub last_seen: Vec<(u8, u64)>,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Bootstrap(Bootstrap),
    Chunk(Vec<Mutation>),
}

/// Bytes one mutation occupies on the wire.
pub fn encoded_len(mutation: &Mutation) -> usize {
    let value = mutation.value.as_ref().map_or(0, |v| 4 + v.len());
    1 + 8 + 1 + 4 + mutation.key.len() + value
}

/// Append one frame to `out`.
pub fn encode_mutation(mutation: &Mutation, out: &mut Vec<u8>) {
    out.push(mutation.identifier);
    out.extend_from_slice(&mutation.timestamp.to_be_bytes());
    out.push(u8::from(mutation.is_tombstone()));
    out.extend_from_slice(&(mutation.key.len() as u32).to_be_bytes());
    out.extend_from_slice(&mutation.key);
    if let Some(value) = &mutation.value {
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
}

/// Cursor over a payload being decoded.
pub struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.at
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Decode one frame. `entry_size` bounds key plus value.
pub fn decode_mutation(reader: &mut Reader<'_>, entry_size: usize) -> Result<Mutation, CodecError> {
    let identifier = reader.u8()?;
    let timestamp = reader.u64()?;
    let tombstone = match reader.u8()? {
        0 => false,
        1 => true,
        other => return Err(CodecError::InvalidTombstoneFlag(other)),
    };
    let key_len = reader.u32()? as usize;
    if key_len > entry_size {
        return Err(CodecError::EntryTooLarge {
            size: key_len,
            max: entry_size,
        });
    }
    let key = reader.take(key_len)?.to_vec();
    let value = if tombstone {
        None
    } else {
        let value_len = reader.u32()? as usize;
        if key_len + value_len > entry_size {
            return Err(CodecError::EntryTooLarge {
                size: key_len + value_len,
                max: entry_size,
            });
        }
        Some(reader.take(value_len)?.to_vec())
    };
    Ok(Mutation {
        key,
        value,
        timestamp,
        identifier,
    })
}

fn envelope(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_SIZE + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a bootstrap message including its envelope.
pub fn encode_bootstrap(bootstrap: &Bootstrap) -> Vec<u8> {
    let pairs = &bootstrap.last_seen;
    let mut payload = Vec::with_capacity(7 + pairs.len() * 9);
    payload.extend_from_slice(&bootstrap.protocol_version.to_be_bytes());
    payload.push(bootstrap.identifier);
    payload.extend_from_slice(&(pairs.len().min(u16::MAX as usize) as u16).to_be_bytes());
    for (identifier, timestamp) in pairs.iter().take(u16::MAX as usize) {
        payload.push(*identifier);
        payload.extend_from_slice(&timestamp.to_be_bytes());
    }
    envelope(TAG_BOOTSTRAP, &payload)
}

fn decode_bootstrap(payload: &[u8]) -> Result<Bootstrap, CodecError> {
    let mut reader = Reader::new(payload);
    let protocol_version = reader.u32()?;
    let identifier = reader.u8()?;
    let count = reader.u16()? as usize;
    let mut last_seen = Vec::with_capacity(count);
    for _ in 0..count {
        let origin = reader.u8()?;
        let timestamp = reader.u64()?;
        last_seen.push((origin, timestamp));
    }
    reader.finish()?;
    Ok(Bootstrap {
        protocol_version,
        identifier,
        last_seen,
    })
}

fn decode_chunk(payload: &[u8], entry_size: usize) -> Result<Vec<Mutation>, CodecError> {
    let mut reader = Reader::new(payload);
    let count = reader.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(decode_mutation(&mut reader, entry_size)?);
    }
    reader.finish()?;
    Ok(entries)
}

/// Decode the payload of a message with the given tag.
pub fn decode_message(tag: u8, payload: &[u8], entry_size: usize) -> Result<Message, CodecError> {
    match tag {
        TAG_BOOTSTRAP => decode_bootstrap(payload).map(Message::Bootstrap),
        TAG_CHUNK => decode_chunk(payload, entry_size).map(Message::Chunk),
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Accumulates frames until a chunk holds its maximum number of entries.
#[derive(Debug)]
pub struct ChunkBuilder {
    max_entries: u16,
    count: usize,
    frames: Vec<u8>,
}

impl ChunkBuilder {
    pub fn new(max_entries: u16, max_entry_size: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            count: 0,
            frames: Vec::with_capacity(max_entries as usize * max_entry_size),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.max_entries as usize
    }

    /// Add a frame. Callers check [`is_full`](Self::is_full) and
    /// [`finish`](Self::finish) before pushing past capacity.
    pub fn push(&mut self, mutation: &Mutation) -> Result<(), CodecError> {
        if self.is_full() {
            return Err(CodecError::TooManyEntries(self.count + 1));
        }
        self.append(mutation);
        Ok(())
    }

    fn append(&mut self, mutation: &Mutation) {
        encode_mutation(mutation, &mut self.frames);
        self.count += 1;
    }

    /// Emit the enveloped chunk and reset the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.frames.len());
        payload.extend_from_slice(&(self.count as u16).to_be_bytes());
        payload.append(&mut self.frames);
        self.count = 0;
        envelope(TAG_CHUNK, &payload)
    }
}

/// Encode a batch of mutations as a sequence of enveloped chunks.
pub fn encode_chunks(
    mutations: &[Mutation],
    max_entries: u16,
    max_entry_size: usize,
) -> Vec<Vec<u8>> {
    let mut builder = ChunkBuilder::new(max_entries, max_entry_size);
    let mut chunks = Vec::new();
    for mutation in mutations {
        builder.append(mutation);
        if builder.is_full() {
            chunks.push(builder.finish());
        }
    }
    if !builder.is_empty() {
        chunks.push(builder.finish());
    }
    chunks
}

/// An empty chunk, sent as a heartbeat.
pub fn heartbeat() -> Vec<u8> {
    envelope(TAG_CHUNK, &0u16.to_be_bytes())
}
