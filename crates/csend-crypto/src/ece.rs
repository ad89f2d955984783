//! Streaming record encryption (RFC 8188 `aes128gcm`)
//!
//! Encoded stream format (binary):
//! ```text
//! [16 bytes: salt][4 bytes: rs, big-endian][1 byte: idlen = 0]
//! [record 0][record 1]...[record n]
//! record i = AES-128-GCM(CEK, NONCE_BASE ^ i, data || delimiter) || tag
//! ```
//!
//! Every record except the last holds exactly `rs - 17` data bytes. The
//! delimiter is `0x01` for a record that is followed by more, `0x02` for the
//! final one. Because the delimiter is inside the AEAD, a receiver can tell a
//! truncated stream from a finished one.
//!
//! Both directions are pull-driven: nothing is read from the source until the
//! output stream is polled.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{stream, StreamExt};
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use csend_core::config::DEFAULT_RECORD_SIZE;
use csend_core::{ByteStream, SendError, SendResult};

use crate::kdf::hkdf_expand;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub const SALT_SIZE: usize = 16;

/// salt + rs + idlen
pub const HEADER_SIZE: usize = SALT_SIZE + 4 + 1;

/// Per-record expansion: the tag plus the delimiter byte
pub const RECORD_OVERHEAD: usize = TAG_SIZE + 1;

pub const MIN_RECORD_SIZE: u32 = RECORD_OVERHEAD as u32 + 1;

const CEK_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

const DELIMITER_MORE: u8 = 0x01;
const DELIMITER_LAST: u8 = 0x02;

/// Sizes negotiated for one encoded stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub record_size: u32,
    /// Total plaintext bytes, when the caller declared it
    pub plaintext_size: Option<u64>,
    /// Exact encoded length for `plaintext_size`
    pub encrypted_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub record_size: u32,
    /// Fixed salt (tests only; production streams use a random one)
    pub salt: Option<[u8; SALT_SIZE]>,
    pub total_size: Option<u64>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            salt: None,
            total_size: None,
        }
    }
}

/// Encoded length of `size` plaintext bytes at record size `rs`.
///
/// There is always at least one (final) record, even for empty input.
pub fn encrypted_size(size: u64, rs: u32) -> u64 {
    let chunk = (rs as u64).saturating_sub(RECORD_OVERHEAD as u64).max(1);
    let records = size.div_ceil(chunk).max(1);
    HEADER_SIZE as u64 + size + RECORD_OVERHEAD as u64 * records
}

/// Encrypt `source` into a stream of header + records.
///
/// The first output chunk is the 21-byte header; each following chunk is one
/// sealed record.
pub fn encode(
    source: ByteStream,
    root_secret: &[u8],
    options: EncodeOptions,
) -> SendResult<(ByteStream, StreamInfo)> {
    check_record_size(options.record_size)?;

    let salt = options.salt.unwrap_or_else(|| {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    });
    let key = RecordKey::derive(root_secret, &salt)?;

    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.put_slice(&salt);
    header.put_u32(options.record_size);
    header.put_u8(0);

    let info = StreamInfo {
        record_size: options.record_size,
        plaintext_size: options.total_size,
        encrypted_size: options
            .total_size
            .map(|size| encrypted_size(size, options.record_size)),
    };

    let encoder = Encoder {
        source,
        source_done: false,
        buffer: BytesMut::new(),
        key,
        header: Some(header.freeze()),
        chunk_len: options.record_size as usize - RECORD_OVERHEAD,
        seq: 0,
        finished: false,
    };

    let output = stream::try_unfold(encoder, |mut encoder| async move {
        Ok(encoder.next_unit().await?.map(|unit| (unit, encoder)))
    })
    .boxed();

    Ok((output, info))
}

/// Decrypt an encoded stream back into plaintext chunks.
///
/// Input chunk boundaries are irrelevant; the decoder reassembles the header
/// and whole records itself. Any integrity failure ends the stream with
/// `SendError::StreamIntegrity` and nothing further is yielded.
pub fn decode(source: ByteStream, root_secret: &[u8], record_size: u32) -> ByteStream {
    let decoder = Decoder {
        source,
        source_done: false,
        buffer: BytesMut::new(),
        secret: Zeroizing::new(root_secret.to_vec()),
        expected_rs: record_size,
        rs: 0,
        key: None,
        seq: 0,
        finished: false,
    };

    stream::try_unfold(decoder, |mut decoder| async move {
        Ok(decoder.next_unit().await?.map(|unit| (unit, decoder)))
    })
    .boxed()
}

fn check_record_size(rs: u32) -> SendResult<()> {
    if rs < MIN_RECORD_SIZE {
        return Err(SendError::Crypto(format!(
            "record size {rs} too small (minimum {MIN_RECORD_SIZE})"
        )));
    }
    Ok(())
}

fn integrity(msg: impl Into<String>) -> SendError {
    SendError::StreamIntegrity(msg.into())
}

/// Content-encryption key and nonce base for one stream.
struct RecordKey {
    cipher: Aes128Gcm,
    nonce_base: [u8; NONCE_SIZE],
}

impl RecordKey {
    fn derive(root_secret: &[u8], salt: &[u8]) -> SendResult<Self> {
        let mut cek = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf_expand(Some(salt), root_secret, CEK_INFO, &mut cek[..])?;

        let mut nonce_base = [0u8; NONCE_SIZE];
        hkdf_expand(Some(salt), root_secret, NONCE_INFO, &mut nonce_base)?;

        Ok(Self {
            cipher: Aes128Gcm::new((&*cek).into()),
            nonce_base,
        })
    }

    /// Nonce for record `seq`: the base with its low 64 bits XOR-ed by `seq`.
    fn nonce(&self, seq: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = self.nonce_base;
        let tail = &mut nonce[NONCE_SIZE - 8..];
        let mut counter = [0u8; 8];
        counter.copy_from_slice(tail);
        let mixed = u64::from_be_bytes(counter) ^ seq;
        tail.copy_from_slice(&mixed.to_be_bytes());
        nonce
    }

    fn seal(&self, seq: u64, data: &[u8], last: bool) -> SendResult<Bytes> {
        let mut padded = Vec::with_capacity(data.len() + 1);
        padded.extend_from_slice(data);
        padded.push(if last { DELIMITER_LAST } else { DELIMITER_MORE });
        self.seal_padded(seq, &padded)
    }

    fn seal_padded(&self, seq: u64, padded: &[u8]) -> SendResult<Bytes> {
        let nonce = self.nonce(seq);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), padded)
            .map_err(|e| SendError::Crypto(format!("record encryption failed: {e}")))?;
        Ok(Bytes::from(sealed))
    }

    /// Open record `seq`, returning its data and whether it was the final one.
    fn open(&self, seq: u64, record: &[u8]) -> SendResult<(Bytes, bool)> {
        if record.len() <= TAG_SIZE {
            return Err(integrity(format!(
                "record {seq} too short: {} bytes",
                record.len()
            )));
        }

        let nonce = self.nonce(seq);
        let mut padded = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), record)
            .map_err(|_| integrity(format!("record {seq} failed authentication")))?;

        // RFC 8188 allows zero padding after the delimiter.
        let Some(pos) = padded.iter().rposition(|b| *b != 0) else {
            return Err(integrity(format!("record {seq} has no delimiter")));
        };
        let last = match padded[pos] {
            DELIMITER_MORE => false,
            DELIMITER_LAST => true,
            other => {
                return Err(integrity(format!(
                    "record {seq} has invalid delimiter 0x{other:02x}"
                )))
            }
        };
        padded.truncate(pos);
        Ok((Bytes::from(padded), last))
    }
}

struct Encoder {
    source: ByteStream,
    source_done: bool,
    buffer: BytesMut,
    key: RecordKey,
    header: Option<Bytes>,
    chunk_len: usize,
    seq: u64,
    finished: bool,
}

impl Encoder {
    async fn next_unit(&mut self) -> SendResult<Option<Bytes>> {
        if let Some(header) = self.header.take() {
            return Ok(Some(header));
        }
        if self.finished {
            return Ok(None);
        }

        // Hold back until we have strictly more than one record's worth, or
        // the source is done: only then do we know whether this one is last.
        while !self.source_done && self.buffer.len() <= self.chunk_len {
            match self.source.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.source_done = true,
            }
        }

        let last = self.buffer.len() <= self.chunk_len;
        let take = self.buffer.len().min(self.chunk_len);
        let data = self.buffer.split_to(take);
        let record = self.key.seal(self.seq, &data, last)?;
        self.seq += 1;

        if last {
            self.finished = true;
            debug!(records = self.seq, "record stream sealed");
        }
        Ok(Some(record))
    }
}

struct Decoder {
    source: ByteStream,
    source_done: bool,
    buffer: BytesMut,
    secret: Zeroizing<Vec<u8>>,
    expected_rs: u32,
    rs: usize,
    key: Option<RecordKey>,
    seq: u64,
    finished: bool,
}

impl Decoder {
    async fn fill(&mut self, want: usize) -> SendResult<()> {
        while !self.source_done && self.buffer.len() < want {
            match self.source.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.source_done = true,
            }
        }
        Ok(())
    }

    async fn read_header(&mut self) -> SendResult<()> {
        self.fill(HEADER_SIZE).await?;
        if self.buffer.len() < HEADER_SIZE {
            return Err(integrity(format!(
                "stream header truncated: {} bytes",
                self.buffer.len()
            )));
        }

        let rs = u32::from_be_bytes([
            self.buffer[SALT_SIZE],
            self.buffer[SALT_SIZE + 1],
            self.buffer[SALT_SIZE + 2],
            self.buffer[SALT_SIZE + 3],
        ]);
        let idlen = self.buffer[HEADER_SIZE - 1] as usize;

        if rs < MIN_RECORD_SIZE {
            return Err(integrity(format!("invalid record size {rs} in header")));
        }
        if rs != self.expected_rs {
            return Err(integrity(format!(
                "record size mismatch: header says {rs}, expected {}",
                self.expected_rs
            )));
        }

        self.fill(HEADER_SIZE + idlen).await?;
        if self.buffer.len() < HEADER_SIZE + idlen {
            return Err(integrity("stream header truncated in key id"));
        }

        let header = self.buffer.split_to(HEADER_SIZE + idlen);
        self.key = Some(RecordKey::derive(&self.secret, &header[..SALT_SIZE])?);
        self.rs = rs as usize;
        Ok(())
    }

    async fn next_unit(&mut self) -> SendResult<Option<Bytes>> {
        if self.key.is_none() {
            self.read_header().await?;
        }

        loop {
            self.fill(self.rs).await?;

            if self.buffer.is_empty() {
                if self.finished {
                    debug!(records = self.seq, "record stream verified");
                    return Ok(None);
                }
                warn!(records = self.seq, "record stream ended without final record");
                return Err(integrity("stream truncated before final record"));
            }
            if self.finished {
                return Err(integrity("data after final record"));
            }

            let take = self.buffer.len().min(self.rs);
            let record = self.buffer.split_to(take);
            let key = self
                .key
                .as_ref()
                .ok_or_else(|| integrity("missing record key"))?;
            let (data, last) = key.open(self.seq, &record)?;
            self.seq += 1;
            self.finished = last;

            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
    }
}
