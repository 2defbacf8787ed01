//! Engine blob format
//!
//! ```text
//! magic "EPEB" | u16 version | u16 fingerprint len | fingerprint
//!              | u64 payload len | SHA-256 of payload (32 bytes) | payload
//! ```
//!
//! Integers are little-endian. The payload is the JSON form of a
//! `CompiledEngine`. Every framing error is reported as `Error::Deserialize`.

use std::fmt;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use common::error::{Error, Result};

/// Leading bytes of every engine blob
pub const BLOB_MAGIC: &[u8; 4] = b"EPEB";

/// Current format version
pub const BLOB_VERSION: u16 = 1;

const CHECKSUM_LEN: usize = 32;

/// Decoded blob header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    /// Format version
    pub version: u16,

    /// Fingerprint of the device the engine was built for
    pub device_fingerprint: String,

    /// SHA-256 of the payload
    pub checksum: [u8; CHECKSUM_LEN],
}

impl BlobHeader {
    /// Checksum as lowercase hex
    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }
}

/// Serialized engine bytes
///
/// Opaque to callers; only a `Runtime` on a device with the matching
/// fingerprint can turn it back into an engine.
#[derive(Clone, PartialEq, Eq)]
pub struct EngineBlob {
    data: Bytes,
}

impl EngineBlob {
    /// Frames `payload` for `device_fingerprint`
    pub fn encode(device_fingerprint: &str, payload: &[u8]) -> Result<Self> {
        let fingerprint = device_fingerprint.as_bytes();
        let fingerprint_len = u16::try_from(fingerprint.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "device fingerprint of {} bytes is too long",
                fingerprint.len()
            ))
        })?;

        let checksum = Sha256::digest(payload);

        let mut buf = BytesMut::with_capacity(
            BLOB_MAGIC.len() + 2 + 2 + fingerprint.len() + 8 + CHECKSUM_LEN + payload.len(),
        );
        buf.put_slice(BLOB_MAGIC);
        buf.put_u16_le(BLOB_VERSION);
        buf.put_u16_le(fingerprint_len);
        buf.put_slice(fingerprint);
        buf.put_u64_le(payload.len() as u64);
        buf.put_slice(&checksum);
        buf.put_slice(payload);

        Ok(Self { data: buf.freeze() })
    }

    /// Wraps bytes read from storage; nothing is checked until decoded
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Raw blob bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Blob size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the blob holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Checks framing and checksum, returning the header and payload
    pub fn decode(&self) -> Result<(BlobHeader, Bytes)> {
        let mut buf = self.data.clone();

        let magic = take(&mut buf, BLOB_MAGIC.len(), "magic")?;
        if &magic[..] != &BLOB_MAGIC[..] {
            return Err(Error::Deserialize("not an engine blob (bad magic)".to_string()));
        }

        need(&buf, 2, "version")?;
        let version = buf.get_u16_le();
        if version != BLOB_VERSION {
            return Err(Error::Deserialize(format!(
                "unsupported engine blob version {} (supported: {})",
                version, BLOB_VERSION
            )));
        }

        need(&buf, 2, "fingerprint length")?;
        let fingerprint_len = buf.get_u16_le() as usize;
        let fingerprint = take(&mut buf, fingerprint_len, "fingerprint")?;
        let device_fingerprint = String::from_utf8(fingerprint.to_vec())
            .map_err(|_| Error::Deserialize("device fingerprint is not UTF-8".to_string()))?;

        need(&buf, 8, "payload length")?;
        let payload_len = buf.get_u64_le();

        let stored = take(&mut buf, CHECKSUM_LEN, "checksum")?;
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&stored);

        if payload_len != buf.remaining() as u64 {
            return Err(Error::Deserialize(format!(
                "payload length {} does not match the {} bytes present",
                payload_len,
                buf.remaining()
            )));
        }

        let payload = buf;
        let actual = Sha256::digest(&payload);
        if actual.as_slice() != &checksum[..] {
            return Err(Error::Deserialize(format!(
                "payload checksum mismatch: stored {}, computed {}",
                hex::encode(checksum),
                hex::encode(actual)
            )));
        }

        Ok((
            BlobHeader {
                version,
                device_fingerprint,
                checksum,
            },
            payload,
        ))
    }
}

impl fmt::Debug for EngineBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBlob").field("len", &self.data.len()).finish()
    }
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Deserialize(format!(
            "engine blob truncated while reading {}",
            what
        )));
    }
    Ok(())
}

fn take(buf: &mut Bytes, len: usize, what: &str) -> Result<Bytes> {
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}
