//! Little-endian encoding helpers for the heap and directory files.
//!
//! Both files end in a SHA-256 digest of everything before it, so a torn or
//! edited file is rejected as a whole instead of being partially applied.

use crate::error::{ManagerError, ManagerResult};
use sha2::{Digest, Sha256};

/// Length of the checksum footer.
pub(crate) const DIGEST_LEN: usize = 32;

/// Append-only byte buffer.
#[derive(Debug, Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a `u32` length followed by the UTF-8 bytes.
    pub(crate) fn string(&mut self, value: &str) -> ManagerResult<()> {
        self.u32(length_prefix(value.len())?);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Appends the checksum footer and returns the finished buffer.
    pub(crate) fn seal(mut self) -> Vec<u8> {
        let digest = Sha256::digest(&self.buf);
        self.buf.extend_from_slice(&digest);
        self.buf
    }
}

fn length_prefix(len: usize) -> ManagerResult<u32> {
    u32::try_from(len).map_err(|_| {
        ManagerError::invalid_argument(format!("string of {len} bytes is too long to store"))
    })
}

/// Cursor over a sealed buffer.
#[derive(Debug)]
pub(crate) struct Decoder<'a> {
    data: &'a [u8],
    cursor: usize,
    what: &'static str,
}

impl<'a> Decoder<'a> {
    /// Verifies the checksum footer and returns a decoder over the body.
    pub(crate) fn unseal(data: &'a [u8], what: &'static str) -> ManagerResult<Self> {
        if data.len() < DIGEST_LEN {
            return Err(ManagerError::format(format!("{what} file is truncated")));
        }
        let (body, digest) = data.split_at(data.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(ManagerError::format(format!("{what} file checksum mismatch")));
        }
        Ok(Self {
            data: body,
            cursor: 0,
            what,
        })
    }

    fn take(&mut self, len: usize) -> ManagerResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| ManagerError::format(format!("{} file too short", self.what)))?;
        let bytes = &self.data[self.cursor..end];
        self.cursor = end;
        Ok(bytes)
    }

    /// Consumes `expected` or fails with a format error.
    pub(crate) fn magic(&mut self, expected: &[u8]) -> ManagerResult<()> {
        if self.take(expected.len())? != expected {
            return Err(ManagerError::format(format!("invalid {} magic", self.what)));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> ManagerResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> ManagerResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn u64(&mut self) -> ManagerResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn string(&mut self) -> ManagerResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ManagerError::format(format!("invalid UTF-8 in {} file", self.what)))
    }

    /// Reads a count and checks it against the remaining bytes, assuming
    /// each element takes at least `min_element_len` bytes.
    pub(crate) fn count(&mut self, min_element_len: usize) -> ManagerResult<usize> {
        let count = usize::try_from(self.u64()?)
            .map_err(|_| ManagerError::format(format!("{} count overflows", self.what)))?;
        let remaining = self.data.len() - self.cursor;
        if count.saturating_mul(min_element_len.max(1)) > remaining {
            return Err(ManagerError::format(format!("{} file too short", self.what)));
        }
        Ok(count)
    }

    /// Fails if any bytes are left unread.
    pub(crate) fn finish(self) -> ManagerResult<()> {
        if self.cursor != self.data.len() {
            return Err(ManagerError::format(format!(
                "{} trailing bytes in {} file",
                self.data.len() - self.cursor,
                self.what
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.bytes(b"TEST");
        enc.u8(7);
        enc.u32(0xDEAD_BEEF);
        enc.u64(u64::MAX - 1);
        enc.string("héllo").unwrap();
        enc.seal()
    }

    #[test]
    fn sealed_buffer_decodes() {
        let data = sample();
        let mut dec = Decoder::unseal(&data, "test").unwrap();
        dec.magic(b"TEST").unwrap();
        assert_eq!(dec.u8().unwrap(), 7);
        assert_eq!(dec.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dec.u64().unwrap(), u64::MAX - 1);
        assert_eq!(dec.string().unwrap(), "héllo");
        dec.finish().unwrap();
    }

    #[test]
    fn corruption_is_detected() {
        let mut data = sample();
        data[5] ^= 0xFF;
        assert!(matches!(
            Decoder::unseal(&data, "test"),
            Err(ManagerError::Format { .. })
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let data = sample();
        for len in [0, 10, data.len() - 1] {
            assert!(Decoder::unseal(&data[..len], "test").is_err());
        }
    }

    #[test]
    fn reads_past_end_fail() {
        let mut enc = Encoder::new();
        enc.u32(1);
        let data = enc.seal();
        let mut dec = Decoder::unseal(&data, "test").unwrap();
        assert!(dec.u64().is_err());
    }

    #[test]
    fn oversized_string_length_rejected() {
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            length_prefix(u32::MAX as usize + 1),
            Err(ManagerError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn implausible_count_rejected() {
        let mut enc = Encoder::new();
        enc.u64(1 << 40);
        let data = enc.seal();
        let mut dec = Decoder::unseal(&data, "test").unwrap();
        assert!(dec.count(8).is_err());
    }
}
