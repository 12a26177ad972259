#![forbid(unsafe_code)]

/// Incremental checksum over byte chunks.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC-32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC-32 over a sequence of chunks, as if they were contiguous.
pub fn crc32_of(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// Folds a frame into the running WAL chain value.
///
/// The chain binds each frame to every frame before it, so a frame copied
/// from another log (or another position) does not validate.
pub fn chain_crc(prev_chain: u64, frame_header: &[u8], payload: &[u8]) -> u64 {
    let frame_len = (frame_header.len() + payload.len()) as u64;
    let crc = crc32_of(&[&prev_chain.to_be_bytes(), frame_header, payload]);
    (frame_len << 32) | u64::from(crc)
}
