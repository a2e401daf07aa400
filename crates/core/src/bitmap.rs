//! Chunk presence bitmap.

/// One bit per chunk index in `[0, len)`. A set bit means the chunk's bytes
/// are durably stored.
///
/// Bits only ever go from 0 to 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkBitmap {
    len: u32,
    words: Vec<u64>,
}

impl ChunkBitmap {
    /// Create an empty bitmap covering `len` chunks.
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; word_count(len)],
        }
    }

    /// Number of chunk indices covered.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `index` is marked present. Out-of-range indices read as absent.
    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = locate(index);
        self.words[word] & (1 << bit) != 0
    }

    /// Mark `index` present. Returns `true` if the bit was newly set.
    pub fn set(&mut self, index: u32) -> crate::Result<bool> {
        if index >= self.len {
            return Err(crate::Error::ChunkIndexOutOfRange {
                index,
                chunk_count: self.len,
            });
        }
        let (word, bit) = locate(index);
        let mask = 1u64 << bit;
        let newly_set = self.words[word] & mask == 0;
        self.words[word] |= mask;
        Ok(newly_set)
    }

    /// Popcount.
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Split `0..len` into `(present, missing)`, both ascending.
    pub fn partition(&self) -> (Vec<u32>, Vec<u32>) {
        (0..self.len).partition(|&i| self.get(i))
    }

    /// Missing indices in ascending order.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.len).filter(|&i| !self.get(i)).collect()
    }

    /// Persistent form: little-endian `u64` words.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Decode the persistent form. Short input is zero-extended and bits past
    /// `len` are dropped, so popcount never exceeds `len`.
    pub fn from_bytes(len: u32, bytes: &[u8]) -> Self {
        let mut bitmap = Self::new(len);
        for (slot, chunk) in bitmap.words.iter_mut().zip(bytes.chunks(8)) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            *slot = u64::from_le_bytes(buf);
        }
        let tail_bits = len % 64;
        if tail_bits != 0
            && let Some(last) = bitmap.words.last_mut()
        {
            *last &= (1u64 << tail_bits) - 1;
        }
        bitmap
    }
}

fn word_count(len: u32) -> usize {
    (len as usize).div_ceil(64)
}

fn locate(index: u32) -> (usize, u32) {
    ((index / 64) as usize, index % 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_idempotent() {
        let mut bitmap = ChunkBitmap::new(5);
        assert!(bitmap.set(2).unwrap());
        assert!(!bitmap.set(2).unwrap());
        assert_eq!(bitmap.count_ones(), 1);
    }

    #[test]
    fn test_set_out_of_range() {
        let mut bitmap = ChunkBitmap::new(5);
        assert!(matches!(
            bitmap.set(5),
            Err(crate::Error::ChunkIndexOutOfRange {
                index: 5,
                chunk_count: 5
            })
        ));
        assert_eq!(bitmap.count_ones(), 0);
        assert!(!bitmap.get(5));
    }

    #[test]
    fn test_partition() {
        let mut bitmap = ChunkBitmap::new(5);
        bitmap.set(0).unwrap();
        bitmap.set(2).unwrap();
        let (present, missing) = bitmap.partition();
        assert_eq!(present, vec![0, 2]);
        assert_eq!(missing, vec![1, 3, 4]);
        assert_eq!(bitmap.missing(), vec![1, 3, 4]);
    }

    #[test]
    fn test_spans_multiple_words() {
        let mut bitmap = ChunkBitmap::new(130);
        for i in [0, 63, 64, 127, 129] {
            bitmap.set(i).unwrap();
        }
        assert_eq!(bitmap.count_ones(), 5);
        assert!(bitmap.get(64));
        assert!(!bitmap.get(65));

        let restored = ChunkBitmap::from_bytes(130, &bitmap.to_bytes());
        assert_eq!(restored, bitmap);
    }

    #[test]
    fn test_from_bytes_masks_trailing_bits() {
        // All bits set in storage, but only 3 chunks declared.
        let bitmap = ChunkBitmap::from_bytes(3, &[0xff; 8]);
        assert_eq!(bitmap.count_ones(), 3);
        assert!(bitmap.is_complete());
    }

    #[test]
    fn test_from_short_bytes() {
        let bitmap = ChunkBitmap::from_bytes(100, &[]);
        assert_eq!(bitmap.count_ones(), 0);
        assert_eq!(bitmap.len(), 100);
    }
}
