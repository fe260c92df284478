//! Fixed-capacity byte buffer with separate write/read cursors (C1).
//!
//! Grounded in `original_source/.../baselib/data/DataBlock.h`: a `DataBlock`
//! owns a flat byte buffer, a write cursor (`size`) and a read cursor
//! (`offset1`), with `0 <= offset1 <= size <= capacity` held as an
//! invariant. Per spec.md §9's redesign note, the reader and writer cursors
//! are split into distinct borrowing views (`BlockWriter`, `BlockReader`) so
//! the protocol layer cannot read past the write cursor at compile time.

pub mod pool;

use crate::error::ServerError;

/// `g_BlockCapacityDefault` in `DataBlock.h`.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// A fixed-capacity byte buffer with independent write and read cursors.
#[derive(Debug, Clone)]
pub struct DataBlock {
    buf: Vec<u8>,
    capacity: usize,
    size: usize,
    offset1: usize,
}

impl DataBlock {
    pub fn default_capacity() -> usize {
        DEFAULT_CAPACITY
    }

    /// Allocate a fresh block with the given capacity, empty (`size == 0`,
    /// `offset1 == 0`).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            size: 0,
            offset1: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset1(&self) -> usize {
        self.offset1
    }

    /// Reset to the state a pool hands out: `offset1 = 0, size = 0`. The
    /// underlying buffer is reused, not reallocated.
    pub fn reset(&mut self) {
        self.size = 0;
        self.offset1 = 0;
    }

    /// The bytes written so far, `[0, size)`.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// The bytes not yet read, `[offset1, size)`.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.offset1..self.size]
    }

    pub fn writer(&mut self) -> BlockWriter<'_> {
        BlockWriter { block: self }
    }

    pub fn reader(&mut self) -> BlockReader<'_> {
        BlockReader { block: self }
    }

    /// Byte-exact clone preserving `size` and `offset1`, matching
    /// `DataBlock::copy()` in `DataBlock.h`.
    pub fn copy_from(other: &DataBlock) -> Self {
        let mut buf = vec![0u8; other.capacity];
        buf[..other.size].copy_from_slice(&other.buf[..other.size]);
        Self {
            buf,
            capacity: other.capacity,
            size: other.size,
            offset1: other.offset1,
        }
    }

    /// Copy raw bytes straight into the block starting at the write cursor,
    /// advancing it. Used by the framing layer to land a whole frame
    /// payload in one shot instead of POD-by-POD.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        if self.size + bytes.len() > self.capacity {
            return Err(ServerError::ArgumentError(format!(
                "write of {} bytes would exceed capacity {} (size={})",
                bytes.len(),
                self.capacity,
                self.size
            )));
        }
        self.buf[self.size..self.size + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
        Ok(())
    }
}

/// A POD type writable/readable to a `DataBlock` in big-endian (network)
/// byte order, matching the `std::is_pod<T>` constraint on the C++
/// template.
pub trait Writable: Sized {
    fn write_to(&self, out: &mut Vec<u8>);
}

pub trait Readable: Sized {
    fn read_from(buf: &[u8]) -> Result<(Self, usize), ServerError>;
}

macro_rules! impl_pod {
    ($ty:ty) => {
        impl Writable for $ty {
            fn write_to(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }
        }

        impl Readable for $ty {
            fn read_from(buf: &[u8]) -> Result<(Self, usize), ServerError> {
                const N: usize = std::mem::size_of::<$ty>();
                if buf.len() < N {
                    return Err(ServerError::ArgumentError(format!(
                        "read past end of block: need {N} bytes, have {}",
                        buf.len()
                    )));
                }
                let mut arr = [0u8; N];
                arr.copy_from_slice(&buf[..N]);
                Ok((<$ty>::from_be_bytes(arr), N))
            }
        }
    };
}

impl_pod!(u8);
impl_pod!(u16);
impl_pod!(u32);
impl_pod!(u64);
impl_pod!(i32);
impl_pod!(i64);

/// A borrowing view over a block's write cursor only. Cannot observe or
/// move the read cursor.
pub struct BlockWriter<'a> {
    block: &'a mut DataBlock,
}

impl BlockWriter<'_> {
    pub fn write<T: Writable>(&mut self, value: &T) -> Result<(), ServerError> {
        let mut scratch = Vec::new();
        value.write_to(&mut scratch);
        self.block.write_raw(&scratch)
    }

    /// Length-prefixed UTF-8 string write (int32 length prefix, matching
    /// `DataBlock::write(const std::string&)`).
    pub fn write_string(&mut self, s: &str) -> Result<(), ServerError> {
        let bytes = s.as_bytes();
        let len = i32::try_from(bytes.len())
            .map_err(|_| ServerError::ArgumentError("string too long for i32 length prefix".into()))?;
        self.write(&len)?;
        self.block.write_raw(bytes)
    }
}

/// A borrowing view over a block's read cursor only, bounded by the write
/// cursor (`size`) — it is a compile error to construct one that could read
/// uninitialized tail bytes, since `size()` is the only bound it is handed.
pub struct BlockReader<'a> {
    block: &'a mut DataBlock,
}

impl BlockReader<'_> {
    pub fn read<T: Readable>(&mut self) -> Result<T, ServerError> {
        let (value, consumed) = T::read_from(self.block.unread())?;
        self.block.offset1 += consumed;
        Ok(value)
    }

    /// Length-prefixed UTF-8 string read.
    pub fn read_string(&mut self) -> Result<String, ServerError> {
        let len: i32 = self.read()?;
        let len = usize::try_from(len)
            .map_err(|_| ServerError::ArgumentError("negative string length prefix".into()))?;
        let available = self.block.unread();
        if available.len() < len {
            return Err(ServerError::ArgumentError(format!(
                "string read past end of block: need {len} bytes, have {}",
                available.len()
            )));
        }
        let s = std::str::from_utf8(&available[..len])
            .map_err(|e| ServerError::ArgumentError(format!("invalid utf-8 in block: {e}")))?
            .to_string();
        self.block.offset1 += len;
        Ok(s)
    }

    pub fn at_end(&self) -> bool {
        self.block.offset1 == self.block.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacity_matches_baselib() {
        assert_eq!(DataBlock::default_capacity(), 1024 * 1024);
    }

    #[test]
    fn pod_round_trip_advances_both_cursors() {
        let mut block = DataBlock::new(64);
        block.writer().write(&42u32).unwrap();
        assert_eq!(block.size(), 4);
        assert_eq!(block.offset1(), 0);

        let value: u32 = block.reader().read().unwrap();
        assert_eq!(value, 42);
        assert_eq!(block.offset1(), block.size());
    }

    #[test]
    fn string_round_trip() {
        let mut block = DataBlock::new(64);
        block.writer().write_string("hello").unwrap();
        let s = block.reader().read_string().unwrap();
        assert_eq!(s, "hello");
        assert!(block.reader().at_end());
    }

    #[test]
    fn write_past_capacity_fails() {
        let mut block = DataBlock::new(2);
        let err = block.writer().write(&42u32).unwrap_err();
        assert!(matches!(err, ServerError::ArgumentError(_)));
    }

    #[test]
    fn read_past_size_fails() {
        let mut block = DataBlock::new(64);
        let err = block.reader().read::<u32>().unwrap_err();
        assert!(matches!(err, ServerError::ArgumentError(_)));
    }

    #[test]
    fn copy_preserves_cursors_and_bytes() {
        let mut block = DataBlock::new(64);
        block.writer().write(&7u32).unwrap();
        let _: u32 = block.reader().read().unwrap();

        let copy = DataBlock::copy_from(&block);
        assert_eq!(copy.size(), block.size());
        assert_eq!(copy.offset1(), block.offset1());
        assert_eq!(copy.written(), block.written());
    }

    #[test]
    fn reset_clears_cursors_not_capacity() {
        let mut block = DataBlock::new(64);
        block.writer().write(&7u32).unwrap();
        block.reset();
        assert_eq!(block.size(), 0);
        assert_eq!(block.offset1(), 0);
        assert_eq!(block.capacity(), 64);
    }
}
