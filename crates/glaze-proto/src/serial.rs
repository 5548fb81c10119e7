//! Flat message codec
//!
//! A `Serial` is a sequence of concatenated fixed-width little-endian values
//! with no type tags: writer and reader must agree on the schema of each
//! opcode. Raw arrays carry an explicit `u64` element count so the reader can
//! report how many elements were present and the caller can check arity.

use crate::error::ProtocolError;

/// A fixed-width value that can travel in a `Serial`
pub trait WireValue: Copy + Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn put(self, out: &mut Vec<u8>);

    /// Decode from exactly `SIZE` bytes
    fn take(bytes: &[u8]) -> Self;
}

macro_rules! wire_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn take(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

wire_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Encoded message buffer with a read cursor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Serial {
    buf: Vec<u8>,
    cursor: usize,
}

impl Serial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for decoding
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf, cursor: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Total encoded length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Restart reading from the beginning
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn append<T: WireValue>(&mut self, value: T) -> &mut Self {
        value.put(&mut self.buf);
        self
    }

    pub fn read<T: WireValue>(&mut self) -> Result<T, ProtocolError> {
        let bytes = self.take(T::SIZE)?;
        Ok(T::take(bytes))
    }

    /// Append a count-prefixed array
    pub fn append_bytes<T: WireValue>(&mut self, values: &[T]) -> &mut Self {
        self.append(values.len() as u64);
        self.buf.reserve(values.len() * T::SIZE);
        for value in values {
            value.put(&mut self.buf);
        }
        self
    }

    /// Read a count-prefixed array. The element count is the vector length.
    pub fn read_bytes<T: WireValue>(&mut self) -> Result<Vec<T>, ProtocolError> {
        let count = self.read_count(T::SIZE)?;
        let bytes = self.take(count * T::SIZE)?;
        Ok(bytes.chunks_exact(T::SIZE).map(T::take).collect())
    }

    /// Borrow a count-prefixed byte array without copying
    pub fn read_raw(&mut self) -> Result<&[u8], ProtocolError> {
        let count = self.read_count(1)?;
        self.take(count)
    }

    /// Read a count-prefixed array that must hold exactly `N` elements
    pub fn read_array<T: WireValue, const N: usize>(
        &mut self,
        field: &'static str,
    ) -> Result<[T; N], ProtocolError> {
        let values = self.read_bytes::<T>()?;
        let found = values.len();
        <[T; N]>::try_from(values).map_err(|_| ProtocolError::Arity {
            field,
            expected: N,
            found,
        })
    }

    fn read_count(&mut self, element_size: usize) -> Result<usize, ProtocolError> {
        let count = self.read::<u64>()?;
        let remaining = self.remaining();
        // Bound the count by what is actually present before allocating anything.
        usize::try_from(count)
            .ok()
            .filter(|count| count.checked_mul(element_size).is_some_and(|n| n <= remaining))
            .ok_or(ProtocolError::Underrun {
                needed: usize::try_from(count)
                    .unwrap_or(usize::MAX)
                    .saturating_mul(element_size),
                remaining,
            })
    }

    fn take(&mut self, len: usize) -> Result<&[u8], ProtocolError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(ProtocolError::Underrun {
                needed: len,
                remaining,
            });
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.buf[start..self.cursor])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_read_back_in_order() {
        let mut serial = Serial::new();
        serial.append(-7i32).append(42u64).append(0.5f32).append(9u8);

        let mut decoded = Serial::from_bytes(serial.into_bytes());
        assert_eq!(decoded.read::<i32>(), Ok(-7));
        assert_eq!(decoded.read::<u64>(), Ok(42));
        assert_eq!(decoded.read::<f32>(), Ok(0.5));
        assert_eq!(decoded.read::<u8>(), Ok(9));
        assert_eq!(decoded.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_is_underrun() {
        let mut serial = Serial::new();
        serial.append(1u16);
        let mut decoded = Serial::from_bytes(serial.into_bytes());
        assert_eq!(
            decoded.read::<u32>(),
            Err(ProtocolError::Underrun {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_array_reports_count() {
        let mut serial = Serial::new();
        serial.append_bytes(&[1i32, 2, 3]);
        let mut decoded = Serial::from_bytes(serial.into_bytes());
        assert_eq!(decoded.read_bytes::<i32>(), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_array_arity_is_checked() {
        let mut serial = Serial::new();
        serial.append_bytes(&[1i32, 2, 3]);
        let mut decoded = Serial::from_bytes(serial.into_bytes());
        assert_eq!(
            decoded.read_array::<i32, 4>("window rectangle"),
            Err(ProtocolError::Arity {
                field: "window rectangle",
                expected: 4,
                found: 3
            })
        );
    }

    #[test]
    fn test_lying_count_does_not_allocate() {
        let mut serial = Serial::new();
        serial.append(u64::MAX).append(1i32);
        let mut decoded = Serial::from_bytes(serial.into_bytes());
        assert!(matches!(
            decoded.read_bytes::<i32>(),
            Err(ProtocolError::Underrun { remaining: 4, .. })
        ));
    }

    #[test]
    fn test_raw_bytes_borrowed() {
        let mut serial = Serial::new();
        serial.append_bytes(&[0xAAu8, 0xBB]).append(3u8);
        let mut decoded = Serial::from_bytes(serial.into_bytes());
        assert_eq!(decoded.read_raw(), Ok(&[0xAA, 0xBB][..]));
        assert_eq!(decoded.read::<u8>(), Ok(3));
    }

    #[test]
    fn test_rewind() {
        let mut serial = Serial::new();
        serial.append(5i32);
        assert_eq!(serial.read::<i32>(), Ok(5));
        assert!(serial.read::<i32>().is_err());
        serial.rewind();
        assert_eq!(serial.read::<i32>(), Ok(5));
    }
}
