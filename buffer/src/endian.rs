//! Fixed-width integer codecs over [Buffer].
//!
//! # Example
//!
//! ```
//! use wanproxy_buffer::{endian::{BigEndian, LittleEndian}, Buffer};
//!
//! let mut buffer = Buffer::new();
//! BigEndian::encode(&mut buffer, 0x0102u16);
//! LittleEndian::encode(&mut buffer, 0x0304u16);
//! assert_eq!(buffer.to_vec(), [0x01, 0x02, 0x04, 0x03]);
//!
//! assert_eq!(BigEndian::decode::<u16>(&buffer), Some(0x0102));
//! assert_eq!(BigEndian::extract::<u16>(&mut buffer), Some(0x0102));
//! assert_eq!(LittleEndian::extract::<u16>(&mut buffer), Some(0x0304));
//! assert!(buffer.is_empty());
//! ```

use crate::Buffer;

/// An unsigned integer with a fixed-width byte representation.
pub trait Integer: Copy + Sized {
    /// Number of bytes in the encoding.
    const SIZE: usize;

    /// Write the big-endian encoding of `self` into `out[..Self::SIZE]`.
    fn write_be(self, out: &mut [u8]);

    /// Write the little-endian encoding of `self` into `out[..Self::SIZE]`.
    fn write_le(self, out: &mut [u8]);

    /// Read a big-endian value from `data[..Self::SIZE]`.
    fn read_be(data: &[u8]) -> Self;

    /// Read a little-endian value from `data[..Self::SIZE]`.
    fn read_le(data: &[u8]) -> Self;
}

macro_rules! impl_integer {
    ($type:ty) => {
        impl Integer for $type {
            const SIZE: usize = std::mem::size_of::<$type>();

            #[inline]
            fn write_be(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_be(data: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$type>()];
                bytes.copy_from_slice(&data[..Self::SIZE]);
                <$type>::from_be_bytes(bytes)
            }

            #[inline]
            fn read_le(data: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$type>()];
                bytes.copy_from_slice(&data[..Self::SIZE]);
                <$type>::from_le_bytes(bytes)
            }
        }
    };
}

impl_integer!(u8);
impl_integer!(u16);
impl_integer!(u32);
impl_integer!(u64);

/// Network byte order.
pub struct BigEndian;

impl BigEndian {
    /// Append the encoding of `value`.
    pub fn encode<T: Integer>(buffer: &mut Buffer, value: T) {
        let mut bytes = [0u8; 8];
        value.write_be(&mut bytes);
        buffer.append_slice(&bytes[..T::SIZE]);
    }

    /// Read a value from the front of `buffer` without consuming it.
    ///
    /// Returns `None` if fewer than `T::SIZE` bytes are available.
    pub fn decode<T: Integer>(buffer: &Buffer) -> Option<T> {
        let bytes = front::<T>(buffer)?;
        Some(T::read_be(&bytes))
    }

    /// Read and consume a value from the front of `buffer`.
    pub fn extract<T: Integer>(buffer: &mut Buffer) -> Option<T> {
        let value = Self::decode(buffer)?;
        buffer.skip(T::SIZE);
        Some(value)
    }
}

/// Host byte order on the common platforms.
pub struct LittleEndian;

impl LittleEndian {
    /// Append the encoding of `value`.
    pub fn encode<T: Integer>(buffer: &mut Buffer, value: T) {
        let mut bytes = [0u8; 8];
        value.write_le(&mut bytes);
        buffer.append_slice(&bytes[..T::SIZE]);
    }

    /// Read a value from the front of `buffer` without consuming it.
    pub fn decode<T: Integer>(buffer: &Buffer) -> Option<T> {
        let bytes = front::<T>(buffer)?;
        Some(T::read_le(&bytes))
    }

    /// Read and consume a value from the front of `buffer`.
    pub fn extract<T: Integer>(buffer: &mut Buffer) -> Option<T> {
        let value = Self::decode(buffer)?;
        buffer.skip(T::SIZE);
        Some(value)
    }
}

fn front<T: Integer>(buffer: &Buffer) -> Option<[u8; 8]> {
    if buffer.len() < T::SIZE {
        return None;
    }
    let mut bytes = [0u8; 8];
    buffer.copyout(&mut bytes[..T::SIZE]);
    Some(bytes)
}
