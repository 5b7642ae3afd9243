//! Big-endian byte conversion for FITS data.
//!
//! FITS stores all binary data big-endian (most-significant byte first). The
//! bulk routines here always work on a copy, so converting a caller's array
//! for writing never leaves it byte-swapped.

use alloc::format;
use alloc::vec::Vec;
use core::mem::size_of;

use bytemuck::Pod;

use crate::error::{Error, Result};

/// A plain numeric type with a fixed on-disk big-endian representation.
pub trait BigEndian: Pod {
    /// Swap between native and big-endian order. The operation is its own
    /// inverse and a no-op on big-endian hosts.
    fn to_be_order(self) -> Self;
}

macro_rules! impl_big_endian_int {
    ($($t:ty),*) => {
        $(
            impl BigEndian for $t {
                #[inline]
                fn to_be_order(self) -> Self {
                    self.to_be()
                }
            }
        )*
    };
}

impl_big_endian_int!(u8, i8, i16, u16, i32, u32, i64, u64);

impl BigEndian for f32 {
    #[inline]
    fn to_be_order(self) -> Self {
        f32::from_bits(self.to_bits().to_be())
    }
}

impl BigEndian for f64 {
    #[inline]
    fn to_be_order(self) -> Self {
        f64::from_bits(self.to_bits().to_be())
    }
}

/// Read one big-endian value from the start of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than `T`.
#[inline]
pub fn read_be<T: BigEndian>(buf: &[u8]) -> T {
    bytemuck::pod_read_unaligned::<T>(&buf[..size_of::<T>()]).to_be_order()
}

/// Write one value big-endian into the start of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than `T`.
#[inline]
pub fn write_be<T: BigEndian>(buf: &mut [u8], val: T) {
    let swapped = val.to_be_order();
    buf[..size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&swapped));
}

/// Big-endian bytes of `values`, leaving `values` untouched.
pub fn to_be_bytes_vec<T: BigEndian>(values: &[T]) -> Vec<u8> {
    let swapped: Vec<T> = values.iter().map(|v| v.to_be_order()).collect();
    bytemuck::pod_collect_to_vec(&swapped)
}

/// Decode big-endian bytes into native values.
///
/// Fails with [`Error::SchemaMismatch`] if the byte count is not a whole
/// number of elements.
pub fn from_be_bytes_vec<T: BigEndian>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = size_of::<T>();
    if size == 0 || bytes.len() % size != 0 {
        return Err(Error::SchemaMismatch(format!(
            "{} bytes is not a whole number of {size}-byte elements",
            bytes.len()
        )));
    }
    let mut out: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
    for v in &mut out {
        *v = v.to_be_order();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    // --- single values ---

    #[test]
    fn read_i16() {
        assert_eq!(read_be::<i16>(&[0x01, 0x02]), 0x0102);
        assert_eq!(read_be::<i16>(&[0xFF, 0xFE]), -2);
    }

    #[test]
    fn read_u32_ignores_trailing_bytes() {
        assert_eq!(read_be::<u32>(&[0, 0, 1, 0, 0xAA]), 256);
    }

    #[test]
    fn write_f64_layout() {
        let mut buf = [0u8; 8];
        write_be(&mut buf, 1.0f64);
        assert_eq!(buf, [0x3F, 0xF0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(read_be::<f64>(&buf), 1.0);
    }

    #[test]
    fn write_i64_negative() {
        let mut buf = [0u8; 8];
        write_be(&mut buf, -1i64);
        assert_eq!(buf, [0xFF; 8]);
    }

    // --- bulk ---

    #[test]
    fn bulk_i32_bytes() {
        let values = [1i32, -1, 0x0A0B0C0D];
        let bytes = to_be_bytes_vec(&values);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(from_be_bytes_vec::<i32>(&bytes).unwrap(), values);
    }

    #[test]
    fn caller_buffer_is_not_swapped() {
        let values = vec![0x0102u16, 0x0304];
        let before = values.clone();
        let _ = to_be_bytes_vec(&values);
        assert_eq!(values, before);
    }

    #[test]
    fn unaligned_source_bytes() {
        let mut raw = vec![0u8];
        raw.extend_from_slice(&to_be_bytes_vec(&[1.5f32, -2.25]));
        assert_eq!(from_be_bytes_vec::<f32>(&raw[1..]).unwrap(), vec![1.5, -2.25]);
    }

    #[test]
    fn ragged_length_is_rejected() {
        assert!(matches!(
            from_be_bytes_vec::<i16>(&[1, 2, 3]),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn empty_input() {
        assert!(to_be_bytes_vec::<f64>(&[]).is_empty());
        assert!(from_be_bytes_vec::<f64>(&[]).unwrap().is_empty());
    }
}
