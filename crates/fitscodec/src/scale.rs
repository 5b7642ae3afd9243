//! Pseudo-unsigned integers and `BSCALE`/`BZERO` calibration.
//!
//! FITS has no unsigned integer types of 16 bits or more. An unsigned N-byte
//! value is stored as the signed value `v - 2^(8N-1)` with `BZERO = 2^(8N-1)`
//! and `BSCALE = 1`. Signed bytes use the mirror trick: stored unsigned with
//! `BZERO = -128`.

use alloc::vec::Vec;

use crate::endian::{from_be_bytes_vec, to_be_bytes_vec};
use crate::error::{Error, Result};
use crate::header::Header;

/// An integer stored through the other-signedness type of the same width
/// plus a `BZERO` offset.
pub trait PseudoUnsigned: Copy {
    /// On-disk representation.
    type Stored: Copy;
    /// `BZERO` that recovers `Self` from `Stored`.
    const BZERO: f64;

    fn to_stored(self) -> Self::Stored;
    fn from_stored(stored: Self::Stored) -> Self;
}

macro_rules! impl_pseudo_unsigned {
    ($($t:ty => $s:ty, $mask:expr, $bzero:expr);* $(;)?) => {
        $(
            impl PseudoUnsigned for $t {
                type Stored = $s;
                const BZERO: f64 = $bzero;

                #[inline]
                fn to_stored(self) -> $s {
                    (self ^ $mask) as $s
                }

                #[inline]
                fn from_stored(stored: $s) -> $t {
                    (stored as $t) ^ $mask
                }
            }
        )*
    };
}

impl_pseudo_unsigned! {
    i8 => u8, i8::MIN, -128.0;
    u16 => i16, 0x8000, 32768.0;
    u32 => i32, 0x8000_0000, 2147483648.0;
    u64 => i64, 0x8000_0000_0000_0000, 9223372036854775808.0;
}

/// Disk value for `v`: `v - BZERO` in the stored type.
pub fn to_signed<T: PseudoUnsigned>(v: T) -> T::Stored {
    v.to_stored()
}

/// Recover the value from its disk form: `stored + BZERO`.
pub fn to_unsigned<T: PseudoUnsigned>(stored: T::Stored) -> T {
    T::from_stored(stored)
}

/// `BSCALE`/`BZERO` pair; `physical = bzero + bscale * stored`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    pub bscale: f64,
    pub bzero: f64,
    /// `BZERO` exactly as written, when the card holds an integer. `2^63`
    /// and its neighbours are indistinguishable as `f64`.
    pub exact_bzero: Option<i128>,
}

/// Exact `BZERO` offset marking `bitpix` data as pseudo-unsigned.
pub fn pseudo_unsigned_offset(bitpix: i64) -> Option<i128> {
    match bitpix {
        8 => Some(-128),
        16 => Some(1 << 15),
        32 => Some(1 << 31),
        64 => Some(1 << 63),
        _ => None,
    }
}

fn integral_bzero(header: &Header) -> Option<i128> {
    let card = header.get("BZERO")?;
    if let Ok(Some(text)) = card.source_text() {
        return text.trim().parse::<i128>().ok();
    }
    card.value().ok()?.as_int().map(i128::from)
}

impl Default for Scaling {
    fn default() -> Self {
        Scaling::IDENTITY
    }
}

impl Scaling {
    pub const IDENTITY: Scaling = Scaling {
        bscale: 1.0,
        bzero: 0.0,
        exact_bzero: None,
    };

    pub fn new(bscale: f64, bzero: f64) -> Scaling {
        Scaling {
            bscale,
            bzero,
            exact_bzero: None,
        }
    }

    /// Read `BSCALE`/`BZERO`, defaulting to the identity.
    pub fn from_header(header: &Header) -> Scaling {
        Scaling {
            bscale: header.get_float("BSCALE").unwrap_or(1.0),
            bzero: header.get_float("BZERO").unwrap_or(0.0),
            exact_bzero: integral_bzero(header),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.bscale == 1.0 && self.bzero == 0.0
    }

    /// Does this pair mark `bitpix` data as pseudo-unsigned (or signed bytes)?
    pub fn is_pseudo_unsigned(&self, bitpix: i64) -> bool {
        if self.bscale != 1.0 {
            return false;
        }
        let Some(offset) = pseudo_unsigned_offset(bitpix) else {
            return false;
        };
        match self.exact_bzero {
            Some(exact) => exact == offset,
            None => self.bzero == offset as f64,
        }
    }

    /// Physical values of `data`.
    pub fn apply(&self, data: &ImageData) -> Vec<f64> {
        let Scaling { bscale, bzero, .. } = *self;
        data.to_f64().into_iter().map(|p| bzero + bscale * p).collect()
    }

    /// Stored values of type `bitpix` for `physical`: `(v - bzero) / bscale`,
    /// rounded and clamped for integer types.
    pub fn reverse(&self, physical: &[f64], bitpix: i64) -> Result<ImageData> {
        let inv = |v: f64| (v - self.bzero) / self.bscale;
        let round_clamp = |v: f64, lo: f64, hi: f64| libm::round(v).clamp(lo, hi);
        Ok(match bitpix {
            8 => ImageData::U8(
                physical
                    .iter()
                    .map(|&v| round_clamp(inv(v), 0.0, 255.0) as u8)
                    .collect(),
            ),
            16 => ImageData::I16(
                physical
                    .iter()
                    .map(|&v| round_clamp(inv(v), i16::MIN as f64, i16::MAX as f64) as i16)
                    .collect(),
            ),
            32 => ImageData::I32(
                physical
                    .iter()
                    .map(|&v| round_clamp(inv(v), i32::MIN as f64, i32::MAX as f64) as i32)
                    .collect(),
            ),
            64 => ImageData::I64(
                physical
                    .iter()
                    .map(|&v| round_clamp(inv(v), i64::MIN as f64, i64::MAX as f64) as i64)
                    .collect(),
            ),
            -32 => ImageData::F32(physical.iter().map(|&v| inv(v) as f32).collect()),
            -64 => ImageData::F64(physical.iter().map(|&v| inv(v)).collect()),
            _ => return Err(Error::InvalidShape("unsupported BITPIX")),
        })
    }
}

/// Image pixels typed by their logical element type.
///
/// `I8`, `U16`, `U32` and `U64` go through the pseudo-unsigned encoding on
/// disk; the rest map directly onto a `BITPIX`.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

fn stored<T: PseudoUnsigned>(values: &[T]) -> Vec<T::Stored> {
    values.iter().map(|&v| to_signed(v)).collect()
}

fn recovered<T: PseudoUnsigned>(values: Vec<T::Stored>) -> Vec<T> {
    values.into_iter().map(to_unsigned).collect()
}

impl ImageData {
    pub fn len(&self) -> usize {
        match self {
            ImageData::U8(v) => v.len(),
            ImageData::I8(v) => v.len(),
            ImageData::I16(v) => v.len(),
            ImageData::U16(v) => v.len(),
            ImageData::I32(v) => v.len(),
            ImageData::U32(v) => v.len(),
            ImageData::I64(v) => v.len(),
            ImageData::U64(v) => v.len(),
            ImageData::F32(v) => v.len(),
            ImageData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `BITPIX` of the on-disk representation.
    pub fn bitpix(&self) -> i64 {
        match self {
            ImageData::U8(_) | ImageData::I8(_) => 8,
            ImageData::I16(_) | ImageData::U16(_) => 16,
            ImageData::I32(_) | ImageData::U32(_) => 32,
            ImageData::I64(_) | ImageData::U64(_) => 64,
            ImageData::F32(_) => -32,
            ImageData::F64(_) => -64,
        }
    }

    /// The implicit `BZERO` of pseudo-unsigned variants.
    pub fn pseudo_unsigned_bzero(&self) -> Option<f64> {
        match self {
            ImageData::I8(_) => Some(i8::BZERO),
            ImageData::U16(_) => Some(u16::BZERO),
            ImageData::U32(_) => Some(u32::BZERO),
            ImageData::U64(_) => Some(u64::BZERO),
            _ => None,
        }
    }

    /// Big-endian disk bytes. Pseudo-unsigned variants are offset first; the
    /// caller's values are never modified.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            ImageData::U8(v) => v.clone(),
            ImageData::I8(v) => stored(v),
            ImageData::I16(v) => to_be_bytes_vec(v),
            ImageData::U16(v) => to_be_bytes_vec(&stored(v)),
            ImageData::I32(v) => to_be_bytes_vec(v),
            ImageData::U32(v) => to_be_bytes_vec(&stored(v)),
            ImageData::I64(v) => to_be_bytes_vec(v),
            ImageData::U64(v) => to_be_bytes_vec(&stored(v)),
            ImageData::F32(v) => to_be_bytes_vec(v),
            ImageData::F64(v) => to_be_bytes_vec(v),
        }
    }

    /// Decode `bitpix` disk bytes. With `unsigned` set and a matching
    /// pseudo-unsigned `scaling`, the offset is removed and the unsigned (or
    /// signed-byte) variant is returned.
    pub fn from_be_bytes(
        bitpix: i64,
        bytes: &[u8],
        scaling: Scaling,
        unsigned: bool,
    ) -> Result<ImageData> {
        let pseudo = unsigned && scaling.is_pseudo_unsigned(bitpix);
        Ok(match (bitpix, pseudo) {
            (8, false) => ImageData::U8(bytes.to_vec()),
            (8, true) => ImageData::I8(recovered(bytes.to_vec())),
            (16, false) => ImageData::I16(from_be_bytes_vec(bytes)?),
            (16, true) => ImageData::U16(recovered(from_be_bytes_vec(bytes)?)),
            (32, false) => ImageData::I32(from_be_bytes_vec(bytes)?),
            (32, true) => ImageData::U32(recovered(from_be_bytes_vec(bytes)?)),
            (64, false) => ImageData::I64(from_be_bytes_vec(bytes)?),
            (64, true) => ImageData::U64(recovered(from_be_bytes_vec(bytes)?)),
            (-32, _) => ImageData::F32(from_be_bytes_vec(bytes)?),
            (-64, _) => ImageData::F64(from_be_bytes_vec(bytes)?),
            _ => return Err(Error::InvalidShape("unsupported BITPIX")),
        })
    }

    /// Values widened to `f64`, without calibration.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            ImageData::U8(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::I8(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::I16(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::U16(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::I32(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::U32(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::I64(v) => v.iter().map(|&p| p as f64).collect(),
            ImageData::U64(v) => v.iter().map(|&p| p as f64).collect(),
            ImageData::F32(v) => v.iter().map(|&p| f64::from(p)).collect(),
            ImageData::F64(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Card;
    use alloc::format;
    use alloc::vec;

    // --- pseudo-unsigned ---

    #[test]
    fn u16_offsets() {
        assert_eq!(to_signed(0u16), i16::MIN);
        assert_eq!(to_signed(32768u16), 0);
        assert_eq!(to_signed(u16::MAX), i16::MAX);
        assert_eq!(to_unsigned::<u16>(-32768), 0);
    }

    #[test]
    fn u32_and_u64_extremes() {
        for v in [0u32, 1, 0x8000_0000, u32::MAX] {
            assert_eq!(to_unsigned::<u32>(to_signed(v)), v);
        }
        for v in [0u64, 42, 1 << 63, u64::MAX] {
            assert_eq!(to_unsigned::<u64>(to_signed(v)), v);
        }
        assert_eq!(to_signed(u64::MAX), i64::MAX);
    }

    #[test]
    fn signed_bytes_use_negative_bzero() {
        assert_eq!(to_signed(-128i8), 0u8);
        assert_eq!(to_signed(127i8), 255u8);
        assert_eq!(f64::from(to_signed(-5i8)) + i8::BZERO, -5.0);
    }

    #[test]
    fn stored_plus_bzero_is_value() {
        let v = 40000u16;
        assert_eq!(f64::from(to_signed(v)) + u16::BZERO, 40000.0);
    }

    // --- scaling ---

    #[test]
    fn detects_pseudo_unsigned() {
        let s = Scaling::new(1.0, 32768.0);
        assert!(s.is_pseudo_unsigned(16));
        assert!(!s.is_pseudo_unsigned(32));
        assert!(!Scaling::IDENTITY.is_pseudo_unsigned(16));
        let scaled = Scaling::new(2.0, 32768.0);
        assert!(!scaled.is_pseudo_unsigned(16));
    }

    #[test]
    fn exact_bzero_text_decides_unsigned() {
        let header = |text: &str| {
            Header::from_cards([
                Card::new("BSCALE", 1i64, None).unwrap(),
                Card::parse(&format!("BZERO   = {text:>20}")).unwrap(),
            ])
            .unwrap()
        };
        let unsigned = |text: &str, bitpix| Scaling::from_header(&header(text)).is_pseudo_unsigned(bitpix);
        assert!(unsigned("9223372036854775808", 64));
        // same f64 as 2^63, different integer
        assert!(!unsigned("9223372036854775809", 64));
        assert!(!unsigned("9.22337203685477E+18", 64));
        assert!(unsigned("32768", 16));
        assert!(unsigned("32768.0", 16));
        assert!(unsigned("-128", 8));
    }

    #[test]
    fn apply_and_reverse() {
        let s = Scaling::new(0.5, 100.0);
        let physical = s.apply(&ImageData::I16(vec![0, 2, -4]));
        assert_eq!(physical, vec![100.0, 101.0, 98.0]);
        assert_eq!(s.reverse(&physical, 16).unwrap(), ImageData::I16(vec![0, 2, -4]));
    }

    #[test]
    fn reverse_clamps_integers() {
        let raw = Scaling::IDENTITY.reverse(&[-10.0, 300.0, 7.6], 8).unwrap();
        assert_eq!(raw, ImageData::U8(vec![0, 255, 8]));
        assert!(Scaling::IDENTITY.reverse(&[1.0], 12).is_err());
    }

    // --- image data ---

    #[test]
    fn unsigned_image_bytes() {
        let data = ImageData::U16(vec![0, 1, 65535]);
        let bytes = data.to_be_bytes();
        assert_eq!(bytes, vec![0x80, 0x00, 0x80, 0x01, 0x7F, 0xFF]);
        let scaling = Scaling::new(1.0, 32768.0);
        assert_eq!(
            ImageData::from_be_bytes(16, &bytes, scaling, true).unwrap(),
            data
        );
        assert_eq!(
            ImageData::from_be_bytes(16, &bytes, scaling, false).unwrap(),
            ImageData::I16(vec![i16::MIN, -32767, i16::MAX])
        );
    }

    #[test]
    fn float_image_bytes() {
        let data = ImageData::F32(vec![1.0, -2.5]);
        let back =
            ImageData::from_be_bytes(-32, &data.to_be_bytes(), Scaling::IDENTITY, true).unwrap();
        assert_eq!(back, data);
        assert_eq!(data.bitpix(), -32);
        assert_eq!(data.pseudo_unsigned_bzero(), None);
    }

    #[test]
    fn ragged_image_bytes() {
        assert!(ImageData::from_be_bytes(32, &[0, 0, 1], Scaling::IDENTITY, true).is_err());
        assert!(ImageData::from_be_bytes(24, &[0, 0, 1], Scaling::IDENTITY, true).is_err());
    }
}
