//! Payload geometry implied by a header's structural keywords.
//!
//! Every data unit's size follows from `BITPIX`, `NAXIS`, `NAXISn`, `PCOUNT`
//! and `GCOUNT`:
//!
//! ```text
//! bytes = |BITPIX| / 8 * GCOUNT * (PCOUNT + NAXIS1 * ... * NAXISm)
//! ```
//!
//! Random groups drop the zero `NAXIS1` from the product. A unit with
//! `NAXIS = 0` has no payload.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::block::PadKind;
use crate::column::TableKind;
use crate::error::{Error, Result};
use crate::header::Header;

/// What kind of unit a header introduces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// First unit, `SIMPLE = T`.
    Primary,
    /// Primary unit with `GROUPS = T` and `NAXIS1 = 0`.
    RandomGroups,
    /// `XTENSION = 'IMAGE'`
    Image,
    Table(TableKind),
    /// Any other `XTENSION`; sized by the generic formula.
    Other(String),
}

/// Geometry of one data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataShape {
    pub kind: UnitKind,
    pub bitpix: i64,
    /// `NAXIS1..NAXISn`, fastest-varying first.
    pub axes: Vec<usize>,
    pub pcount: usize,
    pub gcount: usize,
    byte_len: usize,
}

fn nonnegative(value: i64, what: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidShape(what))
}

fn required(header: &Header, keyword: &'static str) -> Result<i64> {
    header
        .get_int(keyword)
        .ok_or(Error::MissingKeyword(keyword))
}

fn overflow() -> Error {
    Error::InvalidShape("data size overflows")
}

impl DataShape {
    /// Derive the payload geometry from `header`.
    pub fn from_header(header: &Header) -> Result<DataShape> {
        let first = header.card(0).map(|c| c.keyword().to_string());
        let primary = first.as_deref() == Some("SIMPLE");
        let xtension = if primary {
            None
        } else {
            Some(
                header
                    .get_str("XTENSION")
                    .ok_or(Error::MissingKeyword("XTENSION"))?
                    .trim_end()
                    .to_string(),
            )
        };

        let bitpix = required(header, "BITPIX")?;
        if !matches!(bitpix, 8 | 16 | 32 | 64 | -32 | -64) {
            return Err(Error::InvalidShape("BITPIX must be 8, 16, 32, 64, -32 or -64"));
        }
        let naxis = nonnegative(required(header, "NAXIS")?, "NAXIS is negative")?;
        if naxis > 999 {
            return Err(Error::InvalidShape("NAXIS exceeds 999"));
        }
        let axes = (1..=naxis)
            .map(|n| {
                let value = header
                    .get_int(&format!("NAXIS{n}"))
                    .ok_or(Error::MissingKeyword("NAXISn"))?;
                nonnegative(value, "NAXISn is negative")
            })
            .collect::<Result<Vec<_>>>()?;

        let groups = primary
            && axes.first() == Some(&0)
            && header.get_bool("GROUPS") == Some(true);

        let kind = match &xtension {
            None if groups => UnitKind::RandomGroups,
            None => UnitKind::Primary,
            Some(x) if x == "IMAGE" => UnitKind::Image,
            Some(x) => match TableKind::from_xtension(x) {
                Some(table) => UnitKind::Table(table),
                None => UnitKind::Other(x.clone()),
            },
        };

        let (pcount, gcount) = match kind {
            UnitKind::Primary => (0, 1),
            UnitKind::RandomGroups => (
                nonnegative(required(header, "PCOUNT")?, "PCOUNT is negative")?,
                nonnegative(required(header, "GCOUNT")?, "GCOUNT is negative")?,
            ),
            _ => (
                nonnegative(header.get_int("PCOUNT").unwrap_or(0), "PCOUNT is negative")?,
                nonnegative(header.get_int("GCOUNT").unwrap_or(1), "GCOUNT is negative")?,
            ),
        };

        if let UnitKind::Table(_) = kind {
            if bitpix != 8 || naxis != 2 {
                return Err(Error::InvalidShape("tables need BITPIX = 8 and NAXIS = 2"));
            }
        }

        let byte_len = if naxis == 0 {
            0
        } else {
            let counted = if groups { &axes[1..] } else { &axes[..] };
            let elements = counted
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(overflow)?;
            elements
                .checked_add(pcount)
                .and_then(|n| n.checked_mul(gcount))
                .and_then(|n| n.checked_mul(bitpix.unsigned_abs() as usize / 8))
                .ok_or_else(overflow)?
        };

        Ok(DataShape {
            kind,
            bitpix,
            axes,
            pcount,
            gcount,
            byte_len,
        })
    }

    /// Payload bytes before block padding.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn pad_kind(&self) -> PadKind {
        match self.kind {
            UnitKind::Table(TableKind::Ascii) => PadKind::AsciiTable,
            _ => PadKind::Binary,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self.kind, UnitKind::Table(_))
    }

    /// Bytes per table row (`NAXIS1`).
    pub fn row_width(&self) -> Option<usize> {
        self.is_table().then(|| self.axes[0])
    }

    /// Table row count (`NAXIS2`).
    pub fn nrows(&self) -> Option<usize> {
        self.is_table().then(|| self.axes[1])
    }

    /// Bytes following the table rows: the gap, if any, plus the heap.
    pub fn heap_len(&self) -> usize {
        if self.is_table() {
            self.pcount
        } else {
            0
        }
    }

    /// Pixel count of an image array (primary or `IMAGE`).
    pub fn element_count(&self) -> usize {
        if self.axes.is_empty() {
            0
        } else {
            self.axes.iter().product()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Card;
    use alloc::vec;
    use crate::value::Value;

    fn header(cards: &[(&str, Value)]) -> Header {
        Header::from_cards(
            cards
                .iter()
                .map(|(k, v)| Card::new(k, v.clone(), None).unwrap()),
        )
        .unwrap()
    }

    // --- images ---

    #[test]
    fn primary_image() {
        let h = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(-32)),
            ("NAXIS", Value::Integer(2)),
            ("NAXIS1", Value::Integer(100)),
            ("NAXIS2", Value::Integer(50)),
        ]);
        let shape = DataShape::from_header(&h).unwrap();
        assert_eq!(shape.kind, UnitKind::Primary);
        assert_eq!(shape.axes, vec![100, 50]);
        assert_eq!(shape.byte_len(), 100 * 50 * 4);
        assert_eq!(shape.element_count(), 5000);
    }

    #[test]
    fn empty_primary() {
        let h = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(8)),
            ("NAXIS", Value::Integer(0)),
        ]);
        let shape = DataShape::from_header(&h).unwrap();
        assert_eq!(shape.byte_len(), 0);
        assert_eq!(shape.element_count(), 0);
    }

    #[test]
    fn random_groups() {
        let h = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(16)),
            ("NAXIS", Value::Integer(3)),
            ("NAXIS1", Value::Integer(0)),
            ("NAXIS2", Value::Integer(3)),
            ("NAXIS3", Value::Integer(4)),
            ("GROUPS", Value::Logical(true)),
            ("PCOUNT", Value::Integer(2)),
            ("GCOUNT", Value::Integer(5)),
        ]);
        let shape = DataShape::from_header(&h).unwrap();
        assert_eq!(shape.kind, UnitKind::RandomGroups);
        assert_eq!(shape.byte_len(), 2 * 5 * (2 + 12));
    }

    #[test]
    fn image_extension_with_gcount() {
        let h = header(&[
            ("XTENSION", Value::from("IMAGE")),
            ("BITPIX", Value::Integer(64)),
            ("NAXIS", Value::Integer(1)),
            ("NAXIS1", Value::Integer(10)),
            ("PCOUNT", Value::Integer(0)),
            ("GCOUNT", Value::Integer(1)),
        ]);
        let shape = DataShape::from_header(&h).unwrap();
        assert_eq!(shape.kind, UnitKind::Image);
        assert_eq!(shape.byte_len(), 80);
        assert_eq!(shape.pad_kind(), PadKind::Binary);
    }

    // --- tables ---

    #[test]
    fn binary_table_with_heap() {
        let h = header(&[
            ("XTENSION", Value::from("BINTABLE")),
            ("BITPIX", Value::Integer(8)),
            ("NAXIS", Value::Integer(2)),
            ("NAXIS1", Value::Integer(12)),
            ("NAXIS2", Value::Integer(7)),
            ("PCOUNT", Value::Integer(100)),
            ("GCOUNT", Value::Integer(1)),
        ]);
        let shape = DataShape::from_header(&h).unwrap();
        assert_eq!(shape.kind, UnitKind::Table(TableKind::Binary));
        assert_eq!(shape.byte_len(), 84 + 100);
        assert_eq!(shape.row_width(), Some(12));
        assert_eq!(shape.nrows(), Some(7));
        assert_eq!(shape.heap_len(), 100);
    }

    #[test]
    fn ascii_table_pads_with_spaces() {
        let h = header(&[
            ("XTENSION", Value::from("TABLE")),
            ("BITPIX", Value::Integer(8)),
            ("NAXIS", Value::Integer(2)),
            ("NAXIS1", Value::Integer(20)),
            ("NAXIS2", Value::Integer(3)),
        ]);
        let shape = DataShape::from_header(&h).unwrap();
        assert_eq!(shape.pad_kind(), PadKind::AsciiTable);
        assert_eq!(shape.byte_len(), 60);
    }

    // --- errors ---

    #[test]
    fn missing_and_invalid_keywords() {
        let no_naxis = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(8)),
        ]);
        assert!(matches!(
            DataShape::from_header(&no_naxis),
            Err(Error::MissingKeyword("NAXIS"))
        ));

        let bad_bitpix = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(12)),
            ("NAXIS", Value::Integer(0)),
        ]);
        assert!(matches!(
            DataShape::from_header(&bad_bitpix),
            Err(Error::InvalidShape(_))
        ));

        let negative = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(8)),
            ("NAXIS", Value::Integer(1)),
            ("NAXIS1", Value::Integer(-4)),
        ]);
        assert!(matches!(
            DataShape::from_header(&negative),
            Err(Error::InvalidShape(_))
        ));

        let no_xtension = header(&[("BITPIX", Value::Integer(8)), ("NAXIS", Value::Integer(0))]);
        assert!(matches!(
            DataShape::from_header(&no_xtension),
            Err(Error::MissingKeyword("XTENSION"))
        ));
    }

    #[test]
    fn size_overflow() {
        let h = header(&[
            ("SIMPLE", Value::Logical(true)),
            ("BITPIX", Value::Integer(64)),
            ("NAXIS", Value::Integer(3)),
            ("NAXIS1", Value::Integer(i64::MAX)),
            ("NAXIS2", Value::Integer(i64::MAX)),
            ("NAXIS3", Value::Integer(2)),
        ]);
        assert!(matches!(
            DataShape::from_header(&h),
            Err(Error::InvalidShape(_))
        ));
    }
}
