//! Column format descriptors (`TFORMn`) and the table data layout they imply.
//!
//! A binary-table format is `rTa`: repeat count, type code, option. Fixed
//! types map to big-endian native elements, `X` to packed bits, and `P`/`Q`
//! to a per-row `(count, offset)` descriptor into the heap that follows the
//! rows. ASCII tables use `Aw`, `Iw`, `Fw.d`, `Ew.d` and `Dw.d` fields placed
//! at 1-based `TBCOLn` columns.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::OnceCell;

use tracing::trace;

use crate::card::Card;
use crate::config::Config;
use crate::endian::{from_be_bytes_vec, read_be, to_be_bytes_vec, write_be};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::value::Value;

// --- Format grammar ---

/// `TFORMn` split into its three parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCode {
    pub repeat: usize,
    /// Upper-cased type letter.
    pub code: char,
    pub option: String,
}

/// Parse `^\d*[A-Za-z][!-~]*$`. An absent repeat count is 1.
pub fn parse_format(text: &str) -> Result<FormatCode> {
    let s = text.trim();
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    let rest = &s[digits..];
    let code = match rest.bytes().next() {
        Some(b) if b.is_ascii_alphabetic() => b.to_ascii_uppercase() as char,
        _ => return Err(Error::UnsupportedFormatCode(text.to_string())),
    };
    let option = &rest[1..];
    if !option.bytes().all(|b| (b'!'..=b'~').contains(&b)) {
        return Err(Error::UnsupportedFormatCode(text.to_string()));
    }
    let repeat = if digits == 0 {
        1
    } else {
        s[..digits]
            .parse::<usize>()
            .map_err(|_| Error::UnsupportedFormatCode(text.to_string()))?
    };
    Ok(FormatCode {
        repeat,
        code,
        option: option.to_string(),
    })
}

/// Native element of a column cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// `L`: one byte, `T` or `F`.
    Logical,
    /// `X`: bits packed MSB-first.
    Bit,
    /// `B`
    U8,
    /// `I`
    I16,
    /// `J`
    I32,
    /// `K`
    I64,
    /// `E`
    F32,
    /// `D`
    F64,
    /// `C`: pair of `f32`.
    C64,
    /// `M`: pair of `f64`.
    C128,
    /// `A`
    Char,
}

impl ElementType {
    pub fn from_code(code: char) -> Option<ElementType> {
        Some(match code {
            'L' => ElementType::Logical,
            'X' => ElementType::Bit,
            'B' => ElementType::U8,
            'I' => ElementType::I16,
            'J' => ElementType::I32,
            'K' => ElementType::I64,
            'E' => ElementType::F32,
            'D' => ElementType::F64,
            'C' => ElementType::C64,
            'M' => ElementType::C128,
            'A' => ElementType::Char,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            ElementType::Logical => 'L',
            ElementType::Bit => 'X',
            ElementType::U8 => 'B',
            ElementType::I16 => 'I',
            ElementType::I32 => 'J',
            ElementType::I64 => 'K',
            ElementType::F32 => 'E',
            ElementType::F64 => 'D',
            ElementType::C64 => 'C',
            ElementType::C128 => 'M',
            ElementType::Char => 'A',
        }
    }

    /// Bytes per element. Bits are counted separately.
    pub fn size(self) -> usize {
        match self {
            ElementType::Logical | ElementType::Bit | ElementType::U8 | ElementType::Char => 1,
            ElementType::I16 => 2,
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 | ElementType::C64 => 8,
            ElementType::C128 => 16,
        }
    }
}

/// Variable-length array descriptor flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarArray {
    /// `Q` (two 64-bit words) rather than `P` (two 32-bit words).
    pub wide: bool,
    /// The `(max)` hint, when present.
    pub max_len: Option<usize>,
}

impl VarArray {
    pub fn descriptor_size(self) -> usize {
        if self.wide {
            16
        } else {
            8
        }
    }
}

/// Native encoding of one binary-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFormat {
    pub repeat: usize,
    pub elem: ElementType,
    pub var: Option<VarArray>,
}

impl BinaryFormat {
    /// Bytes the column occupies in each row.
    pub fn width(&self) -> usize {
        match (self.var, self.elem) {
            (Some(var), _) => self.repeat * var.descriptor_size(),
            (None, ElementType::Bit) => self.repeat.div_ceil(8),
            (None, elem) => self.repeat * elem.size(),
        }
    }

    pub fn tform(&self) -> String {
        match self.var {
            Some(var) => {
                let letter = if var.wide { 'Q' } else { 'P' };
                let max = var.max_len.map(|m| format!("({m})")).unwrap_or_default();
                format!("{}{letter}{}{max}", self.repeat, self.elem.code())
            }
            None => format!("{}{}", self.repeat, self.elem.code()),
        }
    }
}

/// Map a parsed binary-table format onto its native encoding.
pub fn to_native(format: &FormatCode) -> Result<BinaryFormat> {
    let unsupported = || {
        Error::UnsupportedFormatCode(format!("{}{}{}", format.repeat, format.code, format.option))
    };
    if let Some(elem) = ElementType::from_code(format.code) {
        return Ok(BinaryFormat {
            repeat: format.repeat,
            elem,
            var: None,
        });
    }
    if format.code != 'P' && format.code != 'Q' {
        return Err(unsupported());
    }
    // A row holds at most one array descriptor per column.
    if format.repeat > 1 {
        return Err(unsupported());
    }
    let mut chars = format.option.chars();
    let elem = chars
        .next()
        .map(|c| c.to_ascii_uppercase())
        .and_then(ElementType::from_code)
        .filter(|e| *e != ElementType::Bit)
        .ok_or_else(unsupported)?;
    let tail = chars.as_str();
    let max_len = if tail.is_empty() {
        None
    } else {
        let inner = tail
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(unsupported)?;
        Some(inner.parse::<usize>().map_err(|_| unsupported())?)
    };
    Ok(BinaryFormat {
        repeat: format.repeat,
        elem,
        var: Some(VarArray {
            wide: format.code == 'Q',
            max_len,
        }),
    })
}

/// An ASCII-table field format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiFormat {
    Char { width: usize },
    Int { width: usize },
    Fixed { width: usize, decimals: usize },
    Exp { width: usize, decimals: usize },
    /// `D` exponent marker.
    ExpD { width: usize, decimals: usize },
}

impl AsciiFormat {
    /// Parse `Aw`, `Iw`, `Fw.d`, `Ew.d` or `Dw.d`; a missing width takes the
    /// default (`A1`, `I10`, `F16.7`, `E14.6`, `D24.16`).
    pub fn parse(text: &str) -> Result<AsciiFormat> {
        let unsupported = || Error::UnsupportedFormatCode(text.to_string());
        let s = text.trim();
        let code = s
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .ok_or_else(unsupported)?;
        let rest = &s[code.len_utf8()..];
        let (width, decimals) = if rest.is_empty() {
            match code {
                'A' => (1, 0),
                'I' => (10, 0),
                'F' => (16, 7),
                'E' => (14, 6),
                'D' => (24, 16),
                _ => return Err(unsupported()),
            }
        } else {
            let (w, d) = match rest.split_once('.') {
                Some((w, d)) => (w, Some(d)),
                None => (rest, None),
            };
            let width = w.parse::<usize>().map_err(|_| unsupported())?;
            let decimals = match d {
                Some(d) => d.parse::<usize>().map_err(|_| unsupported())?,
                None => 0,
            };
            (width, decimals)
        };
        if width == 0 {
            return Err(unsupported());
        }
        Ok(match code {
            'A' => AsciiFormat::Char { width },
            'I' => AsciiFormat::Int { width },
            'F' => AsciiFormat::Fixed { width, decimals },
            'E' => AsciiFormat::Exp { width, decimals },
            'D' => AsciiFormat::ExpD { width, decimals },
            _ => return Err(unsupported()),
        })
    }

    pub fn width(&self) -> usize {
        match *self {
            AsciiFormat::Char { width }
            | AsciiFormat::Int { width }
            | AsciiFormat::Fixed { width, .. }
            | AsciiFormat::Exp { width, .. }
            | AsciiFormat::ExpD { width, .. } => width,
        }
    }

    /// Native element the field decodes to.
    pub fn elem(&self) -> ElementType {
        match self {
            AsciiFormat::Char { .. } => ElementType::Char,
            AsciiFormat::Int { .. } => ElementType::I32,
            AsciiFormat::Fixed { .. } | AsciiFormat::Exp { .. } => ElementType::F32,
            AsciiFormat::ExpD { .. } => ElementType::F64,
        }
    }

    pub fn tform(&self) -> String {
        match *self {
            AsciiFormat::Char { width } => format!("A{width}"),
            AsciiFormat::Int { width } => format!("I{width}"),
            AsciiFormat::Fixed { width, decimals } => format!("F{width}.{decimals}"),
            AsciiFormat::Exp { width, decimals } => format!("E{width}.{decimals}"),
            AsciiFormat::ExpD { width, decimals } => format!("D{width}.{decimals}"),
        }
    }

    /// Render one value right-justified (strings left-justified) to exactly
    /// the field width.
    fn render(&self, data: &ColumnData, row: usize) -> Result<String> {
        let text = match (*self, data) {
            (AsciiFormat::Char { .. }, ColumnData::Text(v)) => v[row].clone(),
            (AsciiFormat::Int { .. }, ColumnData::I32(v)) => v[row].to_string(),
            (AsciiFormat::Fixed { decimals, .. }, ColumnData::F32(v)) => {
                format!("{:.*}", decimals, v[row])
            }
            (AsciiFormat::Exp { decimals, .. }, ColumnData::F32(v)) => {
                format_exp(f64::from(v[row]), decimals, 'E')
            }
            (AsciiFormat::ExpD { decimals, .. }, ColumnData::F64(v)) => {
                format_exp(v[row], decimals, 'D')
            }
            _ => return Err(mismatch(&self.tform(), data)),
        };
        let width = self.width();
        if text.len() > width || !text.is_ascii() {
            return Err(Error::SchemaMismatch(format!(
                "{text:?} does not fit format {}",
                self.tform()
            )));
        }
        Ok(match self {
            AsciiFormat::Char { .. } => format!("{text:<width$}"),
            _ => format!("{text:>width$}"),
        })
    }

    /// Parse one field. Blank numeric fields read as zero (integers) or NaN.
    fn read(&self, field: &str) -> Result<Scalar> {
        let bad = || Error::SchemaMismatch(format!("{field:?} is not valid {}", self.tform()));
        let trimmed = field.trim();
        Ok(match self {
            AsciiFormat::Char { .. } => Scalar::Text(field.trim_end().to_string()),
            AsciiFormat::Int { .. } if trimmed.is_empty() => Scalar::I32(0),
            AsciiFormat::Int { .. } => Scalar::I32(trimmed.parse().map_err(|_| bad())?),
            _ if trimmed.is_empty() => Scalar::Float(f64::NAN),
            _ => {
                let normal = trimmed.replace(['D', 'd'], "E");
                Scalar::Float(normal.parse().map_err(|_| bad())?)
            }
        })
    }
}

enum Scalar {
    Text(String),
    I32(i32),
    Float(f64),
}

/// `%.{d}E` with a signed exponent of at least two digits.
fn format_exp(v: f64, decimals: usize, marker: char) -> String {
    if !v.is_finite() {
        return format!("{v}");
    }
    let s = format!("{:.*E}", decimals, v);
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{mantissa}{marker}{sign}{digits:0>2}")
        }
        None => s,
    }
}

/// Either dialect of a column format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFormat {
    Binary(BinaryFormat),
    Ascii(AsciiFormat),
}

impl ColumnFormat {
    pub fn parse(text: &str, kind: TableKind) -> Result<ColumnFormat> {
        match kind {
            TableKind::Binary => Ok(ColumnFormat::Binary(to_native(&parse_format(text)?)?)),
            TableKind::Ascii => Ok(ColumnFormat::Ascii(AsciiFormat::parse(text)?)),
        }
    }

    pub fn width(&self) -> usize {
        match self {
            ColumnFormat::Binary(f) => f.width(),
            ColumnFormat::Ascii(f) => f.width(),
        }
    }

    pub fn tform(&self) -> String {
        match self {
            ColumnFormat::Binary(f) => f.tform(),
            ColumnFormat::Ascii(f) => f.tform(),
        }
    }

    pub fn kind(&self) -> TableKind {
        match self {
            ColumnFormat::Binary(_) => TableKind::Binary,
            ColumnFormat::Ascii(_) => TableKind::Ascii,
        }
    }
}

/// Table dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// `XTENSION = 'BINTABLE'`
    Binary,
    /// `XTENSION = 'TABLE'`
    Ascii,
}

impl TableKind {
    pub fn from_xtension(xtension: &str) -> Option<TableKind> {
        match xtension.trim_end() {
            "BINTABLE" | "A3DTABLE" => Some(TableKind::Binary),
            "TABLE" => Some(TableKind::Ascii),
            _ => None,
        }
    }

    pub fn xtension(self) -> &'static str {
        match self {
            TableKind::Binary => "BINTABLE",
            TableKind::Ascii => "TABLE",
        }
    }
}

// --- Bits and heap ---

/// Pack booleans MSB-first; unused low bits of the last byte are zero.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (j, &bit) in bits.iter().enumerate() {
        if bit {
            out[j / 8] |= 0x80 >> (j % 8);
        }
    }
    out
}

/// Unpack the first `n` bits of `bytes`, MSB-first.
pub fn unpack_bits(bytes: &[u8], n: usize) -> Result<Vec<bool>> {
    if bytes.len() < n.div_ceil(8) {
        return Err(Error::TruncatedInput);
    }
    Ok((0..n).map(|j| bytes[j / 8] & (0x80 >> (j % 8)) != 0).collect())
}

/// Heap offsets for rows of `counts` elements of `elem_size` bytes, assigned
/// left to right from `base`. Also returns the offset one past the last row.
pub fn heap_offsets(counts: &[usize], elem_size: usize, base: usize) -> (Vec<usize>, usize) {
    let mut next = base;
    let offsets = counts
        .iter()
        .map(|&count| {
            let here = next;
            next += count * elem_size;
            here
        })
        .collect();
    (offsets, next)
}

/// A field's placement in an ASCII-table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// 1-based first column (`TBCOLn`).
    pub start: usize,
    pub width: usize,
}

impl Span {
    /// 1-based last column.
    pub fn end(&self) -> usize {
        self.start + self.width - 1
    }
}

/// Place fields of `(width, start)`; an unset start follows the previous field.
pub fn ascii_spans<I>(fields: I) -> Vec<Span>
where
    I: IntoIterator<Item = (usize, Option<usize>)>,
{
    let mut next = 1;
    fields
        .into_iter()
        .map(|(width, start)| {
            let span = Span {
                start: start.unwrap_or(next),
                width,
            };
            next = span.start + width;
            span
        })
        .collect()
}

// --- Column data ---

/// Typed values of one column for all rows.
///
/// Fixed-size columns are flattened, `repeat` elements per row. `Text` holds
/// one string per row. `VarLen` holds one array per row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Logical(Vec<bool>),
    Bits(Vec<bool>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    C64(Vec<(f32, f32)>),
    C128(Vec<(f64, f64)>),
    Text(Vec<String>),
    VarLen(Vec<ColumnData>),
}

impl ColumnData {
    /// Number of values (strings for `Text`, rows for `VarLen`).
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Logical(v) | ColumnData::Bits(v) => v.len(),
            ColumnData::U8(v) => v.len(),
            ColumnData::I16(v) => v.len(),
            ColumnData::I32(v) => v.len(),
            ColumnData::I64(v) => v.len(),
            ColumnData::F32(v) => v.len(),
            ColumnData::F64(v) => v.len(),
            ColumnData::C64(v) => v.len(),
            ColumnData::C128(v) => v.len(),
            ColumnData::Text(v) => v.len(),
            ColumnData::VarLen(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnData::Logical(_) => "logical",
            ColumnData::Bits(_) => "bits",
            ColumnData::U8(_) => "u8",
            ColumnData::I16(_) => "i16",
            ColumnData::I32(_) => "i32",
            ColumnData::I64(_) => "i64",
            ColumnData::F32(_) => "f32",
            ColumnData::F64(_) => "f64",
            ColumnData::C64(_) => "complex f32",
            ColumnData::C128(_) => "complex f64",
            ColumnData::Text(_) => "text",
            ColumnData::VarLen(_) => "variable-length",
        }
    }

    fn holds(&self, elem: ElementType) -> bool {
        matches!(
            (self, elem),
            (ColumnData::Logical(_), ElementType::Logical)
                | (ColumnData::Bits(_), ElementType::Bit)
                | (ColumnData::U8(_), ElementType::U8)
                | (ColumnData::I16(_), ElementType::I16)
                | (ColumnData::I32(_), ElementType::I32)
                | (ColumnData::I64(_), ElementType::I64)
                | (ColumnData::F32(_), ElementType::F32)
                | (ColumnData::F64(_), ElementType::F64)
                | (ColumnData::C64(_), ElementType::C64)
                | (ColumnData::C128(_), ElementType::C128)
                | (ColumnData::Text(_), ElementType::Char)
        )
    }

    /// Heap element count of a variable-length cell.
    fn heap_count(&self) -> usize {
        match self {
            ColumnData::Text(v) => v.first().map_or(0, String::len),
            other => other.len(),
        }
    }
}

fn mismatch(format: &str, data: &ColumnData) -> Error {
    Error::SchemaMismatch(format!(
        "{} data does not match format {format}",
        data.type_name()
    ))
}

/// Big-endian bytes of `count` elements starting at `from`.
fn encode_elements(data: &ColumnData, from: usize, count: usize) -> Vec<u8> {
    let range = from..from + count;
    match data {
        ColumnData::Logical(v) => v[range]
            .iter()
            .map(|&b| if b { b'T' } else { b'F' })
            .collect(),
        ColumnData::Bits(v) => pack_bits(&v[range]),
        ColumnData::U8(v) => v[range].to_vec(),
        ColumnData::I16(v) => to_be_bytes_vec(&v[range]),
        ColumnData::I32(v) => to_be_bytes_vec(&v[range]),
        ColumnData::I64(v) => to_be_bytes_vec(&v[range]),
        ColumnData::F32(v) => to_be_bytes_vec(&v[range]),
        ColumnData::F64(v) => to_be_bytes_vec(&v[range]),
        ColumnData::C64(v) => {
            let flat: Vec<f32> = v[range].iter().flat_map(|&(re, im)| [re, im]).collect();
            to_be_bytes_vec(&flat)
        }
        ColumnData::C128(v) => {
            let flat: Vec<f64> = v[range].iter().flat_map(|&(re, im)| [re, im]).collect();
            to_be_bytes_vec(&flat)
        }
        ColumnData::Text(v) => v.first().map(|s| s.as_bytes().to_vec()).unwrap_or_default(),
        ColumnData::VarLen(_) => Vec::new(),
    }
}

fn text_from(bytes: &[u8]) -> Result<String> {
    core::str::from_utf8(bytes)
        .map(|s| s.trim_end_matches([' ', '\0']).to_string())
        .map_err(|_| Error::SchemaMismatch("character field is not ASCII".to_string()))
}

/// Decode a run of big-endian elements.
fn decode_elements(elem: ElementType, bytes: &[u8]) -> Result<ColumnData> {
    Ok(match elem {
        ElementType::Logical => ColumnData::Logical(bytes.iter().map(|&b| b == b'T').collect()),
        ElementType::Bit => ColumnData::Bits(unpack_bits(bytes, bytes.len() * 8)?),
        ElementType::U8 => ColumnData::U8(bytes.to_vec()),
        ElementType::I16 => ColumnData::I16(from_be_bytes_vec(bytes)?),
        ElementType::I32 => ColumnData::I32(from_be_bytes_vec(bytes)?),
        ElementType::I64 => ColumnData::I64(from_be_bytes_vec(bytes)?),
        ElementType::F32 => ColumnData::F32(from_be_bytes_vec(bytes)?),
        ElementType::F64 => ColumnData::F64(from_be_bytes_vec(bytes)?),
        ElementType::C64 => {
            let flat: Vec<f32> = from_be_bytes_vec(bytes)?;
            ColumnData::C64(flat.chunks_exact(2).map(|p| (p[0], p[1])).collect())
        }
        ElementType::C128 => {
            let flat: Vec<f64> = from_be_bytes_vec(bytes)?;
            ColumnData::C128(flat.chunks_exact(2).map(|p| (p[0], p[1])).collect())
        }
        ElementType::Char => ColumnData::Text(vec![text_from(bytes)?]),
    })
}

// --- Column descriptor ---

/// One column of a table schema.
///
/// The format is fixed at construction; name and unit change only through
/// [`ColumnSet`] so that its cached layout stays valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    format: ColumnFormat,
    unit: Option<String>,
    null: Option<Value>,
    bscale: Option<f64>,
    bzero: Option<f64>,
    disp: Option<String>,
    start: Option<usize>,
    dim: Option<String>,
}

impl Column {
    /// A column named `name` (empty for none) with a `TFORMn` of `kind`'s dialect.
    pub fn new(name: &str, format: &str, kind: TableKind) -> Result<Column> {
        Ok(Column {
            name: name.to_string(),
            format: ColumnFormat::parse(format, kind)?,
            unit: None,
            null: None,
            bscale: None,
            bzero: None,
            disp: None,
            start: None,
            dim: None,
        })
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_null(mut self, null: impl Into<Value>) -> Self {
        self.null = Some(null.into());
        self
    }

    pub fn with_scale(mut self, bscale: f64, bzero: f64) -> Self {
        self.bscale = Some(bscale);
        self.bzero = Some(bzero);
        self
    }

    pub fn with_disp(mut self, disp: &str) -> Self {
        self.disp = Some(disp.to_string());
        self
    }

    /// 1-based starting column in an ASCII-table row.
    pub fn with_start(mut self, start: usize) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_dim(mut self, dim: &str) -> Self {
        self.dim = Some(dim.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &ColumnFormat {
        &self.format
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn null(&self) -> Option<&Value> {
        self.null.as_ref()
    }

    pub fn bscale(&self) -> Option<f64> {
        self.bscale
    }

    pub fn bzero(&self) -> Option<f64> {
        self.bzero
    }

    pub fn disp(&self) -> Option<&str> {
        self.disp.as_deref()
    }

    pub fn start(&self) -> Option<usize> {
        self.start
    }

    pub fn dim(&self) -> Option<&str> {
        self.dim.as_deref()
    }

    /// `TDIMn` as sizes, fastest-varying first. Fails if malformed or larger
    /// than the repeat count.
    pub fn dims(&self) -> Result<Option<Vec<usize>>> {
        let Some(dim) = self.dim.as_deref() else {
            return Ok(None);
        };
        let bad = || Error::SchemaMismatch(format!("malformed TDIM {dim:?}"));
        let inner = dim
            .trim()
            .strip_prefix('(')
            .and_then(|d| d.strip_suffix(')'))
            .ok_or_else(bad)?;
        let dims = inner
            .split(',')
            .map(|d| d.trim().parse::<usize>().map_err(|_| bad()))
            .collect::<Result<Vec<_>>>()?;
        let product = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(bad)?;
        if let ColumnFormat::Binary(f) = self.format {
            if f.var.is_none() && product > f.repeat {
                return Err(Error::SchemaMismatch(format!(
                    "TDIM {dim} exceeds repeat count {}",
                    f.repeat
                )));
            }
        }
        Ok(Some(dims))
    }
}

// --- Schema ---

#[derive(Debug, Clone)]
struct Layout {
    /// 0-based byte offset of each field in a row.
    offsets: Vec<usize>,
    widths: Vec<usize>,
    row_width: usize,
}

/// A table schema: ordered columns plus their derived row layout.
///
/// The layout is computed on first use and dropped by every schema mutation.
#[derive(Debug, Clone)]
pub struct ColumnSet {
    kind: TableKind,
    columns: Vec<Column>,
    /// `NAXIS1` read from a header; ASCII rows may be wider than their fields.
    declared_width: usize,
    layout: OnceCell<Layout>,
}

/// Encoded table payload: fixed-size rows, then the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBytes {
    pub nrows: usize,
    pub rows: Vec<u8>,
    pub heap: Vec<u8>,
}

fn column_key(prefix: &str, n: usize) -> String {
    format!("{prefix}{n}")
}

impl ColumnSet {
    pub fn new(kind: TableKind) -> Self {
        ColumnSet {
            kind,
            columns: Vec::new(),
            declared_width: 0,
            layout: OnceCell::new(),
        }
    }

    pub fn from_columns(kind: TableKind, columns: Vec<Column>) -> Result<Self> {
        let mut set = ColumnSet::new(kind);
        for column in columns {
            set.add_column(column)?;
        }
        Ok(set)
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Drop everything derived from the current schema, including a row
    /// width carried over from a header.
    fn invalidate(&mut self) {
        self.layout = OnceCell::new();
        self.declared_width = 0;
    }

    fn layout(&self) -> &Layout {
        self.layout.get_or_init(|| {
            let widths: Vec<usize> = self.columns.iter().map(|c| c.format.width()).collect();
            let (offsets, fields_end) = match self.kind {
                TableKind::Binary => {
                    let mut next = 0;
                    let offsets = widths
                        .iter()
                        .map(|&w| {
                            let here = next;
                            next += w;
                            here
                        })
                        .collect();
                    (offsets, next)
                }
                TableKind::Ascii => {
                    let spans = ascii_spans(self.columns.iter().map(|c| (c.format.width(), c.start)));
                    let end = spans.iter().map(Span::end).max().unwrap_or(0);
                    (spans.iter().map(|s| s.start - 1).collect(), end)
                }
            };
            let row_width = fields_end.max(self.declared_width);
            trace!(columns = widths.len(), row_width, "recomputed table layout");
            Layout {
                offsets,
                widths,
                row_width,
            }
        })
    }

    /// Bytes per row (`NAXIS1`).
    pub fn row_width(&self) -> usize {
        self.layout().row_width
    }

    /// 0-based byte offset of each column within a row.
    pub fn offsets(&self) -> &[usize] {
        &self.layout().offsets
    }

    /// ASCII field placements; empty for binary tables.
    pub fn spans(&self) -> Vec<Span> {
        match self.kind {
            TableKind::Binary => Vec::new(),
            TableKind::Ascii => {
                let layout = self.layout();
                layout
                    .offsets
                    .iter()
                    .zip(&layout.widths)
                    .map(|(&o, &width)| Span {
                        start: o + 1,
                        width,
                    })
                    .collect()
            }
        }
    }

    // --- Lookup and mutation ---

    /// Column index by name: an exact match wins, otherwise a unique
    /// case-insensitive match unless names are configured case-sensitive.
    pub fn lookup(&self, name: &str, config: &Config) -> Result<usize> {
        if let Some(i) = self.columns.iter().position(|c| c.name == name) {
            return Ok(i);
        }
        if !config.case_sensitive_names {
            let mut hits = self
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name.eq_ignore_ascii_case(name))
                .map(|(i, _)| i);
            match (hits.next(), hits.next()) {
                (Some(i), None) => return Ok(i),
                (Some(_), Some(_)) => return Err(Error::AmbiguousKey(name.to_string())),
                _ => {}
            }
        }
        Err(Error::KeyNotFound(name.to_string()))
    }

    pub fn add_column(&mut self, column: Column) -> Result<()> {
        if column.format.kind() != self.kind {
            return Err(Error::SchemaMismatch(format!(
                "{} column in a {} table",
                column.format.tform(),
                self.kind.xtension()
            )));
        }
        if self.kind == TableKind::Binary && column.start.is_some() {
            return Err(Error::SchemaMismatch(
                "TBCOL applies to ASCII tables only".to_string(),
            ));
        }
        if column.start == Some(0) {
            return Err(Error::SchemaMismatch(format!(
                "column {} starts at 0; TBCOL is 1-based",
                column.name
            )));
        }
        if self.kind == TableKind::Ascii {
            let mut spans = ascii_spans(
                self.columns
                    .iter()
                    .chain(core::iter::once(&column))
                    .map(|c| (c.format.width(), c.start)),
            );
            spans.sort_by_key(|s| s.start);
            if spans.windows(2).any(|w| w[1].start <= w[0].end()) {
                return Err(Error::SchemaMismatch(format!(
                    "column {} overlaps another field",
                    column.name
                )));
            }
        }
        self.columns.push(column);
        self.invalidate();
        Ok(())
    }

    pub fn delete_column(&mut self, name: &str, config: &Config) -> Result<Column> {
        let i = self.lookup(name, config)?;
        let column = self.columns.remove(i);
        self.invalidate();
        Ok(column)
    }

    pub fn rename_column(&mut self, old: &str, new: &str, config: &Config) -> Result<()> {
        let i = self.lookup(old, config)?;
        if self
            .columns
            .iter()
            .enumerate()
            .any(|(j, c)| j != i && c.name == new)
        {
            return Err(Error::DuplicateKey(new.to_string()));
        }
        self.columns[i].name = new.to_string();
        self.invalidate();
        Ok(())
    }

    pub fn change_unit(&mut self, name: &str, unit: Option<&str>, config: &Config) -> Result<()> {
        let i = self.lookup(name, config)?;
        self.columns[i].unit = unit.map(str::to_string);
        self.invalidate();
        Ok(())
    }

    // --- Header keywords ---

    /// Read `TFIELDS` and the per-column keywords.
    pub fn from_header(header: &Header, kind: TableKind) -> Result<ColumnSet> {
        let tfields = header
            .get_int("TFIELDS")
            .ok_or(Error::MissingKeyword("TFIELDS"))?;
        let tfields = usize::try_from(tfields)
            .map_err(|_| Error::InvalidShape("TFIELDS is negative"))?;
        let mut set = ColumnSet::new(kind);
        for n in 1..=tfields {
            let tform = header
                .get_str(&column_key("TFORM", n))
                .ok_or(Error::MissingKeyword("TFORMn"))?;
            let name = header.get_str(&column_key("TTYPE", n)).unwrap_or("");
            let mut column = Column::new(name.trim_end(), tform, kind)?;
            column.unit = header.get_str(&column_key("TUNIT", n)).map(str::to_string);
            column.null = header.get(&column_key("TNULL", n)).and_then(|c| c.value().ok()).cloned();
            column.bscale = header.get_float(&column_key("TSCAL", n));
            column.bzero = header.get_float(&column_key("TZERO", n));
            column.disp = header.get_str(&column_key("TDISP", n)).map(str::to_string);
            column.dim = header.get_str(&column_key("TDIM", n)).map(str::to_string);
            if kind == TableKind::Ascii {
                let tbcol = header
                    .get_int(&column_key("TBCOL", n))
                    .ok_or(Error::MissingKeyword("TBCOLn"))?;
                column.start = Some(
                    usize::try_from(tbcol).map_err(|_| Error::InvalidShape("TBCOL is negative"))?,
                );
            }
            set.add_column(column)?;
        }

        if let Some(naxis1) = header.get_int("NAXIS1") {
            let naxis1 =
                usize::try_from(naxis1).map_err(|_| Error::InvalidShape("NAXIS1 is negative"))?;
            let fields = set.row_width();
            let fits = match kind {
                TableKind::Binary => naxis1 == fields,
                TableKind::Ascii => naxis1 >= fields,
            };
            if !fits {
                return Err(Error::SchemaMismatch(format!(
                    "NAXIS1 = {naxis1} but the columns need {fields} bytes"
                )));
            }
            set.invalidate();
            set.declared_width = naxis1;
        }
        Ok(set)
    }

    /// `TFIELDS` and the per-column keyword cards.
    pub fn to_cards(&self) -> Result<Vec<Card>> {
        let mut cards = vec![Card::new("TFIELDS", self.columns.len() as i64, None)?];
        let spans = self.spans();
        for (i, column) in self.columns.iter().enumerate() {
            let n = i + 1;
            if !column.name.is_empty() {
                cards.push(Card::new(&column_key("TTYPE", n), column.name.as_str(), None)?);
            }
            cards.push(Card::new(
                &column_key("TFORM", n),
                column.format.tform().as_str(),
                None,
            )?);
            if let Some(unit) = &column.unit {
                cards.push(Card::new(&column_key("TUNIT", n), unit.as_str(), None)?);
            }
            if let Some(null) = &column.null {
                cards.push(Card::new(&column_key("TNULL", n), null.clone(), None)?);
            }
            if let Some(bscale) = column.bscale {
                cards.push(Card::new(&column_key("TSCAL", n), bscale, None)?);
            }
            if let Some(bzero) = column.bzero {
                cards.push(Card::new(&column_key("TZERO", n), bzero, None)?);
            }
            if let Some(disp) = &column.disp {
                cards.push(Card::new(&column_key("TDISP", n), disp.as_str(), None)?);
            }
            if let Some(span) = spans.get(i) {
                cards.push(Card::new(&column_key("TBCOL", n), span.start as i64, None)?);
            }
            if let Some(dim) = &column.dim {
                cards.push(Card::new(&column_key("TDIM", n), dim.as_str(), None)?);
            }
        }
        Ok(cards)
    }

    /// A complete extension header for `nrows` rows and a heap of `heap_len` bytes.
    pub fn table_header(&self, nrows: usize, heap_len: usize) -> Result<Header> {
        let mut cards = vec![
            Card::new("XTENSION", self.kind.xtension(), None)?,
            Card::new("BITPIX", 8i64, None)?,
            Card::new("NAXIS", 2i64, None)?,
            Card::new("NAXIS1", self.row_width() as i64, None)?,
            Card::new("NAXIS2", nrows as i64, None)?,
            Card::new("PCOUNT", heap_len as i64, None)?,
            Card::new("GCOUNT", 1i64, None)?,
        ];
        cards.extend(self.to_cards()?);
        Header::from_cards(cards)
    }

    // --- Data ---

    /// Rows implied by each column's data; all must agree.
    fn row_count(&self, data: &[ColumnData]) -> Result<usize> {
        if data.len() != self.columns.len() {
            return Err(Error::SchemaMismatch(format!(
                "{} data arrays for {} columns",
                data.len(),
                self.columns.len()
            )));
        }
        let mut rows: Option<usize> = None;
        for (column, d) in self.columns.iter().zip(data) {
            let tform = column.format.tform();
            let these = match column.format {
                ColumnFormat::Ascii(f) => {
                    if !d.holds(f.elem()) {
                        return Err(mismatch(&tform, d));
                    }
                    Some(d.len())
                }
                ColumnFormat::Binary(f) => match (f.var, d) {
                    (Some(_), ColumnData::VarLen(cells)) => {
                        if let Some(bad) = cells.iter().find(|c| !c.holds(f.elem)) {
                            return Err(mismatch(&tform, bad));
                        }
                        Some(cells.len())
                    }
                    (Some(_), _) => return Err(mismatch(&tform, d)),
                    (None, _) if !d.holds(f.elem) => return Err(mismatch(&tform, d)),
                    (None, ColumnData::Text(v)) => Some(v.len()),
                    (None, _) if f.repeat == 0 => {
                        if !d.is_empty() {
                            return Err(mismatch(&tform, d));
                        }
                        None
                    }
                    (None, _) => {
                        if d.len() % f.repeat != 0 {
                            return Err(Error::SchemaMismatch(format!(
                                "{} values is not a whole number of {tform} rows",
                                d.len()
                            )));
                        }
                        Some(d.len() / f.repeat)
                    }
                },
            };
            match (rows, these) {
                (Some(r), Some(t)) if r != t => {
                    return Err(Error::SchemaMismatch(format!(
                        "column {} has {t} rows, expected {r}",
                        column.name
                    )));
                }
                (None, Some(t)) => rows = Some(t),
                _ => {}
            }
        }
        Ok(rows.unwrap_or(0))
    }

    /// Encode one data array per column into rows (and heap).
    pub fn encode(&self, data: &[ColumnData]) -> Result<TableBytes> {
        let nrows = self.row_count(data)?;
        match self.kind {
            TableKind::Binary => self.encode_binary(data, nrows),
            TableKind::Ascii => self.encode_ascii(data, nrows),
        }
    }

    fn encode_binary(&self, data: &[ColumnData], nrows: usize) -> Result<TableBytes> {
        let layout = self.layout();
        let width = layout.row_width;
        let mut rows = vec![0u8; nrows * width];
        let mut heap = Vec::new();
        for (i, (column, d)) in self.columns.iter().zip(data).enumerate() {
            let ColumnFormat::Binary(f) = column.format else {
                continue;
            };
            let off = layout.offsets[i];
            match (f.var, d) {
                (Some(_), ColumnData::VarLen(cells)) if f.repeat == 0 => {
                    if let Some(cell) = cells.iter().find(|c| c.heap_count() != 0) {
                        return Err(Error::SchemaMismatch(format!(
                            "column {} holds no arrays but was given {} values",
                            column.name,
                            cell.heap_count()
                        )));
                    }
                }
                (Some(var), ColumnData::VarLen(cells)) => {
                    let counts: Vec<usize> = cells.iter().map(ColumnData::heap_count).collect();
                    let (offsets, _) = heap_offsets(&counts, f.elem.size(), heap.len());
                    for (row, cell) in cells.iter().enumerate() {
                        let at = row * width + off;
                        write_descriptor(&mut rows[at..], var, counts[row], offsets[row])?;
                        heap.extend_from_slice(&encode_elements(cell, 0, counts[row]));
                    }
                }
                (_, ColumnData::Text(v)) => {
                    for (row, s) in v.iter().enumerate() {
                        if s.len() > f.repeat || !s.is_ascii() {
                            return Err(Error::SchemaMismatch(format!(
                                "{s:?} does not fit format {}",
                                f.tform()
                            )));
                        }
                        let at = row * width + off;
                        rows[at..at + f.repeat].fill(b' ');
                        rows[at..at + s.len()].copy_from_slice(s.as_bytes());
                    }
                }
                _ => {
                    for row in 0..nrows {
                        let cell = encode_elements(d, row * f.repeat, f.repeat);
                        let at = row * width + off;
                        rows[at..at + cell.len()].copy_from_slice(&cell);
                    }
                }
            }
        }
        Ok(TableBytes { nrows, rows, heap })
    }

    fn encode_ascii(&self, data: &[ColumnData], nrows: usize) -> Result<TableBytes> {
        let layout = self.layout();
        let width = layout.row_width;
        let mut rows = vec![b' '; nrows * width];
        for (i, (column, d)) in self.columns.iter().zip(data).enumerate() {
            let ColumnFormat::Ascii(f) = column.format else {
                continue;
            };
            let off = layout.offsets[i];
            for row in 0..nrows {
                let text = f.render(d, row)?;
                let at = row * width + off;
                rows[at..at + text.len()].copy_from_slice(text.as_bytes());
            }
        }
        Ok(TableBytes {
            nrows,
            rows,
            heap: Vec::new(),
        })
    }

    /// Decode `nrows` rows, resolving variable-length cells against `heap`.
    pub fn decode(&self, rows: &[u8], nrows: usize, heap: &[u8]) -> Result<Vec<ColumnData>> {
        let layout = self.layout();
        let width = layout.row_width;
        let needed = nrows.checked_mul(width).ok_or(Error::TruncatedInput)?;
        if rows.len() < needed {
            return Err(Error::TruncatedInput);
        }
        (0..self.columns.len())
            .map(|i| self.decode_column(i, rows, nrows, heap))
            .collect()
    }

    /// Decode one column of `nrows` rows.
    pub fn decode_column(
        &self,
        index: usize,
        rows: &[u8],
        nrows: usize,
        heap: &[u8],
    ) -> Result<ColumnData> {
        let column = self.columns.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.columns.len(),
        })?;
        let layout = self.layout();
        let (width, off, fw) = (layout.row_width, layout.offsets[index], layout.widths[index]);
        if rows.len() < nrows * width {
            return Err(Error::TruncatedInput);
        }
        let field = |row: usize| &rows[row * width + off..row * width + off + fw];

        match column.format {
            ColumnFormat::Ascii(f) => decode_ascii(f, (0..nrows).map(field)),
            ColumnFormat::Binary(f) => match f.var {
                Some(_) if f.repeat == 0 => {
                    let empty = decode_elements(f.elem, &[])?;
                    Ok(ColumnData::VarLen(vec![empty; nrows]))
                }
                Some(var) => {
                    let cells = (0..nrows)
                        .map(|row| {
                            let (count, offset) = read_descriptor(field(row), var)?;
                            let len = count
                                .checked_mul(f.elem.size())
                                .ok_or(Error::TruncatedInput)?;
                            let end = offset.checked_add(len).ok_or(Error::TruncatedInput)?;
                            let bytes = heap.get(offset..end).ok_or(Error::TruncatedInput)?;
                            decode_elements(f.elem, bytes)
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(ColumnData::VarLen(cells))
                }
                None => match f.elem {
                    ElementType::Char => Ok(ColumnData::Text(
                        (0..nrows)
                            .map(|row| text_from(field(row)))
                            .collect::<Result<_>>()?,
                    )),
                    ElementType::Bit => {
                        let mut bits = Vec::with_capacity(nrows * f.repeat);
                        for row in 0..nrows {
                            bits.extend(unpack_bits(field(row), f.repeat)?);
                        }
                        Ok(ColumnData::Bits(bits))
                    }
                    elem => {
                        let mut bytes = Vec::with_capacity(nrows * fw);
                        for row in 0..nrows {
                            bytes.extend_from_slice(field(row));
                        }
                        decode_elements(elem, &bytes)
                    }
                },
            },
        }
    }
}

fn decode_ascii<'a, I>(format: AsciiFormat, fields: I) -> Result<ColumnData>
where
    I: Iterator<Item = &'a [u8]>,
{
    let mut text = Vec::new();
    let mut ints = Vec::new();
    let mut floats = Vec::new();
    for raw in fields {
        let field = core::str::from_utf8(raw)
            .map_err(|_| Error::SchemaMismatch("ASCII table field is not ASCII".to_string()))?;
        match format.read(field)? {
            Scalar::Text(s) => text.push(s),
            Scalar::I32(n) => ints.push(n),
            Scalar::Float(f) => floats.push(f),
        }
    }
    Ok(match format.elem() {
        ElementType::Char => ColumnData::Text(text),
        ElementType::I32 => ColumnData::I32(ints),
        ElementType::F32 => ColumnData::F32(floats.into_iter().map(|f| f as f32).collect()),
        _ => ColumnData::F64(floats),
    })
}

fn write_descriptor(buf: &mut [u8], var: VarArray, count: usize, offset: usize) -> Result<()> {
    if buf.len() < var.descriptor_size() {
        return Err(short_descriptor(buf.len(), var));
    }
    if var.wide {
        let count = i64::try_from(count).map_err(|_| heap_overflow())?;
        let offset = i64::try_from(offset).map_err(|_| heap_overflow())?;
        write_be(buf, count);
        write_be(&mut buf[8..], offset);
    } else {
        let count = i32::try_from(count).map_err(|_| heap_overflow())?;
        let offset = i32::try_from(offset).map_err(|_| heap_overflow())?;
        write_be(buf, count);
        write_be(&mut buf[4..], offset);
    }
    Ok(())
}

fn read_descriptor(buf: &[u8], var: VarArray) -> Result<(usize, usize)> {
    if buf.len() < var.descriptor_size() {
        return Err(short_descriptor(buf.len(), var));
    }
    let (count, offset) = if var.wide {
        (read_be::<i64>(buf), read_be::<i64>(&buf[8..]))
    } else {
        (
            i64::from(read_be::<i32>(buf)),
            i64::from(read_be::<i32>(&buf[4..])),
        )
    };
    match (usize::try_from(count), usize::try_from(offset)) {
        (Ok(c), Ok(o)) => Ok((c, o)),
        _ => Err(Error::SchemaMismatch(format!(
            "negative array descriptor ({count}, {offset})"
        ))),
    }
}

fn short_descriptor(len: usize, var: VarArray) -> Error {
    Error::SchemaMismatch(format!(
        "{len}-byte field cannot hold a {}-byte array descriptor",
        var.descriptor_size()
    ))
}

fn heap_overflow() -> Error {
    Error::SchemaMismatch("heap too large for a P descriptor; use Q".to_string())
}
