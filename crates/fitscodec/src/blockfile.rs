//! Block-structured reading and writing of whole files.
//!
//! A file is a sequence of units, each a header followed by an optional data
//! payload, both padded to 2880-byte blocks. [`BlockFile`] walks the units
//! lazily: a unit's header is read when first asked for, its payload geometry
//! is derived when the next header is needed or the payload is requested, and
//! payload bytes are only read (or mapped) on first access.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use alloc::vec;
use alloc::vec::Vec;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::block::{pad_len, BlockRegion, PadKind, BLOCK_SIZE};
use crate::card::Card;
use crate::column::{ColumnData, ColumnSet, TableKind};
use crate::config::{Config, Materialize};
use crate::error::{Error, Result};
use crate::header::{end_offset, Header};
use crate::scale::{pseudo_unsigned_offset, ImageData, Scaling};
use crate::shape::{DataShape, UnitKind};

/// Index of a unit within the [`BlockFile`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataHandle(usize);

impl DataHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Progress of one unit through reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not reached yet.
    HeaderPending,
    /// Cards parsed; payload geometry not derived yet.
    HeaderRead,
    /// Payload offset and length known, no bytes read.
    DataDeferred,
    /// Payload bytes available.
    DataMaterialized,
}

#[derive(Debug)]
enum Payload {
    Deferred,
    Owned(Vec<u8>),
    Mapped,
}

/// One header and the location of its payload.
#[derive(Debug)]
pub struct Unit {
    header: Header,
    header_offset: u64,
    data_offset: u64,
    layout: Option<(DataShape, BlockRegion)>,
    payload: Payload,
}

impl Unit {
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Byte offset of the first header block.
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    /// Byte offset of the first payload block.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Payload geometry, once derived.
    pub fn shape(&self) -> Option<&DataShape> {
        self.layout.as_ref().map(|(shape, _)| shape)
    }

    pub fn region(&self) -> Option<&BlockRegion> {
        self.layout.as_ref().map(|(_, region)| region)
    }

    pub fn state(&self) -> UnitState {
        match (&self.layout, &self.payload) {
            (None, _) => UnitState::HeaderRead,
            (Some(_), Payload::Deferred) => UnitState::DataDeferred,
            (Some(_), _) => UnitState::DataMaterialized,
        }
    }
}

/// Fill `block` from `source`; returns the byte count, short only at end of input.
fn read_block<R: Read>(source: &mut R, block: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match source.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Reader over a seekable backing store.
pub struct BlockFile<S> {
    source: S,
    map: Option<Mmap>,
    config: Config,
    units: Vec<Unit>,
    exhausted: bool,
}

impl BlockFile<File> {
    /// Open `path`, mapping it into memory when `config` asks for mapped
    /// materialization.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let map = match config.materialize {
            // SAFETY: the mapping is read-only; the file must not be truncated
            // or modified by another process while this BlockFile is alive.
            Materialize::Mapped => Some(unsafe { Mmap::map(&file)? }),
            Materialize::Sequential => None,
        };
        debug!(
            path = %path.as_ref().display(),
            mapped = map.is_some(),
            "opened file"
        );
        Ok(BlockFile {
            source: file,
            map,
            config,
            units: Vec::new(),
            exhausted: false,
        })
    }
}

impl<S: Read + Seek> BlockFile<S> {
    /// Read from any seekable store. Payloads are read sequentially; mapping
    /// needs a real file (see [`BlockFile::open`]).
    pub fn new(source: S, config: Config) -> Self {
        if config.materialize == Materialize::Mapped {
            debug!("mapping needs a file; reading payloads sequentially");
        }
        BlockFile {
            source,
            map: None,
            config,
            units: Vec::new(),
            exhausted: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Units read so far.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn get(&self, handle: DataHandle) -> Option<&Unit> {
        self.units.get(handle.0)
    }

    fn unit_mut(&mut self, handle: DataHandle) -> Result<&mut Unit> {
        let len = self.units.len();
        self.units.get_mut(handle.0).ok_or(Error::IndexOutOfRange {
            index: handle.0,
            len,
        })
    }

    pub fn header(&self, handle: DataHandle) -> Result<&Header> {
        self.get(handle)
            .map(Unit::header)
            .ok_or(Error::IndexOutOfRange {
                index: handle.0,
                len: self.units.len(),
            })
    }

    /// State of unit `index`; `None` past the last unit of a fully read file.
    pub fn state(&self, index: usize) -> Option<UnitState> {
        match self.units.get(index) {
            Some(unit) => Some(unit.state()),
            None if self.exhausted => None,
            None => Some(UnitState::HeaderPending),
        }
    }

    /// Derive the payload geometry of a unit whose header has been read.
    fn defer(&mut self, handle: DataHandle) -> Result<(&DataShape, BlockRegion)> {
        let unit = self.unit_mut(handle)?;
        if unit.layout.is_none() {
            let shape = DataShape::from_header(&unit.header)?;
            let region = BlockRegion::for_payload(unit.data_offset, shape.byte_len())?;
            debug!(
                unit = handle.0,
                offset = region.offset(),
                data_len = region.data_len(),
                padded_len = region.len(),
                "deferred payload"
            );
            unit.layout = Some((shape, region));
        }
        match &unit.layout {
            Some((shape, region)) => Ok((shape, *region)),
            None => Err(Error::InvalidShape("payload geometry unavailable")),
        }
    }

    /// Payload geometry of `handle`.
    pub fn shape(&mut self, handle: DataHandle) -> Result<&DataShape> {
        Ok(self.defer(handle)?.0)
    }

    /// Read the next unit's header. `None` at end of input.
    pub fn next_unit(&mut self) -> Result<Option<DataHandle>> {
        if self.exhausted {
            return Ok(None);
        }
        let header_offset = match self.units.len() {
            0 => 0,
            n => self.defer(DataHandle(n - 1))?.1.end(),
        };
        self.source.seek(SeekFrom::Start(header_offset))?;

        let mut bytes = Vec::new();
        let mut block = vec![0u8; BLOCK_SIZE];
        loop {
            let n = read_block(&mut self.source, &mut block)?;
            if n == 0 {
                if bytes.is_empty() {
                    self.exhausted = true;
                    return Ok(None);
                }
                if !self.config.tolerate_missing_end {
                    return Err(Error::MissingTerminator);
                }
                self.exhausted = true;
                break;
            }
            if n < BLOCK_SIZE {
                return Err(Error::BlockAlignmentViolation(bytes.len() + n));
            }
            if bytes.is_empty() && !self.units.is_empty() && block.iter().all(|&b| b == 0) {
                warn!(offset = header_offset, "zero-filled block after last unit");
                self.exhausted = true;
                return Ok(None);
            }
            bytes.extend_from_slice(&block);
            if end_offset(&bytes).is_some() {
                break;
            }
        }

        let header = Header::parse(&bytes, &self.config)?;
        let handle = DataHandle(self.units.len());
        debug!(
            unit = handle.0,
            offset = header_offset,
            header_len = bytes.len(),
            cards = header.len(),
            "read header"
        );
        self.units.push(Unit {
            header,
            header_offset,
            data_offset: header_offset + bytes.len() as u64,
            layout: None,
            payload: Payload::Deferred,
        });
        Ok(Some(handle))
    }

    /// Handle of unit `index`, reading headers up to it as needed.
    pub fn unit(&mut self, index: usize) -> Result<Option<DataHandle>> {
        while self.units.len() <= index {
            if self.next_unit()?.is_none() {
                return Ok(None);
            }
        }
        Ok(Some(DataHandle(index)))
    }

    /// Read every remaining header; returns the unit count.
    pub fn scan(&mut self) -> Result<usize> {
        while self.next_unit()?.is_some() {}
        Ok(self.units.len())
    }

    /// First extension whose `EXTNAME` matches `name`.
    pub fn find(&mut self, name: &str) -> Result<Option<DataHandle>> {
        let mut index = 0;
        while let Some(handle) = self.unit(index)? {
            if self.units[index]
                .header
                .matches_extname(name, &self.config)
            {
                return Ok(Some(handle));
            }
            index += 1;
        }
        Ok(None)
    }

    fn materialize(&mut self, handle: DataHandle) -> Result<()> {
        let region = self.defer(handle)?.1;
        if !matches!(self.units[handle.0].payload, Payload::Deferred) {
            return Ok(());
        }
        let payload = match &self.map {
            Some(map) => {
                let start = usize::try_from(region.offset()).map_err(|_| Error::TruncatedInput)?;
                match start.checked_add(region.data_len()) {
                    Some(end) if end <= map.len() => Payload::Mapped,
                    _ => return Err(Error::TruncatedInput),
                }
            }
            None => {
                // Allocate only once the source is known to hold the payload.
                let available = self.source.seek(SeekFrom::End(0))?;
                let needed = u64::try_from(region.data_len())
                    .ok()
                    .and_then(|n| region.offset().checked_add(n))
                    .ok_or(Error::TruncatedInput)?;
                if available < needed {
                    warn!(unit = handle.0, available, needed, "payload runs past end of input");
                    return Err(Error::TruncatedInput);
                }
                let mut bytes = vec![0u8; region.data_len()];
                self.source.seek(SeekFrom::Start(region.offset()))?;
                self.source.read_exact(&mut bytes)?;
                Payload::Owned(bytes)
            }
        };
        debug!(
            unit = handle.0,
            bytes = region.data_len(),
            mapped = matches!(payload, Payload::Mapped),
            "materialized payload"
        );
        self.units[handle.0].payload = payload;
        Ok(())
    }

    /// Payload bytes of `handle`, without padding.
    pub fn data(&mut self, handle: DataHandle) -> Result<&[u8]> {
        self.materialize(handle)?;
        let unit = &self.units[handle.0];
        let region = unit.region().ok_or(Error::TruncatedInput)?;
        match &unit.payload {
            Payload::Owned(bytes) => Ok(bytes),
            Payload::Mapped => {
                let start = region.offset() as usize;
                self.map
                    .as_ref()
                    .and_then(|map| map.get(start..start.checked_add(region.data_len())?))
                    .ok_or(Error::TruncatedInput)
            }
            Payload::Deferred => Err(Error::TruncatedInput),
        }
    }

    /// Image pixels of a primary or `IMAGE` unit. Pseudo-unsigned data comes
    /// back unsigned when `scale_unsigned` is configured.
    pub fn read_image(&mut self, handle: DataHandle) -> Result<ImageData> {
        let shape = self.shape(handle)?;
        if !matches!(shape.kind, UnitKind::Primary | UnitKind::Image) {
            return Err(Error::SchemaMismatch("unit is not an image".into()));
        }
        let bitpix = shape.bitpix;
        let scaling = Scaling::from_header(self.header(handle)?);
        let unsigned = self.config.scale_unsigned;
        let bytes = self.data(handle)?;
        ImageData::from_be_bytes(bitpix, bytes, scaling, unsigned)
    }

    /// Schema and column data of a table unit.
    pub fn read_table(&mut self, handle: DataHandle) -> Result<(ColumnSet, Vec<ColumnData>)> {
        let shape = self.shape(handle)?;
        let UnitKind::Table(kind) = shape.kind else {
            return Err(Error::SchemaMismatch("unit is not a table".into()));
        };
        let nrows = shape.nrows().unwrap_or(0);
        let header = self.header(handle)?;
        let columns = ColumnSet::from_header(header, kind)?;
        let rows_len = nrows * columns.row_width();
        let heap_start = match header.get_int("THEAP") {
            Some(theap) => {
                usize::try_from(theap).map_err(|_| Error::InvalidShape("THEAP is negative"))?
            }
            None => rows_len,
        };
        let bytes = self.data(handle)?;
        let heap = bytes.get(heap_start..).ok_or(Error::TruncatedInput)?;
        let data = columns.decode(&bytes[..rows_len.min(bytes.len())], nrows, heap)?;
        Ok((columns, data))
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

// --- Writing ---

/// Header for an image of `data` with axes `axes` (fastest first).
///
/// `primary` selects `SIMPLE = T` over `XTENSION = 'IMAGE'`.
pub fn image_header(primary: bool, axes: &[usize], data: &ImageData) -> Result<Header> {
    let mut cards = if primary {
        vec![Card::new("SIMPLE", true, Some("conforms to FITS standard"))?]
    } else {
        vec![Card::new("XTENSION", "IMAGE", Some("image extension"))?]
    };
    cards.push(Card::new("BITPIX", data.bitpix(), None)?);
    cards.push(Card::new("NAXIS", axes.len() as i64, None)?);
    for (i, &n) in axes.iter().enumerate() {
        cards.push(Card::new(&format!("NAXIS{}", i + 1), n as i64, None)?);
    }
    if primary {
        cards.push(Card::new("EXTEND", true, None)?);
    } else {
        cards.push(Card::new("PCOUNT", 0i64, None)?);
        cards.push(Card::new("GCOUNT", 1i64, None)?);
    }
    Header::from_cards(cards)
}

/// `BZERO` card holding `offset` as an exact integer. `2^63` does not fit an
/// `i64` value, so its image is written directly.
fn bzero_card(offset: i128) -> Result<Card> {
    match i64::try_from(offset) {
        Ok(n) => Card::new("BZERO", n, None),
        Err(_) => Card::parse(&format!("BZERO   = {offset:>20}")),
    }
}

/// Stream-mode writer: units go out in order and are never read back.
pub struct BlockWriter<W: Write> {
    sink: W,
    written: u64,
    units: usize,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(sink: W) -> Self {
        BlockWriter {
            sink,
            written: 0,
            units: 0,
        }
    }

    /// Bytes written so far; always a whole number of blocks.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write `header` and `data`, each padded to the block boundary.
    ///
    /// The header must open with `SIMPLE` for the first unit and `XTENSION`
    /// afterwards, and must describe exactly `data.len()` payload bytes.
    pub fn write_unit(&mut self, header: &Header, data: &[u8]) -> Result<()> {
        let first = header.card(0).map(Card::keyword);
        let expected = if self.units == 0 { "SIMPLE" } else { "XTENSION" };
        if first != Some(expected) {
            return Err(Error::MissingKeyword(expected));
        }
        let shape = DataShape::from_header(header)?;
        if shape.byte_len() != data.len() {
            return Err(Error::SchemaMismatch(format!(
                "header describes {} payload bytes, got {}",
                shape.byte_len(),
                data.len()
            )));
        }

        let header_bytes = header.to_bytes()?;
        self.sink.write_all(&header_bytes)?;
        self.sink.write_all(data)?;
        let fill = pad_len(data.len());
        self.sink.write_all(&vec![shape.pad_kind().byte(); fill])?;

        let total = header_bytes.len() + data.len() + fill;
        debug!(
            unit = self.units,
            offset = self.written,
            header_len = header_bytes.len(),
            data_len = data.len(),
            "wrote unit"
        );
        self.written += total as u64;
        self.units += 1;
        Ok(())
    }

    /// Write an image unit. Unsigned (and signed-byte) pixels go through the
    /// pseudo-unsigned encoding; its `BSCALE`/`BZERO` cards are added to a
    /// copy of `header`, leaving the caller's header untouched.
    pub fn write_image(&mut self, header: &Header, data: &ImageData) -> Result<()> {
        let mut header = header.clone();
        if data.pseudo_unsigned_bzero().is_some() {
            let offset = pseudo_unsigned_offset(data.bitpix())
                .ok_or(Error::InvalidShape("no pseudo-unsigned offset for BITPIX"))?;
            header.set("BSCALE", 1i64, None)?;
            let card = bzero_card(offset)?;
            match header.index_of("BZERO", 0) {
                Ok(pos) => {
                    header.replace_at(pos, card)?;
                }
                Err(_) => header.append(card)?,
            }
        }
        let shape = DataShape::from_header(&header)?;
        if shape.bitpix != data.bitpix() || shape.element_count() != data.len() {
            return Err(Error::SchemaMismatch(format!(
                "header describes {} pixels of BITPIX {}, got {} of BITPIX {}",
                shape.element_count(),
                shape.bitpix,
                data.len(),
                data.bitpix()
            )));
        }
        self.write_unit(&header, &data.to_be_bytes())
    }

    /// Encode `data` against `columns` and write a table extension. `extra`
    /// cards (e.g. `EXTNAME`) follow the column keywords.
    pub fn write_table(
        &mut self,
        columns: &ColumnSet,
        data: &[ColumnData],
        extra: &[Card],
    ) -> Result<()> {
        let encoded = columns.encode(data)?;
        let mut header = columns.table_header(encoded.nrows, encoded.heap.len())?;
        for card in extra {
            header.append(card.clone())?;
        }
        let mut payload = encoded.rows;
        payload.extend_from_slice(&encoded.heap);
        if columns.kind() == TableKind::Ascii {
            debug!(rows = encoded.nrows, "writing ASCII table");
        }
        self.write_unit(&header, &payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}
