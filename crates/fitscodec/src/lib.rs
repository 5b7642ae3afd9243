//! Codecs for the FITS file format.
//!
//! - [`card`]: 80-byte card images, including `HIERARCH`, `CONTINUE` and
//!   record-valued keyword cards.
//! - [`header`]: ordered card sequences with keyword lookup and padding.
//! - [`column`]: `TFORMn` grammar and table row/heap layout.
//! - [`blockfile`]: lazy reading and stream writing of 2880-byte block files
//!   (requires the `std` feature).
//!
//! Without the default `std` feature the crate is `no_std` + `alloc`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod block;
pub mod card;
pub mod column;
pub mod config;
pub mod endian;
pub mod error;
pub mod header;
pub mod scale;
pub mod shape;
pub mod value;

#[cfg(feature = "std")]
pub mod blockfile;

pub use block::{pad_len, BLOCK_SIZE, CARDS_PER_BLOCK, CARD_SIZE};
pub use card::{Card, CardKind};
pub use column::{Column, ColumnData, ColumnSet, TableKind};
pub use config::{Config, Materialize, Verify};
pub use error::{Error, Result};
pub use header::Header;
pub use value::Value;

#[cfg(feature = "std")]
pub use blockfile::{BlockFile, BlockWriter, DataHandle, UnitState};
