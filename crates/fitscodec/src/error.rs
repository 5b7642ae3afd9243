use alloc::string::String;

/// All errors raised by the card, header, column and block codecs.
#[derive(Debug)]
pub enum Error {
    /// A keyword contains characters outside the allowed set.
    MalformedKeyword(String),
    /// A value/comment field does not match the card value grammar.
    MalformedValueGrammar(String),
    /// A string value or comment contains non-printable characters.
    UnprintableText(String),
    /// A keyword longer than 8 characters was not introduced with `HIERARCH`.
    KeywordTooLong(String),
    /// A card cannot be laid out within its record(s).
    CardTooLong(String),
    /// A keyword (or the requested occurrence of it) is not in the header.
    KeyNotFound(String),
    /// A keyword already present would be duplicated by a rename.
    DuplicateKey(String),
    /// A positional index is past the end of a sequence.
    IndexOutOfRange { index: usize, len: usize },
    /// A case-insensitive name lookup matched more than one entry.
    AmbiguousKey(String),
    /// A column format uses a type code with no native encoding.
    UnsupportedFormatCode(String),
    /// A data array is incompatible with its declared column format.
    SchemaMismatch(String),
    /// A header or data region is not a whole number of 2880-byte blocks.
    BlockAlignmentViolation(usize),
    /// The backing store ended before a complete region was read.
    TruncatedInput,
    /// A header ran to end-of-input without an `END` card.
    MissingTerminator,
    /// A CONTINUE chain is structurally broken.
    ContinueChain(&'static str),
    /// A keyword needed to derive the data shape is absent.
    MissingKeyword(&'static str),
    /// Shape keywords describe an impossible payload.
    InvalidShape(&'static str),
    /// An I/O error from the standard library.
    #[cfg(feature = "std")]
    Io(std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MalformedKeyword(kw) => write!(f, "malformed keyword: {kw:?}"),
            Error::MalformedValueGrammar(s) => write!(f, "malformed value field: {s:?}"),
            Error::UnprintableText(s) => write!(f, "non-printable text: {s:?}"),
            Error::KeywordTooLong(kw) => {
                write!(f, "keyword longer than 8 characters needs HIERARCH: {kw}")
            }
            Error::CardTooLong(kw) => write!(f, "card does not fit its record: {kw}"),
            Error::KeyNotFound(kw) => write!(f, "keyword not found: {kw}"),
            Error::DuplicateKey(kw) => write!(f, "keyword already present: {kw}"),
            Error::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            Error::AmbiguousKey(name) => write!(f, "ambiguous key name: {name}"),
            Error::UnsupportedFormatCode(code) => write!(f, "unsupported format code: {code:?}"),
            Error::SchemaMismatch(msg) => write!(f, "schema mismatch: {msg}"),
            Error::BlockAlignmentViolation(n) => {
                write!(f, "{n} bytes is not a multiple of the 2880-byte block")
            }
            Error::TruncatedInput => write!(f, "truncated input"),
            Error::MissingTerminator => write!(f, "header has no END card"),
            Error::ContinueChain(msg) => write!(f, "broken CONTINUE chain: {msg}"),
            Error::MissingKeyword(kw) => write!(f, "missing required keyword: {kw}"),
            Error::InvalidShape(msg) => write!(f, "invalid data shape: {msg}"),
            #[cfg(feature = "std")]
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedInput
        } else {
            Error::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::string::ToString;

    #[test]
    fn display_malformed_keyword() {
        let e = Error::MalformedKeyword("BAD KEY".into());
        assert_eq!(e.to_string(), "malformed keyword: \"BAD KEY\"");
    }

    #[test]
    fn display_keyword_too_long() {
        let e = Error::KeywordTooLong("LONGKEYWORD".into());
        assert_eq!(
            e.to_string(),
            "keyword longer than 8 characters needs HIERARCH: LONGKEYWORD"
        );
    }

    #[test]
    fn display_index_out_of_range() {
        let e = Error::IndexOutOfRange { index: 7, len: 3 };
        assert_eq!(e.to_string(), "index 7 out of range for length 3");
    }

    #[test]
    fn display_alignment() {
        let e = Error::BlockAlignmentViolation(100);
        assert_eq!(
            e.to_string(),
            "100 bytes is not a multiple of the 2880-byte block"
        );
    }

    #[test]
    fn display_missing_keyword() {
        let e = Error::MissingKeyword("NAXIS");
        assert_eq!(e.to_string(), "missing required keyword: NAXIS");
    }

    #[test]
    fn display_continue_chain() {
        let e = Error::ContinueChain("continuation value is not a string");
        assert_eq!(
            e.to_string(),
            "broken CONTINUE chain: continuation value is not a string"
        );
    }

    #[cfg(feature = "std")]
    #[test]
    fn display_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e = Error::Io(io_err);
        assert_eq!(e.to_string(), "I/O error: file not found");
    }

    #[cfg(feature = "std")]
    #[test]
    fn io_error_from_conversion() {
        let e: Error = std::io::Error::other("oops").into();
        assert!(matches!(e, Error::Io(_)));
    }

    #[cfg(feature = "std")]
    #[test]
    fn unexpected_eof_maps_to_truncated_input() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(e, Error::TruncatedInput));
    }

    #[test]
    fn debug_formatting() {
        let e = Error::UnsupportedFormatCode("9Z".into());
        let debug = format!("{e:?}");
        assert!(debug.contains("UnsupportedFormatCode"));
        assert!(debug.contains("9Z"));
    }

    #[cfg(feature = "std")]
    #[test]
    fn std_error_source() {
        use std::error::Error as StdError;

        let e = Error::TruncatedInput;
        assert!(e.source().is_none());

        let e = Error::Io(std::io::Error::other("inner"));
        assert!(e.source().is_some());
    }
}
