//! Header cards: one logical `(keyword, value, comment)` entry and its
//! 80-column image, which spans several records when a long string is
//! continued with `CONTINUE`.
//!
//! Parsed cards keep their source image and only split out the value and
//! comment on first access. Constructed cards are validated eagerly and
//! render their image on demand. Mutating a value or comment drops the cached
//! image.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::OnceCell;

use tracing::warn;

use crate::block::CARD_SIZE;
use crate::config::Verify;
use crate::error::{Error, Result};
use crate::value::{
    format_float, format_value, is_printable, normalize_number, parse_number, parse_value_field,
    Grammar, Value, ValueField,
};

/// Keywords whose cards hold free text in columns 9-80.
pub const COMMENTARY_KEYWORDS: [&str; 3] = ["", "COMMENT", "HISTORY"];

/// Keyword of continuation records.
pub const CONTINUE_KEYWORD: &str = "CONTINUE";

const HIERARCH_PREFIX: &str = "HIERARCH ";
const KEYWORD_LEN: usize = 8;
const VALUE_CHUNK: usize = 67;
const COMMENT_CHUNK: usize = 64;

/// Longest text a commentary card can hold.
pub const COMMENTARY_TEXT_LEN: usize = CARD_SIZE - KEYWORD_LEN;

pub fn is_commentary_keyword(keyword: &str) -> bool {
    COMMENTARY_KEYWORDS.contains(&keyword)
}

/// How a card is laid out, which drives both parsing and formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardKind {
    /// `KEYWORD = value / comment`, continued over several records for long strings.
    Standard,
    /// `HIERARCH long keyword = value / comment`; the keyword keeps its case.
    Hierarch,
    /// Keyword followed by free text, no value indicator and no comment.
    Commentary,
    /// `KEYWORD = 'field: number'`, looked up as `KEYWORD.field`.
    RecordValued { field: String },
    /// The `END` sentinel.
    End,
}

#[derive(Debug, Clone, PartialEq)]
struct Fields {
    value: Value,
    /// Source text of an unmodified numeric value.
    value_text: Option<String>,
    comment: Option<String>,
}

/// One logical header card.
#[derive(Debug, Clone)]
pub struct Card {
    keyword: String,
    kind: CardKind,
    image: OnceCell<String>,
    fields: OnceCell<Fields>,
    /// The image holds unmodified source bytes.
    pristine: bool,
}

// --- Keyword grammar ---

fn is_keyword_byte(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_' || b == b'-'
}

fn check_standard_keyword(keyword: &str) -> Result<()> {
    if keyword.len() > KEYWORD_LEN {
        return Err(Error::KeywordTooLong(keyword.to_string()));
    }
    if !keyword.bytes().all(is_keyword_byte) {
        return Err(Error::MalformedKeyword(keyword.to_string()));
    }
    Ok(())
}

fn check_hierarch_keyword(keyword: &str) -> Result<()> {
    if keyword.is_empty() || keyword.contains('=') || !keyword.bytes().all(is_printable) {
        return Err(Error::MalformedKeyword(keyword.to_string()));
    }
    Ok(())
}

fn strip_hierarch(key: &str) -> Option<&str> {
    if key.len() >= HIERARCH_PREFIX.len()
        && key[..HIERARCH_PREFIX.len()].eq_ignore_ascii_case(HIERARCH_PREFIX)
    {
        Some(key[HIERARCH_PREFIX.len()..].trim())
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    let mut bytes = s.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// `identifier(.digits)?(.identifier(.digits)?)*`
pub fn is_field_specifier(s: &str) -> bool {
    let mut after_identifier = false;
    for token in s.split('.') {
        if is_identifier(token) {
            after_identifier = true;
        } else if after_identifier && !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
        {
            after_identifier = false;
        } else {
            return false;
        }
    }
    true
}

/// Split `field: number` into the field specifier and its numeric value.
fn split_record_value(s: &str) -> Option<(&str, f64)> {
    let (field, number) = s.split_once(':')?;
    if !is_field_specifier(field) {
        return None;
    }
    let value = parse_number(number, Grammar::Lenient)?;
    Some((field, value.as_float()?))
}

/// Split `KEYWORD.field` into an upper-cased keyword and the field specifier.
fn split_record_key(key: &str) -> Option<(String, &str)> {
    let (head, field) = key.split_once('.')?;
    let head = head.to_ascii_uppercase();
    if head.is_empty() || check_standard_keyword(&head).is_err() || !is_field_specifier(field) {
        return None;
    }
    Some((head, field))
}

/// Canonical form of a lookup key: upper-cased, except that the field part of
/// a record-valued key keeps its case. A leading `HIERARCH ` is dropped.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim();
    let key = strip_hierarch(key).unwrap_or(key);
    match split_record_key(key) {
        Some((head, field)) => format!("{head}.{field}"),
        None => key.to_ascii_uppercase(),
    }
}

// --- Layout helpers ---

fn pad_record(s: &str) -> String {
    format!("{s:<CARD_SIZE$}")
}

/// Greedy word wrap into pieces of at most `width` bytes.
///
/// Breaks after a space; a word longer than `width` is split at the boundary.
/// A doubled quote is never split across two pieces.
pub(crate) fn wrap_words(input: &str, width: usize) -> Vec<&str> {
    if input.is_empty() {
        return alloc::vec![""];
    }
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut blanks: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, &b)| b == b' ')
        .map(|(i, _)| i)
        .collect();
    blanks.push(len);

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let mut end = match blanks.iter().position(|&p| p >= start + width) {
            Some(0) => start,
            Some(loc) => blanks[loc - 1] + 1,
            None => len,
        };
        if end <= start {
            end = (start + width).min(len);
        }
        if end < len {
            let quotes = bytes[start..end]
                .iter()
                .rev()
                .take_while(|&&b| b == b'\'')
                .count();
            if quotes % 2 == 1 && end - 1 > start {
                end -= 1;
            }
        }
        pieces.push(&input[start..end]);
        if end >= len {
            break;
        }
        start = end;
    }
    pieces
}

/// Records of a CONTINUE-expanded string card.
fn render_long_string(keyword: &str, value: &str, comment: Option<&str>) -> String {
    let escaped = value.replace('\'', "''");
    let chunks = wrap_words(&escaped, VALUE_CHUNK);
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let head = if i == 0 {
            format!("{keyword:<KEYWORD_LEN$}= ")
        } else {
            format!("{CONTINUE_KEYWORD:<KEYWORD_LEN$}  ")
        };
        let more = i + 1 < chunks.len() || comment.is_some();
        let amp = if more { "&" } else { "" };
        out.push_str(&pad_record(&format!("{head}'{chunk}{amp}'")));
    }
    if let Some(comment) = comment {
        let pieces = wrap_words(comment, COMMENT_CHUNK);
        for (i, piece) in pieces.iter().enumerate() {
            let marker = if i + 1 < pieces.len() { "'&'" } else { "''" };
            out.push_str(&pad_record(&format!(
                "{CONTINUE_KEYWORD:<KEYWORD_LEN$}  {marker} / {piece}"
            )));
        }
    }
    out
}

fn records(image: &str) -> impl Iterator<Item = &str> {
    // Images are ASCII and a whole number of records long.
    (0..image.len() / CARD_SIZE).map(move |i| &image[i * CARD_SIZE..(i + 1) * CARD_SIZE])
}

/// Value/comment text of a card's first record.
fn value_text<'a>(record: &'a str, kind: &CardKind) -> &'a str {
    let eq = match kind {
        CardKind::Hierarch => record.find('='),
        _ => record.as_bytes()[..10].iter().position(|&b| b == b'='),
    };
    match eq {
        Some(eq) => &record[eq + 1..],
        None => &record[KEYWORD_LEN..],
    }
}

fn match_field(text: &str) -> Result<ValueField<'_>> {
    if !text.bytes().all(is_printable) {
        return Err(Error::UnprintableText(text.trim_end().to_string()));
    }
    parse_value_field(text, Grammar::Lenient)
        .ok_or_else(|| Error::MalformedValueGrammar(text.trim_end().to_string()))
}

fn fields_from_match(kind: &CardKind, field: ValueField<'_>) -> Result<Fields> {
    let comment = field.comment.map(str::to_string);
    if let CardKind::RecordValued { .. } = kind {
        let text = field.value.as_str().unwrap_or("");
        let (_, number) = split_record_value(text)
            .ok_or_else(|| Error::MalformedValueGrammar(text.to_string()))?;
        let original = text.split_once(':').map(|(_, n)| n.trim().to_string());
        return Ok(Fields {
            value: Value::Float(number),
            value_text: original,
            comment,
        });
    }
    Ok(Fields {
        value: field.value,
        value_text: field.value_text.map(str::to_string),
        comment,
    })
}

/// Keyword and layout of the first record of an image.
fn split_keyword(record: &str) -> Result<(String, CardKind)> {
    if let Some(rest) = strip_hierarch(record) {
        if let Some(eq) = rest.find('=') {
            let name = rest[..eq].trim();
            if !name.is_empty() {
                check_hierarch_keyword(name)?;
                return Ok((name.to_string(), CardKind::Hierarch));
            }
        }
    }

    let head = record[..KEYWORD_LEN].trim_end().to_ascii_uppercase();
    if is_commentary_keyword(&head) {
        return Ok((head, CardKind::Commentary));
    }
    let eq = record.as_bytes()[..10].iter().position(|&b| b == b'=');
    if head == "END" && eq.is_none() {
        return Ok((head, CardKind::End));
    }
    match eq {
        Some(eq) => {
            let keyword = record[..eq].trim().to_ascii_uppercase();
            check_standard_keyword(&keyword)?;
            Ok((keyword, CardKind::Standard))
        }
        None => {
            check_standard_keyword(&head)?;
            Ok((head, CardKind::Commentary))
        }
    }
}

/// Field specifier of a single-record card whose value is `'field: number'`.
fn detect_record_field(record: &str) -> Option<String> {
    let text = value_text(record, &CardKind::Standard);
    let first = text.find('\'')?;
    let last = text.rfind('\'')?;
    if last <= first {
        return None;
    }
    split_record_value(text[first + 1..last].trim_end()).map(|(field, _)| field.to_string())
}

/// True if a record starts a string-valued card that continuation records may
/// extend.
pub(crate) fn opens_string(record: &str) -> bool {
    if record.len() < CARD_SIZE || strip_hierarch(record).is_some() {
        return false;
    }
    let head = record[..KEYWORD_LEN].trim_end().to_ascii_uppercase();
    if is_commentary_keyword(&head) {
        return false;
    }
    match record.as_bytes()[..10].iter().position(|&b| b == b'=') {
        Some(eq) => record[eq + 1..].trim_start().starts_with('\''),
        None => false,
    }
}

fn fix_number_text(raw: &str) -> String {
    normalize_number(raw, true)
}

// --- Card ---

impl Card {
    /// Parse a card image of one record, or several when continued.
    ///
    /// Images shorter than a whole number of records are padded with spaces.
    pub fn parse(image: &str) -> Result<Card> {
        if !image.is_ascii() {
            return Err(Error::UnprintableText(image.trim_end().to_string()));
        }
        let mut image = image.to_string();
        let padded = image.len().div_ceil(CARD_SIZE).max(1) * CARD_SIZE;
        image.extend(core::iter::repeat(' ').take(padded - image.len()));

        let (keyword, mut kind) = split_keyword(&image[..CARD_SIZE])?;
        let nrecords = image.len() / CARD_SIZE;
        if nrecords > 1 {
            if kind != CardKind::Standard {
                return Err(Error::ContinueChain("only plain string cards can be continued"));
            }
            if records(&image)
                .skip(1)
                .any(|r| &r[..KEYWORD_LEN] != CONTINUE_KEYWORD)
            {
                return Err(Error::ContinueChain(
                    "continuation record keyword is not CONTINUE",
                ));
            }
        } else if kind == CardKind::Standard {
            if let Some(field) = detect_record_field(&image) {
                kind = CardKind::RecordValued { field };
            }
        }

        let eager = nrecords > 1 || matches!(kind, CardKind::Commentary | CardKind::End);
        let card = Card {
            keyword,
            kind,
            image: OnceCell::from(image),
            fields: OnceCell::new(),
            pristine: true,
        };
        if eager {
            card.fields()?;
        }
        Ok(card)
    }

    /// Parse raw bytes of one or more records.
    pub fn from_bytes(bytes: &[u8]) -> Result<Card> {
        match core::str::from_utf8(bytes) {
            Ok(s) => Card::parse(s),
            Err(_) => Err(Error::UnprintableText(
                String::from_utf8_lossy(bytes).trim_end().to_string(),
            )),
        }
    }

    /// Build a card from typed parts.
    ///
    /// `keyword` may be a standard keyword of at most 8 characters, a
    /// `HIERARCH name`, a commentary keyword, or `KEYWORD.field` for a
    /// record-valued card. A string value of the form `field: number` also
    /// makes a record-valued card.
    pub fn new(keyword: &str, value: impl Into<Value>, comment: Option<&str>) -> Result<Card> {
        let value = value.into();
        let keyword = keyword.trim_end();

        let (name, kind) = if let Some(name) = strip_hierarch(keyword) {
            check_hierarch_keyword(name)?;
            (name.to_string(), CardKind::Hierarch)
        } else {
            let upper = keyword.to_ascii_uppercase();
            if upper == "END" || upper == CONTINUE_KEYWORD {
                return Err(Error::MalformedKeyword(upper));
            }
            let numeric = matches!(value, Value::Integer(_) | Value::Float(_));
            match split_record_key(keyword) {
                Some((head, field)) if numeric => (
                    head,
                    CardKind::RecordValued {
                        field: field.to_string(),
                    },
                ),
                _ if is_commentary_keyword(&upper) => (upper, CardKind::Commentary),
                _ => {
                    check_standard_keyword(&upper)?;
                    let record_field = value
                        .as_str()
                        .and_then(split_record_value)
                        .map(|(field, _)| field.to_string());
                    match record_field {
                        Some(field) => (upper, CardKind::RecordValued { field }),
                        None => (upper, CardKind::Standard),
                    }
                }
            }
        };

        let card = Card {
            keyword: name,
            kind,
            image: OnceCell::new(),
            fields: OnceCell::new(),
            pristine: false,
        };
        let value = card.checked_value(value)?;
        card.check_comment(comment)?;
        let fields = Fields {
            value,
            value_text: None,
            comment: comment.map(str::to_string),
        };
        card.render_with(&fields)?;
        Ok(Card {
            fields: OnceCell::from(fields),
            ..card
        })
    }

    /// The `END` sentinel.
    pub fn end() -> Card {
        Card {
            keyword: "END".to_string(),
            kind: CardKind::End,
            image: OnceCell::new(),
            fields: OnceCell::from(Fields {
                value: Value::Absent,
                value_text: None,
                comment: None,
            }),
            pristine: false,
        }
    }

    /// An all-blank card.
    pub fn blank() -> Card {
        Card {
            keyword: String::new(),
            kind: CardKind::Commentary,
            image: OnceCell::new(),
            fields: OnceCell::from(Fields {
                value: Value::String(String::new()),
                value_text: None,
                comment: None,
            }),
            pristine: false,
        }
    }

    /// Upper-cased keyword; case-preserved for HIERARCH cards.
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn kind(&self) -> &CardKind {
        &self.kind
    }

    /// Keyword as seen by lookups: `KEYWORD.field` for record-valued cards.
    pub fn logical_keyword(&self) -> String {
        match &self.kind {
            CardKind::RecordValued { field } => format!("{}.{}", self.keyword, field),
            _ => self.keyword.clone(),
        }
    }

    pub fn field_specifier(&self) -> Option<&str> {
        match &self.kind {
            CardKind::RecordValued { field } => Some(field),
            _ => None,
        }
    }

    pub fn is_commentary(&self) -> bool {
        self.kind == CardKind::Commentary && is_commentary_keyword(&self.keyword)
    }

    pub fn is_end(&self) -> bool {
        self.kind == CardKind::End
    }

    /// True for a card whose whole image is spaces.
    pub fn is_blank(&self) -> bool {
        self.keyword.is_empty()
            && self.kind == CardKind::Commentary
            && self
                .fields
                .get()
                .and_then(|f| f.value.as_str())
                .is_some_and(str::is_empty)
    }

    /// Number of 80-byte records in this card's image.
    pub fn records(&self) -> usize {
        match self.image() {
            Ok(image) => image.len() / CARD_SIZE,
            Err(_) => 1,
        }
    }

    fn fields(&self) -> Result<&Fields> {
        if let Some(fields) = self.fields.get() {
            return Ok(fields);
        }
        let parsed = self.parse_fields()?;
        Ok(self.fields.get_or_init(|| parsed))
    }

    pub fn value(&self) -> Result<&Value> {
        Ok(&self.fields()?.value)
    }

    pub fn comment(&self) -> Result<Option<&str>> {
        Ok(self.fields()?.comment.as_deref())
    }

    /// Source text of a numeric value read from an image, before any
    /// conversion. `None` once the value has been replaced.
    pub fn source_text(&self) -> Result<Option<&str>> {
        Ok(self.fields()?.value_text.as_deref())
    }

    /// The physical image: the source bytes for an unmodified parsed card,
    /// otherwise a freshly formatted one.
    pub fn image(&self) -> Result<&str> {
        if let Some(image) = self.image.get() {
            return Ok(image);
        }
        let rendered = self.render_with(self.fields()?)?;
        Ok(self.image.get_or_init(|| rendered))
    }

    /// Format from the card's fields, ignoring any cached source image.
    pub fn format(&self) -> Result<String> {
        self.render_with(self.fields()?)
    }

    /// Replace the value. The comment is kept and the image is re-formatted on
    /// next access. Nothing changes if the new value is rejected.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<()> {
        let comment = self.fields()?.comment.clone();
        let value = self.checked_value(value.into())?;
        self.commit(Fields {
            value,
            value_text: None,
            comment,
        })
    }

    pub fn set_comment(&mut self, comment: Option<&str>) -> Result<()> {
        if matches!(self.kind, CardKind::Commentary | CardKind::End) {
            return Err(Error::MalformedValueGrammar(format!(
                "{} cards take no comment",
                self.keyword
            )));
        }
        self.check_comment(comment)?;
        let current = self.fields()?;
        let fields = Fields {
            value: current.value.clone(),
            value_text: current.value_text.clone(),
            comment: comment.map(str::to_string),
        };
        self.commit(fields)
    }

    fn commit(&mut self, fields: Fields) -> Result<()> {
        self.render_with(&fields)?;
        self.fields = OnceCell::from(fields);
        self.image = OnceCell::new();
        self.pristine = false;
        Ok(())
    }

    fn checked_value(&self, value: Value) -> Result<Value> {
        match (&self.kind, value) {
            (CardKind::End, _) => Err(Error::MalformedValueGrammar(
                "END carries no value".to_string(),
            )),
            (CardKind::Commentary, Value::String(text)) => {
                if !text.bytes().all(is_printable) {
                    return Err(Error::UnprintableText(text));
                }
                if text.len() > COMMENTARY_TEXT_LEN {
                    return Err(Error::CardTooLong(self.keyword.clone()));
                }
                Ok(Value::String(text))
            }
            (CardKind::Commentary, other) => Err(Error::MalformedValueGrammar(format!(
                "{} text must be a string, got {other:?}",
                self.keyword
            ))),
            (CardKind::RecordValued { .. }, value) => match value.as_float() {
                Some(f) if f.is_finite() => Ok(Value::Float(f)),
                _ => Err(Error::MalformedValueGrammar(format!(
                    "record-valued {} needs a finite number",
                    self.keyword
                ))),
            },
            (_, Value::String(s)) => {
                if s.bytes().all(is_printable) {
                    Ok(Value::String(s))
                } else {
                    Err(Error::UnprintableText(s))
                }
            }
            (_, Value::Float(f)) if !f.is_finite() => Err(Error::MalformedValueGrammar(
                format!("{f} is not representable"),
            )),
            (_, Value::Complex(re, im)) if !(re.is_finite() && im.is_finite()) => {
                Err(Error::MalformedValueGrammar(format!(
                    "({re}, {im}) is not representable"
                )))
            }
            (_, Value::Absent) => Err(Error::MalformedValueGrammar(format!(
                "{} needs a value or Undefined",
                self.keyword
            ))),
            (_, value) => Ok(value),
        }
    }

    fn check_comment(&self, comment: Option<&str>) -> Result<()> {
        match comment {
            Some(_) if matches!(self.kind, CardKind::Commentary | CardKind::End) => {
                Err(Error::MalformedValueGrammar(format!(
                    "{} cards take no comment",
                    self.keyword
                )))
            }
            Some(c) if !c.bytes().all(is_printable) => Err(Error::UnprintableText(c.to_string())),
            _ => Ok(()),
        }
    }

    // --- Parsing ---

    fn source(&self) -> Result<&str> {
        self.image
            .get()
            .map(String::as_str)
            .ok_or_else(|| Error::MalformedValueGrammar(self.keyword.clone()))
    }

    fn parse_fields(&self) -> Result<Fields> {
        let image = self.source()?;
        let first = &image[..CARD_SIZE];
        match &self.kind {
            CardKind::End => Ok(Fields {
                value: Value::Absent,
                value_text: None,
                comment: None,
            }),
            CardKind::Commentary => Ok(Fields {
                value: Value::String(first[KEYWORD_LEN..].trim_end().to_string()),
                value_text: None,
                comment: None,
            }),
            kind if image.len() == CARD_SIZE => {
                fields_from_match(kind, match_field(value_text(first, kind))?)
            }
            kind => self.parse_continued(image, kind),
        }
    }

    fn parse_continued(&self, image: &str, kind: &CardKind) -> Result<Fields> {
        let all: Vec<&str> = records(image).collect();
        let last = all.len() - 1;
        let mut value = String::new();
        let mut comments: Vec<&str> = Vec::new();
        for (i, record) in all.iter().enumerate() {
            let text = if i == 0 {
                value_text(record, kind)
            } else {
                &record[KEYWORD_LEN..]
            };
            let field = match_field(text)?;
            let chunk = match &field.value {
                Value::String(s) => s.as_str(),
                _ => return Err(Error::ContinueChain("continued value is not a string")),
            };
            let chunk = if i < last {
                chunk.strip_suffix('&').unwrap_or(chunk)
            } else {
                chunk
            };
            value.push_str(chunk);
            if let Some(c) = field.comment {
                comments.push(c);
            }
        }
        Ok(Fields {
            value: Value::String(value.trim_end().to_string()),
            value_text: None,
            comment: if comments.is_empty() {
                None
            } else {
                Some(comments.join(" "))
            },
        })
    }

    // --- Formatting ---

    fn render_with(&self, fields: &Fields) -> Result<String> {
        match &self.kind {
            CardKind::End => Ok(pad_record("END")),
            CardKind::Commentary => {
                let text = fields.value.as_str().unwrap_or("");
                let out = format!("{:<KEYWORD_LEN$}{}", self.keyword, text);
                if out.len() > CARD_SIZE {
                    return Err(Error::CardTooLong(self.keyword.clone()));
                }
                Ok(pad_record(&out))
            }
            kind => self.render_valued(kind, fields),
        }
    }

    fn render_valued(&self, kind: &CardKind, fields: &Fields) -> Result<String> {
        let original = fields.value_text.as_deref();
        let value = match kind {
            CardKind::RecordValued { field } => {
                let number = match (original, &fields.value) {
                    (Some(text), _) => text.to_string(),
                    (None, Value::Integer(n)) => n.to_string(),
                    (None, Value::Float(f)) => format_float(*f),
                    (None, _) => String::new(),
                };
                format!("{:<20}", format!("'{field}: {number}'"))
            }
            _ => format_value(&fields.value, original),
        };

        let head = match kind {
            CardKind::Hierarch => {
                let head = format!("HIERARCH {} = ", self.keyword);
                let used = head.len() + value.trim().len();
                if used == CARD_SIZE + 1 {
                    format!("HIERARCH {}= ", self.keyword)
                } else if used > CARD_SIZE {
                    return Err(Error::CardTooLong(self.keyword.clone()));
                } else {
                    head
                }
            }
            _ => format!("{:<KEYWORD_LEN$}= ", self.keyword),
        };
        let value = match kind {
            CardKind::Hierarch => value.trim().to_string(),
            _ => value,
        };

        let mut out = format!("{head}{value}");
        if let Some(comment) = &fields.comment {
            out.push_str(" / ");
            out.push_str(comment);
        }
        if out.len() <= CARD_SIZE {
            return Ok(pad_record(&out));
        }

        match (kind, &fields.value) {
            (CardKind::Standard, Value::String(s)) => Ok(render_long_string(
                &self.keyword,
                s,
                fields.comment.as_deref(),
            )),
            _ => {
                if head.len() + value.len() > CARD_SIZE {
                    return Err(Error::CardTooLong(self.keyword.clone()));
                }
                warn!(keyword = %self.keyword, "comment truncated to fit the card");
                out.truncate(CARD_SIZE);
                Ok(out)
            }
        }
    }

    // --- Verification ---

    /// Check a parsed card against the fixed-format rules.
    ///
    /// Returns a description of each problem found. With [`Verify::Exception`]
    /// the first problem is an error. With the fix modes, repairable problems
    /// are repaired and the image is re-formatted; unprintable text is never
    /// repairable. Constructed or modified cards are always conforming.
    pub fn verify(&mut self, mode: Verify) -> Result<Vec<String>> {
        if mode == Verify::Ignore || !self.pristine {
            return Ok(Vec::new());
        }
        let image = self.source()?.to_string();
        if let Some(pos) = image.bytes().position(|b| !is_printable(b)) {
            return Err(Error::UnprintableText(format!(
                "{}: byte at column {}",
                self.keyword,
                pos % CARD_SIZE + 1
            )));
        }

        let mut problems: Vec<Error> = Vec::new();
        let keyword_field = &image[..KEYWORD_LEN];
        if self.kind != CardKind::Hierarch && keyword_field.bytes().any(|b| b.is_ascii_lowercase())
        {
            problems.push(Error::MalformedKeyword(format!(
                "{} is not upper case",
                keyword_field.trim_end()
            )));
        }
        let valued = matches!(
            self.kind,
            CardKind::Standard | CardKind::RecordValued { .. }
        );
        if valued && &image[KEYWORD_LEN..10] != "= " {
            problems.push(Error::MalformedValueGrammar(format!(
                "{}: equal sign not at column 9",
                self.keyword
            )));
        }
        let mut value_conforms = true;
        if valued || self.kind == CardKind::Hierarch {
            for (i, record) in records(&image).enumerate() {
                let text = if i == 0 {
                    value_text(record, &self.kind)
                } else {
                    &record[KEYWORD_LEN..]
                };
                if parse_value_field(text, Grammar::Strict).is_none() {
                    value_conforms = false;
                    problems.push(Error::MalformedValueGrammar(format!(
                        "{}: {}",
                        self.keyword,
                        text.trim()
                    )));
                    break;
                }
            }
        }

        if problems.is_empty() {
            return Ok(Vec::new());
        }
        if !mode.fixes() {
            return Err(problems.remove(0));
        }

        let fields = if value_conforms {
            self.fields()?.clone()
        } else {
            self.repaired_fields(&image)?
        };
        self.commit(fields)?;
        let messages: Vec<String> = problems.iter().map(|p| format!("fixed: {p}")).collect();
        if mode == Verify::Fix {
            for message in &messages {
                warn!(keyword = %self.keyword, "{message}");
            }
        }
        Ok(messages)
    }

    /// Recover value and comment from a field the strict grammar rejected.
    fn repaired_fields(&self, image: &str) -> Result<Fields> {
        if image.len() > CARD_SIZE {
            return self.fields().cloned();
        }
        let text = value_text(&image[..CARD_SIZE], &self.kind);
        if let Some(field) = parse_value_field(text, Grammar::Lenient) {
            let mut fields = fields_from_match(&self.kind, field)?;
            fields.value_text = match (&self.kind, &fields.value) {
                (CardKind::RecordValued { .. }, _) | (_, Value::Complex(..)) => None,
                _ => fields.value_text.as_deref().map(fix_number_text),
            };
            return Ok(fields);
        }
        if !text.bytes().all(is_printable) {
            return Err(Error::UnprintableText(text.trim_end().to_string()));
        }
        let (value, comment) = match text.split_once('/') {
            Some((value, comment)) => (value.trim(), Some(comment.trim())),
            None => (text.trim(), None),
        };
        Ok(Fields {
            value: Value::String(value.to_string()),
            value_text: None,
            comment: comment.filter(|c| !c.is_empty()).map(str::to_string),
        })
    }
}
