//! Ordered header cards with a duplicate-aware keyword index.
//!
//! A [`Header`] owns its cards. Every keyword (upper-cased, or `KEYWORD.field`
//! for record-valued cards) maps to the ascending list of positions holding
//! it, and every mutation keeps that index in step with the card sequence.
//! Blank cards at the tail of the sequence are available padding: appends and
//! inserts use them up instead of growing the header.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use tracing::{debug, warn};

use crate::block::{pad_in_place, PadKind, CARD_SIZE};
use crate::card::{
    self, is_commentary_keyword, normalize_key, Card, CardKind, COMMENTARY_TEXT_LEN,
    CONTINUE_KEYWORD,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::Value;

const END_KEYWORD: &[u8; 8] = b"END     ";

/// True if a raw 80-byte record is the `END` sentinel.
pub fn is_end_record(record: &[u8]) -> bool {
    record.len() >= END_KEYWORD.len() && &record[..END_KEYWORD.len()] == END_KEYWORD
}

/// Offset one past the `END` record, scanning whole records only.
pub fn end_offset(bytes: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(CARD_SIZE)
        .position(|r| is_end_record(r))
        .map(|i| (i + 1) * CARD_SIZE)
}

fn is_continue_record(record: &[u8]) -> bool {
    record.starts_with(CONTINUE_KEYWORD.as_bytes())
}

fn opens_string(record: &[u8]) -> bool {
    core::str::from_utf8(record).is_ok_and(card::opens_string)
}

/// The three commentary keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commentary {
    Comment,
    History,
    /// Blank keyword.
    Blank,
}

impl Commentary {
    pub fn keyword(self) -> &'static str {
        match self {
            Commentary::Comment => "COMMENT",
            Commentary::History => "HISTORY",
            Commentary::Blank => "",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Commentary> {
        match keyword {
            "COMMENT" => Some(Commentary::Comment),
            "HISTORY" => Some(Commentary::History),
            "" => Some(Commentary::Blank),
            _ => None,
        }
    }
}

/// Where [`Header::add_commentary`] places new cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor<'a> {
    /// Before the first card with this keyword.
    Before(&'a str),
    /// After the first card with this keyword.
    After(&'a str),
    BeforeIndex(usize),
    AfterIndex(usize),
}

/// Index entries for a card: its lookup key, plus the base keyword of a
/// record-valued card.
fn index_keys(card: &Card) -> (String, Option<String>) {
    match card.kind() {
        CardKind::Hierarch => (card.keyword().to_ascii_uppercase(), None),
        CardKind::RecordValued { field } => (
            format!("{}.{}", card.keyword(), field),
            Some(card.keyword().to_string()),
        ),
        _ => (card.keyword().to_string(), None),
    }
}

fn reject_end(card: &Card) -> Result<()> {
    if card.is_end() {
        return Err(Error::MalformedKeyword(
            "END is implied by the header".to_string(),
        ));
    }
    Ok(())
}

/// An ordered sequence of cards, not including the `END` sentinel.
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<Card>,
    index: BTreeMap<String, Vec<usize>>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a header from cards in order. No padding is consumed.
    pub fn from_cards<I: IntoIterator<Item = Card>>(cards: I) -> Result<Header> {
        let mut header = Header::new();
        for card in cards {
            reject_end(&card)?;
            header.push(card);
        }
        Ok(header)
    }

    /// Parse header records up to and including `END`.
    ///
    /// `bytes` must be a whole number of records; anything after `END` is
    /// ignored. `CONTINUE` records following a string card are gathered into
    /// that card. Each card is checked according to `config.verify`.
    pub fn parse(bytes: &[u8], config: &Config) -> Result<Header> {
        if bytes.len() % CARD_SIZE != 0 {
            return Err(Error::TruncatedInput);
        }
        let records: Vec<&[u8]> = bytes.chunks_exact(CARD_SIZE).collect();
        let mut header = Header::new();
        let mut terminated = false;
        let mut i = 0;
        while i < records.len() {
            if is_end_record(records[i]) {
                terminated = true;
                break;
            }
            let mut end = i + 1;
            if opens_string(records[i]) {
                while end < records.len() && is_continue_record(records[end]) {
                    end += 1;
                }
            }
            let mut card = Card::from_bytes(&bytes[i * CARD_SIZE..end * CARD_SIZE])?;
            card.verify(config.verify)?;
            header.push(card);
            i = end;
        }

        if !terminated {
            if !config.tolerate_missing_end {
                return Err(Error::MissingTerminator);
            }
            warn!(cards = header.len(), "header ends without an END card");
        }
        Ok(header)
    }

    /// Serialize the cards and `END`, space-padded to a whole number of blocks.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((self.cards.len() + 1) * CARD_SIZE);
        for card in &self.cards {
            out.extend_from_slice(card.image()?.as_bytes());
        }
        out.extend_from_slice(Card::end().image()?.as_bytes());
        pad_in_place(&mut out, PadKind::Header);
        debug!(cards = self.cards.len(), bytes = out.len(), "serialized header");
        Ok(out)
    }

    // --- Inspection ---

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Card> {
        self.cards.iter()
    }

    pub fn card(&self, index: usize) -> Option<&Card> {
        self.cards.get(index)
    }

    /// Number of blank cards at the end of the sequence.
    pub fn padding(&self) -> usize {
        self.cards.iter().rev().take_while(|c| c.is_blank()).count()
    }

    fn positions(&self, keyword: &str) -> Option<&[usize]> {
        let key = normalize_key(keyword);
        self.index
            .get(&key)
            .or_else(|| self.index.get(&key.to_ascii_uppercase()))
            .map(Vec::as_slice)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.positions(keyword).is_some()
    }

    /// Number of cards filed under `keyword`.
    pub fn count(&self, keyword: &str) -> usize {
        self.positions(keyword).map_or(0, <[usize]>::len)
    }

    /// Position of the `occurrence`-th card with this keyword.
    pub fn index_of(&self, keyword: &str, occurrence: usize) -> Result<usize> {
        self.positions(keyword)
            .and_then(|p| p.get(occurrence).copied())
            .ok_or_else(|| {
                if occurrence == 0 {
                    Error::KeyNotFound(keyword.to_string())
                } else {
                    Error::KeyNotFound(format!("{keyword} (occurrence {occurrence})"))
                }
            })
    }

    pub fn lookup(&self, keyword: &str, occurrence: usize) -> Result<&Card> {
        let pos = self.index_of(keyword, occurrence)?;
        Ok(&self.cards[pos])
    }

    /// First card with this keyword.
    pub fn get(&self, keyword: &str) -> Option<&Card> {
        self.lookup(keyword, 0).ok()
    }

    pub fn value(&self, keyword: &str) -> Result<&Value> {
        self.lookup(keyword, 0)?.value()
    }

    pub fn get_int(&self, keyword: &str) -> Option<i64> {
        self.get(keyword)?.value().ok()?.as_int()
    }

    pub fn get_float(&self, keyword: &str) -> Option<f64> {
        self.get(keyword)?.value().ok()?.as_float()
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword)?.value().ok()?.as_str()
    }

    pub fn get_bool(&self, keyword: &str) -> Option<bool> {
        self.get(keyword)?.value().ok()?.as_bool()
    }

    pub fn extname(&self) -> Option<&str> {
        self.get_str("EXTNAME").map(str::trim_end)
    }

    /// Compare `EXTNAME` with `name`, ignoring case unless configured otherwise.
    pub fn matches_extname(&self, name: &str, config: &Config) -> bool {
        match self.extname() {
            Some(ext) if config.case_sensitive_names => ext == name.trim_end(),
            Some(ext) => ext.eq_ignore_ascii_case(name.trim_end()),
            None => false,
        }
    }

    // --- Index maintenance ---

    fn register(&mut self, pos: usize) {
        let (key, base) = index_keys(&self.cards[pos]);
        for key in core::iter::once(key).chain(base) {
            let list = self.index.entry(key).or_default();
            let at = list.partition_point(|&p| p < pos);
            list.insert(at, pos);
        }
    }

    fn unregister(&mut self, pos: usize) {
        let (key, base) = index_keys(&self.cards[pos]);
        for key in core::iter::once(key).chain(base) {
            if let Some(list) = self.index.get_mut(&key) {
                list.retain(|&p| p != pos);
                if list.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    /// Move every indexed position at or above `from` by one.
    fn shift_from(&mut self, from: usize, up: bool) {
        for list in self.index.values_mut() {
            for p in list.iter_mut().filter(|p| **p >= from) {
                if up {
                    *p += 1;
                } else {
                    *p -= 1;
                }
            }
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for pos in 0..self.cards.len() {
            self.register(pos);
        }
    }

    fn push(&mut self, card: Card) {
        self.cards.push(card);
        self.register(self.cards.len() - 1);
    }

    fn insert_at(&mut self, pos: usize, card: Card) {
        self.shift_from(pos, true);
        self.cards.insert(pos, card);
        self.register(pos);
    }

    fn remove_raw(&mut self, pos: usize) -> Card {
        self.unregister(pos);
        let card = self.cards.remove(pos);
        self.shift_from(pos + 1, false);
        card
    }

    /// Drop up to `n` blank cards from the tail.
    fn use_blanks(&mut self, n: usize) {
        for _ in 0..n {
            if !self.cards.last().is_some_and(Card::is_blank) {
                break;
            }
            let last = self.cards.len() - 1;
            self.remove_raw(last);
        }
    }

    // --- Mutation ---

    /// Add a card after the last non-blank card, using up padding.
    ///
    /// Blank cards always go to the very end.
    pub fn append(&mut self, card: Card) -> Result<()> {
        reject_end(&card)?;
        let padding = self.padding();
        if card.is_blank() || padding == 0 {
            self.push(card);
            return Ok(());
        }
        let records = card.records();
        self.insert_at(self.cards.len() - padding, card);
        self.use_blanks(records);
        Ok(())
    }

    /// Insert a card at `index`; an index at or past the end appends.
    pub fn insert(&mut self, index: usize, card: Card) -> Result<()> {
        if index >= self.cards.len() {
            return self.append(card);
        }
        reject_end(&card)?;
        let blank = card.is_blank();
        let records = card.records();
        self.insert_at(index, card);
        if !blank {
            self.use_blanks(records);
        }
        Ok(())
    }

    /// Update the first card with `keyword`, or append a new one.
    ///
    /// `comment: None` keeps an existing comment. Commentary keywords add a
    /// new card instead of replacing one.
    pub fn set(
        &mut self,
        keyword: &str,
        value: impl Into<Value>,
        comment: Option<&str>,
    ) -> Result<()> {
        let value = value.into();
        if let Some(kind) = Commentary::from_keyword(&normalize_key(keyword)) {
            if comment.is_some() {
                return Err(Error::MalformedValueGrammar(format!(
                    "{} cards take no comment",
                    kind.keyword()
                )));
            }
            let text = value.as_str().ok_or_else(|| {
                Error::MalformedValueGrammar(format!("{} text must be a string", kind.keyword()))
            })?;
            return self.add_commentary(kind, text, None);
        }

        match self.index_of(keyword, 0) {
            Ok(pos) => {
                let mut card = self.cards[pos].clone();
                card.set_value(value)?;
                if comment.is_some() {
                    card.set_comment(comment)?;
                }
                self.cards[pos] = card;
                Ok(())
            }
            Err(_) => self.append(Card::new(keyword, value, comment)?),
        }
    }

    /// Remove every card filed under `keyword`, returning how many went.
    ///
    /// A record-valued base keyword such as `DP1` removes all `DP1.*` cards.
    pub fn delete(&mut self, keyword: &str) -> Result<usize> {
        let doomed = self
            .positions(keyword)
            .ok_or_else(|| Error::KeyNotFound(keyword.to_string()))?
            .to_vec();
        let mut pos = 0;
        self.cards.retain(|_| {
            let keep = doomed.binary_search(&pos).is_err();
            pos += 1;
            keep
        });
        self.reindex();
        Ok(doomed.len())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Card> {
        if index >= self.cards.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.cards.len(),
            });
        }
        Ok(self.remove_raw(index))
    }

    /// Put `card` in place of the card at `index`, returning the old one.
    pub fn replace_at(&mut self, index: usize, card: Card) -> Result<Card> {
        reject_end(&card)?;
        if index >= self.cards.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.cards.len(),
            });
        }
        self.unregister(index);
        let old = core::mem::replace(&mut self.cards[index], card);
        self.register(index);
        Ok(old)
    }

    /// Add `COMMENT`, `HISTORY` or blank-keyword text.
    ///
    /// Text longer than one card is word-wrapped over several cards. Without
    /// an anchor `COMMENT` and `HISTORY` cards go after the last card of the
    /// same kind, or are appended if there is none. Unanchored blank-keyword
    /// cards are always appended, taking padding slots; one with no text is
    /// absorbed by an existing padding slot.
    pub fn add_commentary(
        &mut self,
        kind: Commentary,
        text: &str,
        anchor: Option<Anchor<'_>>,
    ) -> Result<()> {
        let keyword = kind.keyword();
        let pieces = if text.is_empty() {
            vec![""]
        } else {
            card::wrap_words(text, COMMENTARY_TEXT_LEN)
        };
        let cards = pieces
            .iter()
            .map(|piece| Card::new(keyword, *piece, None))
            .collect::<Result<Vec<_>>>()?;

        let len = self.cards.len();
        let pos = match anchor {
            Some(Anchor::Before(key)) => self.index_of(key, 0)?,
            Some(Anchor::After(key)) => self.index_of(key, 0)? + 1,
            Some(Anchor::BeforeIndex(i)) if i <= len => i,
            Some(Anchor::AfterIndex(i)) if i < len => i + 1,
            Some(Anchor::BeforeIndex(i) | Anchor::AfterIndex(i)) => {
                return Err(Error::IndexOutOfRange { index: i, len });
            }
            None => {
                let padding = self.padding();
                if kind == Commentary::Blank && text.trim().is_empty() && padding > 0 {
                    return Ok(());
                }
                let body = len - padding;
                let last = match kind {
                    Commentary::Blank => None,
                    _ => self
                        .index
                        .get(keyword)
                        .and_then(|ps| ps.iter().rev().find(|&&p| p < body).copied()),
                };
                match last {
                    Some(p) => p + 1,
                    None => {
                        for card in cards {
                            self.append(card)?;
                        }
                        return Ok(());
                    }
                }
            }
        };
        for (i, card) in cards.into_iter().enumerate() {
            self.insert(pos + i, card)?;
        }
        Ok(())
    }

    /// Re-key the first card with `old` by building a new card.
    ///
    /// Renaming to `CONTINUE` or `END`, or between commentary and valued
    /// keywords, is refused. Unless `force` is set, `new` must not already be
    /// present. A record-valued card keeps its field specifier when `new`
    /// names none.
    pub fn rename_keyword(&mut self, old: &str, new: &str, force: bool) -> Result<()> {
        let new_key = normalize_key(new);
        if new_key == CONTINUE_KEYWORD || new_key == "END" {
            return Err(Error::MalformedKeyword(new_key));
        }
        let pos = self.index_of(old, 0)?;
        let card = &self.cards[pos];
        if card.is_commentary() != is_commentary_keyword(&new_key) {
            return Err(Error::MalformedKeyword(format!(
                "cannot rename {old} to {new}: commentary and valued keywords do not mix"
            )));
        }
        if !force && normalize_key(old) != new_key && self.contains(new) {
            return Err(Error::DuplicateKey(new_key));
        }

        let name = match card.field_specifier() {
            Some(field) if !new.contains('.') => format!("{}.{field}", new.trim()),
            _ => new.trim().to_string(),
        };
        let value = card.value()?.clone();
        let comment = if card.is_commentary() {
            None
        } else {
            card.comment()?.map(str::to_string)
        };
        let renamed = Card::new(&name, value, comment.as_deref())?;
        self.cards[pos] = renamed;
        self.reindex();
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = &'a Card;
    type IntoIter = core::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.cards.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;
    use crate::config::Verify;

    fn rec(s: &str) -> String {
        format!("{s:<80}")
    }

    fn header_bytes(records: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for r in records {
            out.extend_from_slice(rec(r).as_bytes());
        }
        out.extend_from_slice(rec("END").as_bytes());
        pad_in_place(&mut out, PadKind::Header);
        out
    }

    fn sample() -> Header {
        let mut h = Header::new();
        h.append(Card::new("SIMPLE", true, Some("conforms to FITS standard")).unwrap())
            .unwrap();
        h.append(Card::new("BITPIX", 16i64, None).unwrap()).unwrap();
        h.append(Card::new("NAXIS", 0i64, None).unwrap()).unwrap();
        h.append(Card::new("HISTORY", "created", None).unwrap())
            .unwrap();
        h.append(Card::new("OBJECT", "M31", None).unwrap()).unwrap();
        h
    }

    /// Every index entry points at a card carrying that key, and every card
    /// is indexed exactly under its keys.
    fn assert_consistent(h: &Header) {
        let mut entries = 0;
        for (key, positions) in &h.index {
            assert!(!positions.is_empty());
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "{key} unsorted");
            for &p in positions {
                let (k, base) = index_keys(&h.cards[p]);
                assert!(&k == key || base.as_ref() == Some(key), "{key} -> {p}");
            }
            entries += positions.len();
        }
        let expected: usize = h
            .cards
            .iter()
            .map(|c| 1 + usize::from(index_keys(c).1.is_some()))
            .sum();
        assert_eq!(entries, expected);
    }

    // --- parsing ---

    #[test]
    fn parse_minimal_header() {
        let bytes = header_bytes(&[
            "SIMPLE  =                    T / conforms to FITS standard",
            "BITPIX  =                    8",
            "NAXIS   =                    0",
        ]);
        let h = Header::parse(&bytes, &Config::default()).unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.get_bool("SIMPLE"), Some(true));
        assert_eq!(h.get_int("bitpix"), Some(8));
        assert_consistent(&h);
    }

    #[test]
    fn parse_then_serialize_is_identical() {
        let bytes = header_bytes(&[
            "SIMPLE  =                    T",
            "BITPIX  =                  -32 / IEEE single",
            "EXPTIME =              1.5E+02",
            "COMMENT   free text",
            "",
            "",
        ]);
        let h = Header::parse(&bytes, &Config::default()).unwrap();
        assert_eq!(h.padding(), 2);
        assert_eq!(h.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn parse_gathers_continue_records() {
        let long = "x".repeat(75);
        let card = Card::new("LONGSTR", long.as_str(), None).unwrap();
        let image = card.image().unwrap().to_string();
        assert_eq!(image.len(), 2 * CARD_SIZE);

        let mut bytes = image.into_bytes();
        bytes.extend_from_slice(rec("END").as_bytes());
        pad_in_place(&mut bytes, PadKind::Header);
        let h = Header::parse(&bytes, &Config::default()).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get_str("LONGSTR"), Some(long.as_str()));
    }

    #[test]
    fn orphan_continue_is_kept_as_its_own_card() {
        let bytes = header_bytes(&["NAXIS   =                    0", "CONTINUE  'stray'"]);
        let h = Header::parse(&bytes, &Config::default()).unwrap();
        assert_eq!(h.len(), 2);
        assert!(h.contains("CONTINUE"));
    }

    #[test]
    fn missing_end_is_an_error() {
        let bytes = rec("NAXIS   =                    0").into_bytes();
        assert!(matches!(
            Header::parse(&bytes, &Config::default()),
            Err(Error::MissingTerminator)
        ));
    }

    #[test]
    fn missing_end_tolerated_when_configured() {
        let bytes = rec("NAXIS   =                    0").into_bytes();
        let config = Config::default().with_tolerate_missing_end(true);
        let h = Header::parse(&bytes, &config).unwrap();
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn partial_record_is_truncated_input() {
        assert!(matches!(
            Header::parse(b"SIMPLE  =", &Config::default()),
            Err(Error::TruncatedInput)
        ));
    }

    #[test]
    fn strict_verify_rejects_lowercase_keyword() {
        let bytes = header_bytes(&["naxis   =                    0"]);
        let config = Config::default().with_verify(Verify::Exception);
        assert!(matches!(
            Header::parse(&bytes, &config),
            Err(Error::MalformedKeyword(_))
        ));
    }

    #[test]
    fn fix_verify_repairs_while_parsing() {
        let bytes = header_bytes(&["EXPTIME =              1.5d2"]);
        let config = Config::default().with_verify(Verify::SilentFix);
        let h = Header::parse(&bytes, &config).unwrap();
        assert_eq!(h.get_float("EXPTIME"), Some(150.0));
        assert!(h.card(0).unwrap().image().unwrap().contains("1.5D2"));
    }

    #[test]
    fn end_offset_finds_sentinel() {
        let bytes = header_bytes(&["SIMPLE  =                    T"]);
        assert_eq!(end_offset(&bytes), Some(2 * CARD_SIZE));
        assert_eq!(end_offset(&bytes[..CARD_SIZE]), None);
    }

    // --- serialization ---

    #[test]
    fn to_bytes_is_block_aligned() {
        let h = sample();
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert!(bytes[5 * CARD_SIZE..].starts_with(b"END     "));
        assert!(bytes[6 * CARD_SIZE..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn empty_header_serializes_to_end_only() {
        let bytes = Header::new().to_bytes().unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert!(is_end_record(&bytes[..CARD_SIZE]));
    }

    // --- lookup ---

    #[test]
    fn lookup_by_occurrence() {
        let mut h = sample();
        h.append(Card::new("HISTORY", "second", None).unwrap())
            .unwrap();
        assert_eq!(h.count("HISTORY"), 2);
        assert_eq!(
            h.lookup("HISTORY", 1).unwrap().value().unwrap(),
            &Value::from("second")
        );
        assert!(matches!(
            h.lookup("HISTORY", 2),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn lookup_missing_key() {
        let h = sample();
        assert!(!h.contains("EXTNAME"));
        assert!(matches!(h.lookup("EXTNAME", 0), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn hierarch_lookup_ignores_case_and_prefix() {
        let mut h = Header::new();
        h.append(Card::new("HIERARCH ESO DET chip", 3i64, None).unwrap())
            .unwrap();
        assert_eq!(h.get_int("HIERARCH ESO DET CHIP"), Some(3));
        assert_eq!(h.get_int("eso det chip"), Some(3));
    }

    #[test]
    fn record_valued_lookup_and_base_delete() {
        let mut h = Header::new();
        h.append(Card::new("DP1", "NAXES: 2", None).unwrap()).unwrap();
        h.append(Card::new("DP1.AXIS.1", 1i64, None).unwrap()).unwrap();
        h.append(Card::new("NAXIS", 2i64, None).unwrap()).unwrap();
        assert_eq!(h.get_float("DP1.NAXES"), Some(2.0));
        assert_eq!(h.get_float("dp1.AXIS.1"), Some(1.0));
        assert_eq!(h.count("DP1"), 2);
        assert_consistent(&h);

        assert_eq!(h.delete("DP1").unwrap(), 2);
        assert_eq!(h.len(), 1);
        assert!(!h.contains("DP1.AXIS.1"));
        assert_consistent(&h);
    }

    #[test]
    fn extname_matching_respects_config() {
        let mut h = Header::new();
        h.set("EXTNAME", "SCI", None).unwrap();
        assert!(h.matches_extname("sci", &Config::default()));
        assert!(!h.matches_extname("sci", &Config::default().with_case_sensitive_names(true)));
        assert!(h.matches_extname("SCI", &Config::default().with_case_sensitive_names(true)));
    }

    // --- set ---

    #[test]
    fn set_updates_first_occurrence_in_place() {
        let mut h = sample();
        h.set("BITPIX", -32i64, None).unwrap();
        assert_eq!(h.len(), 5);
        assert_eq!(h.index_of("BITPIX", 0).unwrap(), 1);
        assert_eq!(h.get_int("BITPIX"), Some(-32));
        assert!(h.card(1).unwrap().image().unwrap().contains("-32"));
    }

    #[test]
    fn set_keeps_comment_when_none_given() {
        let mut h = sample();
        h.set("SIMPLE", false, None).unwrap();
        assert_eq!(
            h.get("SIMPLE").unwrap().comment().unwrap(),
            Some("conforms to FITS standard")
        );
    }

    #[test]
    fn set_appends_new_keyword() {
        let mut h = sample();
        h.set("EXTNAME", "SCI", Some("science")).unwrap();
        assert_eq!(h.len(), 6);
        assert_eq!(h.extname(), Some("SCI"));
    }

    #[test]
    fn set_never_duplicates() {
        let mut h = sample();
        h.set("OBJECT", "M33", None).unwrap();
        h.set("OBJECT", "M81", None).unwrap();
        assert_eq!(h.count("OBJECT"), 1);
    }

    #[test]
    fn set_commentary_adds_cards() {
        let mut h = sample();
        h.set("HISTORY", "processed", None).unwrap();
        assert_eq!(h.count("HISTORY"), 2);
        assert_eq!(h.index_of("HISTORY", 1).unwrap(), 4);
    }

    #[test]
    fn rejected_set_leaves_header_untouched() {
        let mut h = sample();
        let before = h.to_bytes().unwrap();
        assert!(h.set("OBJECT", "bad\u{7}text", None).is_err());
        assert!(h.set("WAY_TOO_LONG", 1i64, None).is_err());
        assert_eq!(h.to_bytes().unwrap(), before);
    }

    // --- append / insert / padding ---

    #[test]
    fn append_consumes_padding() {
        let mut h = sample();
        for _ in 0..3 {
            h.append(Card::blank()).unwrap();
        }
        assert_eq!(h.padding(), 3);
        h.append(Card::new("EXTEND", true, None).unwrap()).unwrap();
        assert_eq!(h.len(), 8);
        assert_eq!(h.padding(), 2);
        assert_eq!(h.index_of("EXTEND", 0).unwrap(), 5);
        assert_consistent(&h);
    }

    #[test]
    fn long_card_consumes_one_blank_per_record() {
        let mut h = sample();
        for _ in 0..3 {
            h.append(Card::blank()).unwrap();
        }
        let card = Card::new("LONGSTR", "y".repeat(100).as_str(), None).unwrap();
        assert_eq!(card.records(), 2);
        h.append(card).unwrap();
        assert_eq!(h.padding(), 1);
        assert_eq!(h.len(), 7);
    }

    #[test]
    fn insert_shifts_index() {
        let mut h = sample();
        h.insert(1, Card::new("EXTEND", true, None).unwrap()).unwrap();
        assert_eq!(h.index_of("EXTEND", 0).unwrap(), 1);
        assert_eq!(h.index_of("BITPIX", 0).unwrap(), 2);
        assert_eq!(h.index_of("OBJECT", 0).unwrap(), 5);
        assert_consistent(&h);
    }

    #[test]
    fn insert_past_end_appends() {
        let mut h = sample();
        h.insert(99, Card::new("EXTEND", true, None).unwrap()).unwrap();
        assert_eq!(h.index_of("EXTEND", 0).unwrap(), 5);
    }

    #[test]
    fn insert_uses_trailing_blanks() {
        let mut h = sample();
        h.append(Card::blank()).unwrap();
        h.insert(0, Card::new("EXTEND", true, None).unwrap()).unwrap();
        assert_eq!(h.len(), 6);
        assert_eq!(h.padding(), 0);
        assert_consistent(&h);
    }

    #[test]
    fn end_card_is_rejected() {
        let mut h = sample();
        assert!(h.append(Card::end()).is_err());
        assert!(h.insert(0, Card::end()).is_err());
        assert!(Header::from_cards([Card::end()]).is_err());
    }

    // --- delete ---

    #[test]
    fn deleting_only_history_card() {
        let mut h = sample();
        assert_eq!(h.len(), 5);
        assert_eq!(h.delete("HISTORY").unwrap(), 1);
        assert_eq!(h.len(), 4);
        assert!(!h.contains("HISTORY"));
        assert_eq!(h.index_of("OBJECT", 0).unwrap(), 3);
        assert_consistent(&h);
    }

    #[test]
    fn delete_removes_all_occurrences() {
        let mut h = sample();
        h.add_commentary(Commentary::History, "two", None).unwrap();
        h.add_commentary(Commentary::History, "three", None).unwrap();
        assert_eq!(h.delete("history").unwrap(), 3);
        assert_eq!(h.len(), 4);
        assert_consistent(&h);
    }

    #[test]
    fn delete_missing_key_fails() {
        let mut h = sample();
        assert!(matches!(h.delete("NOPE"), Err(Error::KeyNotFound(_))));
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn remove_at_shifts_and_checks_bounds() {
        let mut h = sample();
        let removed = h.remove_at(0).unwrap();
        assert_eq!(removed.keyword(), "SIMPLE");
        assert_eq!(h.index_of("BITPIX", 0).unwrap(), 0);
        assert!(matches!(
            h.remove_at(10),
            Err(Error::IndexOutOfRange { index: 10, len: 4 })
        ));
        assert_consistent(&h);
    }

    #[test]
    fn replace_at_keeps_position_and_index() {
        let mut h = sample();
        let old = h
            .replace_at(1, Card::new("BZERO", 32768i64, None).unwrap())
            .unwrap();
        assert_eq!(old.keyword(), "BITPIX");
        assert!(!h.contains("BITPIX"));
        assert_eq!(h.index_of("BZERO", 0).unwrap(), 1);
        assert!(h.replace_at(1, Card::end()).is_err());
        assert!(matches!(
            h.replace_at(10, Card::blank()),
            Err(Error::IndexOutOfRange { index: 10, .. })
        ));
        assert_consistent(&h);
    }

    #[test]
    fn delete_recomputes_padding() {
        let mut cards: Vec<Card> = sample().iter().cloned().collect();
        cards.push(Card::blank());
        cards.push(Card::new("COMMENT", "x", None).unwrap());
        let mut h = Header::from_cards(cards).unwrap();
        assert_eq!(h.padding(), 0);
        h.delete("COMMENT").unwrap();
        assert_eq!(h.padding(), 1);
    }

    // --- commentary ---

    #[test]
    fn commentary_goes_after_last_of_its_kind() {
        let mut h = sample();
        h.add_commentary(Commentary::History, "later", None).unwrap();
        assert_eq!(h.index_of("HISTORY", 1).unwrap(), 4);
        assert_eq!(h.index_of("OBJECT", 0).unwrap(), 5);
    }

    #[test]
    fn commentary_appended_when_kind_absent() {
        let mut h = sample();
        h.append(Card::blank()).unwrap();
        h.add_commentary(Commentary::Comment, "note", None).unwrap();
        assert_eq!(h.index_of("COMMENT", 0).unwrap(), 5);
        assert_eq!(h.len(), 6);
        assert_eq!(h.padding(), 0);
    }

    #[test]
    fn commentary_with_anchors() {
        let mut h = sample();
        h.add_commentary(Commentary::Comment, "before naxis", Some(Anchor::Before("NAXIS")))
            .unwrap();
        assert_eq!(h.index_of("COMMENT", 0).unwrap(), 2);
        h.add_commentary(Commentary::Comment, "after simple", Some(Anchor::After("SIMPLE")))
            .unwrap();
        assert_eq!(h.index_of("COMMENT", 0).unwrap(), 1);
        h.add_commentary(Commentary::Comment, "at end", Some(Anchor::AfterIndex(6)))
            .unwrap();
        assert_eq!(h.index_of("COMMENT", 2).unwrap(), 7);
        assert!(matches!(
            h.add_commentary(Commentary::Comment, "x", Some(Anchor::BeforeIndex(20))),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(h
            .add_commentary(Commentary::Comment, "x", Some(Anchor::Before("MISSING")))
            .is_err());
        assert_consistent(&h);
    }

    #[test]
    fn long_commentary_is_split() {
        let mut h = Header::new();
        let text = "word ".repeat(30);
        h.add_commentary(Commentary::History, text.trim_end(), None)
            .unwrap();
        assert_eq!(h.count("HISTORY"), 3);
        let joined: String = h
            .iter()
            .map(|c| c.value().unwrap().as_str().unwrap().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(joined.split_whitespace().count(), 30);
    }

    #[test]
    fn blank_commentary_fills_padding_slot() {
        let mut h = sample();
        h.append(Card::blank()).unwrap();
        h.add_commentary(Commentary::Blank, "", None).unwrap();
        assert_eq!(h.len(), 6);
        assert_eq!(h.padding(), 1);

        h.delete("").unwrap();
        h.add_commentary(Commentary::Blank, "", None).unwrap();
        assert_eq!(h.len(), 6);
    }

    #[test]
    fn blank_keyword_text_goes_to_the_bottom() {
        let mut h = sample();
        h.insert(1, Card::new("", "spacer", None).unwrap()).unwrap();
        h.append(Card::blank()).unwrap();
        h.append(Card::blank()).unwrap();
        assert_eq!(h.len(), 8);

        h.add_commentary(Commentary::Blank, "trailing note", None)
            .unwrap();
        assert_eq!(h.len(), 8);
        assert_eq!(h.padding(), 1);
        let note = h.cards()[6].value().unwrap();
        assert_eq!(note.as_str(), Some("trailing note"));
        assert_eq!(h.index_of("", 0).unwrap(), 1);
        assert_consistent(&h);
    }

    // --- rename ---

    #[test]
    fn rename_keeps_position_value_and_comment() {
        let mut h = sample();
        h.rename_keyword("SIMPLE", "XSIMPLE", false).unwrap();
        assert!(!h.contains("SIMPLE"));
        let card = h.lookup("XSIMPLE", 0).unwrap();
        assert_eq!(card.value().unwrap(), &Value::Logical(true));
        assert_eq!(card.comment().unwrap(), Some("conforms to FITS standard"));
        assert_eq!(h.index_of("XSIMPLE", 0).unwrap(), 0);
        assert_consistent(&h);
    }

    #[test]
    fn rename_refuses_duplicates_unless_forced() {
        let mut h = sample();
        assert!(matches!(
            h.rename_keyword("BITPIX", "NAXIS", false),
            Err(Error::DuplicateKey(_))
        ));
        h.rename_keyword("BITPIX", "NAXIS", true).unwrap();
        assert_eq!(h.count("NAXIS"), 2);
        assert_consistent(&h);
    }

    #[test]
    fn rename_refuses_continue_and_kind_mixing() {
        let mut h = sample();
        assert!(h.rename_keyword("OBJECT", "CONTINUE", false).is_err());
        assert!(h.rename_keyword("OBJECT", "HISTORY", false).is_err());
        assert!(h.rename_keyword("HISTORY", "OBJECT2", false).is_err());
        h.rename_keyword("HISTORY", "COMMENT", false).unwrap();
        assert!(h.contains("COMMENT"));
    }

    #[test]
    fn rename_record_valued_keeps_field() {
        let mut h = Header::new();
        h.append(Card::new("DP1.AXIS.1", 1i64, None).unwrap()).unwrap();
        h.rename_keyword("DP1.AXIS.1", "DQ1", false).unwrap();
        assert_eq!(h.get_float("DQ1.AXIS.1"), Some(1.0));
        assert_consistent(&h);
    }
}
