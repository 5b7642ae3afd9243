//! Header values and the value/comment field grammar.
//!
//! The grammar is `<spaces>[<value>]<spaces>[/ <comment>]`, where `<value>` is a
//! quoted string, `T`/`F`, a number, a `(real, imag)` pair, or nothing. Two
//! dialects exist: [`Grammar::Strict`] is the fixed format of the standard,
//! [`Grammar::Lenient`] tolerates spaces around signs and exponents, lower-case
//! exponent markers and arbitrary comment bytes.

use alloc::format;
use alloc::string::{String, ToString};

/// A header value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Character string (content between single quotes, trailing spaces dropped).
    String(String),
    /// Logical value (`T` or `F`).
    Logical(bool),
    /// Integer value.
    Integer(i64),
    /// Floating-point value.
    Float(f64),
    /// Complex `(real, imaginary)` pair.
    Complex(f64, f64),
    /// The card has a value indicator but no value.
    Undefined,
    /// The card carries no value at all (`END`).
    Absent,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer or float value as `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

/// Which dialect of the value grammar to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    /// Fixed format: no embedded spaces in numbers, upper-case `D`/`E` exponents,
    /// printable comments.
    Strict,
    /// Free format used for reading and repairing non-conforming cards.
    Lenient,
}

/// Result of matching a value/comment field.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueField<'a> {
    pub value: Value,
    /// Source text of a numeric value exactly as it appeared.
    pub value_text: Option<&'a str>,
    /// Comment with surrounding spaces removed; `None` when absent or empty.
    pub comment: Option<&'a str>,
}

pub(crate) fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b)
}

fn skip_spaces(b: &[u8], mut i: usize) -> usize {
    while i < b.len() && b[i] == b' ' {
        i += 1;
    }
    i
}

/// Match `<spaces>[/ <comment>]$` starting at `i`.
///
/// Returns `Some(comment)` on a match, where the inner option is `None` when no
/// comment text is present.
fn match_tail(text: &str, i: usize, grammar: Grammar) -> Option<Option<&str>> {
    let b = text.as_bytes();
    let i = skip_spaces(b, i);
    if i == b.len() {
        return Some(None);
    }
    if b[i] != b'/' {
        return None;
    }
    let start = skip_spaces(b, i + 1);
    let comment = &text[start..];
    if grammar == Grammar::Strict && !comment.bytes().all(is_printable) {
        return None;
    }
    let comment = comment.trim_end();
    Some(if comment.is_empty() {
        None
    } else {
        Some(comment)
    })
}

/// True if position `i` may directly follow a closing quote.
fn quote_lookahead(b: &[u8], i: usize) -> bool {
    i == b.len() || b[i] == b'/' || b[i] == b' '
}

/// Match a quoted string starting at `start` (which holds the opening quote).
///
/// Doubled quotes are literal quotes. A lone quote closes the string only when
/// the remainder of the field is a valid tail; otherwise it is kept as text and
/// scanning continues, so the shortest consistent string wins.
fn match_string<'a>(
    text: &'a str,
    start: usize,
    grammar: Grammar,
) -> Option<(String, Option<&'a str>)> {
    let b = text.as_bytes();
    let mut i = start + 1;
    while i < b.len() {
        if !is_printable(b[i]) {
            return None;
        }
        if b[i] == b'\'' {
            if i + 1 < b.len() && b[i + 1] == b'\'' {
                i += 2;
                continue;
            }
            if quote_lookahead(b, i + 1) {
                if let Some(comment) = match_tail(text, i + 1, grammar) {
                    let inner = text[start + 1..i].replace("''", "'");
                    return Some((inner.trim_end().to_string(), comment));
                }
            }
        }
        i += 1;
    }
    None
}

fn scan_digits(b: &[u8], i: usize) -> usize {
    let mut j = i;
    while j < b.len() && b[j].is_ascii_digit() {
        j += 1;
    }
    j
}

/// Scan a number starting at `i`, returning the index one past its end.
///
/// Lenient: `[+-]? *(\.\d+|\d+(\.\d*)?) *([deDE] *[+-]? *\d+)?`
/// Strict:  `[+-]?(\.\d+|\d+(\.\d*)?)([DE][+-]?\d+)?`
fn scan_number(b: &[u8], i: usize, grammar: Grammar) -> Option<usize> {
    let lenient = grammar == Grammar::Lenient;
    let mut p = i;
    if p < b.len() && (b[p] == b'+' || b[p] == b'-') {
        p += 1;
        if lenient {
            p = skip_spaces(b, p);
        }
    }
    if p < b.len() && b[p] == b'.' {
        let end = scan_digits(b, p + 1);
        if end == p + 1 {
            return None;
        }
        p = end;
    } else {
        let end = scan_digits(b, p);
        if end == p {
            return None;
        }
        p = end;
        if p < b.len() && b[p] == b'.' {
            p = scan_digits(b, p + 1);
        }
    }

    // The exponent is optional; only consume it when complete.
    let mut q = if lenient { skip_spaces(b, p) } else { p };
    let is_marker = |c: u8| match grammar {
        Grammar::Strict => c == b'D' || c == b'E',
        Grammar::Lenient => matches!(c, b'd' | b'D' | b'e' | b'E'),
    };
    if q < b.len() && is_marker(b[q]) {
        q += 1;
        if lenient {
            q = skip_spaces(b, q);
        }
        if q < b.len() && (b[q] == b'+' || b[q] == b'-') {
            q += 1;
            if lenient {
                q = skip_spaces(b, q);
            }
        }
        let end = scan_digits(b, q);
        if end > q {
            p = end;
        }
    }
    Some(p)
}

/// Canonical numeric text: spaces removed, exponent marker upper-cased, leading
/// zeros of the integer part stripped (keeping the sign).
///
/// With `keep_d` a `D` exponent stays `D`; otherwise every marker becomes `E`.
pub(crate) fn normalize_number(raw: &str, keep_d: bool) -> String {
    let mut digits: String = raw
        .chars()
        .filter(|c| *c != ' ')
        .map(|c| match c {
            'd' | 'D' if keep_d => 'D',
            'd' | 'D' | 'e' => 'E',
            other => other,
        })
        .collect();
    let sign = if digits.starts_with('+') || digits.starts_with('-') {
        let s = digits.remove(0);
        Some(s)
    } else {
        None
    };
    let stripped = digits.trim_start_matches('0');
    let body = if stripped.is_empty() || !stripped.as_bytes()[0].is_ascii_digit() {
        // Keep one zero in front of `.5`, `E3` or an all-zero integer.
        if digits.starts_with('0') {
            format!("0{stripped}")
        } else {
            stripped.to_string()
        }
    } else {
        stripped.to_string()
    };
    match sign {
        Some(s) => format!("{s}{body}"),
        None => body,
    }
}

/// Convert canonical numeric text to an integer when possible, else a float.
fn number_value(canonical: &str) -> Option<Value> {
    let is_integral = !canonical.contains('.') && !canonical.contains('E');
    if is_integral {
        if let Ok(n) = canonical.parse::<i64>() {
            return Some(Value::Integer(n));
        }
    }
    canonical.parse::<f64>().ok().map(Value::Float)
}

fn number_to_f64(raw: &str) -> Option<f64> {
    normalize_number(raw, false).parse::<f64>().ok()
}

/// Match the whole of `text` (surrounding spaces allowed) as one number.
pub(crate) fn parse_number(text: &str, grammar: Grammar) -> Option<Value> {
    let b = text.as_bytes();
    let start = skip_spaces(b, 0);
    let end = scan_number(b, start, grammar)?;
    if skip_spaces(b, end) != b.len() {
        return None;
    }
    number_value(&normalize_number(&text[start..end], false))
}

/// Match `\( *num *, *num *\)` starting at the opening parenthesis.
type ComplexSpans = (usize, usize, usize, usize, usize);

fn match_complex(b: &[u8], start: usize, grammar: Grammar) -> Option<ComplexSpans> {
    let mut p = skip_spaces(b, start + 1);
    let re_start = p;
    let re_end = scan_number(b, p, grammar)?;
    p = skip_spaces(b, re_end);
    if p >= b.len() || b[p] != b',' {
        return None;
    }
    p = skip_spaces(b, p + 1);
    let im_start = p;
    let im_end = scan_number(b, p, grammar)?;
    p = skip_spaces(b, im_end);
    if p >= b.len() || b[p] != b')' {
        return None;
    }
    Some((re_start, re_end, im_start, im_end, p + 1))
}

/// Match a value/comment field against the value grammar.
///
/// `text` is everything after the value indicator. Returns `None` if the field
/// does not match.
pub fn parse_value_field(text: &str, grammar: Grammar) -> Option<ValueField<'_>> {
    let b = text.as_bytes();
    let start = skip_spaces(b, 0);

    if start < b.len() {
        match b[start] {
            b'\'' => {
                if let Some((s, comment)) = match_string(text, start, grammar) {
                    return Some(ValueField {
                        value: Value::String(s),
                        value_text: None,
                        comment,
                    });
                }
            }
            b'T' | b'F' => {
                if let Some(comment) = match_tail(text, start + 1, grammar) {
                    return Some(ValueField {
                        value: Value::Logical(b[start] == b'T'),
                        value_text: None,
                        comment,
                    });
                }
            }
            b'(' => {
                if let Some((rs, re, is, ie, end)) = match_complex(b, start, grammar) {
                    if let Some(comment) = match_tail(text, end, grammar) {
                        let real = number_to_f64(&text[rs..re])?;
                        let imag = number_to_f64(&text[is..ie])?;
                        return Some(ValueField {
                            value: Value::Complex(real, imag),
                            value_text: Some(&text[start..end]),
                            comment,
                        });
                    }
                }
            }
            _ => {
                if let Some(end) = scan_number(b, start, grammar) {
                    if let Some(comment) = match_tail(text, end, grammar) {
                        let raw = &text[start..end];
                        let value = number_value(&normalize_number(raw, false))?;
                        return Some(ValueField {
                            value,
                            value_text: Some(raw),
                            comment,
                        });
                    }
                }
            }
        }
    }

    match_tail(text, start, grammar).map(|comment| ValueField {
        value: Value::Undefined,
        value_text: None,
        comment,
    })
}

/// Render a float with 16 significant digits in the style of C's `%.16G`,
/// forced to carry a decimal point or exponent and kept within 20 characters.
pub fn format_float(v: f64) -> String {
    let mut s = format_general(v);
    if !s.contains('.') && !s.contains('E') {
        s.push_str(".0");
    }
    if s.len() > 20 {
        match s.find('E') {
            Some(idx) => {
                let exponent = s[idx..].to_string();
                s.truncate(20 - exponent.len());
                s.push_str(&exponent);
            }
            None => s.truncate(20),
        }
    }
    s
}

fn trim_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn format_general(v: f64) -> String {
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let sci = format!("{:.15e}", v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if !(-4..16).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}E{}{:02}", trim_fraction_zeros(mantissa), sign, exp.unsigned_abs())
    } else {
        let decimals = (15 - exp) as usize;
        let fixed = format!("{:.*}", decimals, v);
        trim_fraction_zeros(&fixed).to_string()
    }
}

/// Quote a string value: embedded quotes doubled, at least 8 characters
/// between the quotes. The empty string renders as `''`.
pub fn quote_string(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    format!("'{:<8}'", s.replace('\'', "''"))
}

/// Render the value part of a card, laid out for columns 11 onwards.
///
/// Strings are left-justified and padded to 20 columns; everything else is
/// right-justified to 20 columns. `original` is the source text of an
/// unmodified numeric value and is preferred when present.
pub fn format_value(value: &Value, original: Option<&str>) -> String {
    if let Some(text) = original {
        if matches!(value, Value::Integer(_) | Value::Float(_) | Value::Complex(..)) {
            return format!("{:>20}", text.trim());
        }
    }
    match value {
        Value::String(s) => format!("{:<20}", quote_string(s)),
        Value::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
        Value::Integer(n) => format!("{n:>20}"),
        Value::Float(f) => format!("{:>20}", format_float(*f)),
        Value::Complex(re, im) => {
            let pair = format!("({}, {})", format_float(*re), format_float(*im));
            format!("{pair:>20}")
        }
        Value::Undefined | Value::Absent => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient(text: &str) -> ValueField<'_> {
        parse_value_field(text, Grammar::Lenient).expect("field should parse")
    }

    // --- strings ---

    #[test]
    fn parse_simple_string() {
        let f = lenient(" 'NGC 1234'           / object name");
        assert_eq!(f.value, Value::String("NGC 1234".into()));
        assert_eq!(f.comment, Some("object name"));
    }

    #[test]
    fn parse_string_drops_trailing_spaces() {
        let f = lenient(" 'abc     '");
        assert_eq!(f.value, Value::String("abc".into()));
        assert_eq!(f.comment, None);
    }

    #[test]
    fn parse_string_with_doubled_quotes() {
        let f = lenient(" 'it''s ok'");
        assert_eq!(f.value, Value::String("it's ok".into()));
    }

    #[test]
    fn parse_string_with_slash_inside() {
        let f = lenient(" 'a / b'  / real comment");
        assert_eq!(f.value, Value::String("a / b".into()));
        assert_eq!(f.comment, Some("real comment"));
    }

    #[test]
    fn parse_string_quote_then_slash_inside() {
        let f = lenient(" 'a'' /b  '");
        assert_eq!(f.value, Value::String("a' /b".into()));
    }

    #[test]
    fn parse_empty_string() {
        let f = lenient(" ''");
        assert_eq!(f.value, Value::String(String::new()));
    }

    #[test]
    fn parse_blank_string_is_empty() {
        let f = lenient(" '        '");
        assert_eq!(f.value, Value::String(String::new()));
    }

    #[test]
    fn parse_string_lone_quote_kept_when_tail_fails() {
        let f = lenient(" 'abc' xyz'");
        assert_eq!(f.value, Value::String("abc' xyz".into()));
    }

    #[test]
    fn unterminated_string_fails() {
        assert!(parse_value_field(" 'abc", Grammar::Lenient).is_none());
    }

    // --- logicals ---

    #[test]
    fn parse_logical() {
        assert_eq!(lenient("                    T").value, Value::Logical(true));
        assert_eq!(lenient(" F / no").value, Value::Logical(false));
    }

    #[test]
    fn parse_logical_word_fails() {
        assert!(parse_value_field(" TRUE", Grammar::Lenient).is_none());
    }

    // --- numbers ---

    #[test]
    fn parse_integer() {
        let f = lenient("                   42 / answer");
        assert_eq!(f.value, Value::Integer(42));
        assert_eq!(f.value_text, Some("42"));
        assert_eq!(f.comment, Some("answer"));
    }

    #[test]
    fn parse_negative_integer() {
        assert_eq!(lenient(" -32").value, Value::Integer(-32));
    }

    #[test]
    fn parse_leading_zeros() {
        assert_eq!(lenient(" 0010").value, Value::Integer(10));
        assert_eq!(lenient(" 000").value, Value::Integer(0));
    }

    #[test]
    fn parse_float_forms() {
        assert_eq!(lenient(" 3.5").value, Value::Float(3.5));
        assert_eq!(lenient(" .5").value, Value::Float(0.5));
        assert_eq!(lenient(" 5.").value, Value::Float(5.0));
        assert_eq!(lenient(" 1.5E3").value, Value::Float(1500.0));
        assert_eq!(lenient(" 1.5D-2").value, Value::Float(0.015));
    }

    #[test]
    fn integer_overflow_falls_back_to_float() {
        match lenient(" 99999999999999999999").value {
            Value::Float(f) => assert!((f - 1e20).abs() < 1e6),
            other => panic!("Expected Float, got {:?}", other),
        }
    }

    #[test]
    fn lenient_number_allows_spaces_and_lowercase() {
        assert_eq!(lenient(" - 1.5 e 2").value, Value::Float(-150.0));
    }

    #[test]
    fn strict_number_rejects_spaces() {
        assert!(parse_value_field(" - 1.5 e 2", Grammar::Strict).is_none());
        assert!(parse_value_field(" 1.5e2", Grammar::Strict).is_none());
        assert!(parse_value_field(" 1.5E2", Grammar::Strict).is_some());
    }

    #[test]
    fn incomplete_exponent_fails() {
        assert!(parse_value_field(" 1.5E", Grammar::Lenient).is_none());
    }

    // --- complex ---

    #[test]
    fn parse_complex_pair() {
        let f = lenient(" (1.5, -2) / c");
        assert_eq!(f.value, Value::Complex(1.5, -2.0));
        assert_eq!(f.comment, Some("c"));
    }

    #[test]
    fn parse_complex_missing_paren_fails() {
        assert!(parse_value_field(" (1.5, 2", Grammar::Lenient).is_none());
    }

    // --- undefined / comments ---

    #[test]
    fn parse_undefined() {
        assert_eq!(lenient("").value, Value::Undefined);
        let f = lenient("          / only a comment");
        assert_eq!(f.value, Value::Undefined);
        assert_eq!(f.comment, Some("only a comment"));
    }

    #[test]
    fn empty_comment_is_none() {
        assert_eq!(lenient(" 5 /   ").comment, None);
    }

    #[test]
    fn garbage_fails() {
        assert!(parse_value_field(" hello", Grammar::Lenient).is_none());
        assert!(parse_value_field(" 5 6", Grammar::Lenient).is_none());
    }

    // --- normalize_number ---

    #[test]
    fn normalize_keeps_sign_and_strips_zeros() {
        assert_eq!(normalize_number("-007", false), "-7");
        assert_eq!(normalize_number("+ 1.5 d 3", false), "+1.5E3");
        assert_eq!(normalize_number("0.25", false), "0.25");
        assert_eq!(normalize_number("00", false), "0");
        assert_eq!(normalize_number(".5", false), ".5");
    }

    #[test]
    fn normalize_can_keep_d_exponent() {
        assert_eq!(normalize_number("1.5 d 3", true), "1.5D3");
        assert_eq!(normalize_number("2e5", true), "2E5");
    }

    #[test]
    fn parse_whole_number() {
        assert_eq!(parse_number(" 2.5 ", Grammar::Lenient), Some(Value::Float(2.5)));
        assert_eq!(parse_number("7", Grammar::Strict), Some(Value::Integer(7)));
        assert_eq!(parse_number("7 x", Grammar::Lenient), None);
    }

    // --- format_float ---

    #[test]
    fn format_float_simple() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.0), "0.0");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(1500.0), "1500.0");
    }

    #[test]
    fn format_float_exponents() {
        assert_eq!(format_float(1e20), "1E+20");
        assert_eq!(format_float(1.5e-5), "1.5E-05");
        assert_eq!(format_float(-1e-300), "-1E-300");
    }

    #[test]
    fn format_float_sixteen_digits() {
        assert_eq!(format_float(1.0 / 3.0), "0.3333333333333333");
        assert_eq!(format_float(0.1 + 0.2), "0.3");
    }

    #[test]
    fn format_float_truncates_keeping_exponent() {
        let s = format_float(-1.234567890123456e-100);
        assert_eq!(s.len(), 20);
        assert!(s.ends_with("E-100"));
        assert!(s.starts_with("-1.23456789012"));
    }

    // --- format_value ---

    #[test]
    fn format_string_min_width() {
        assert_eq!(format_value(&Value::from("ab"), None), "'ab      '          ");
        assert_eq!(format_value(&Value::from(""), None), "''                  ");
    }

    #[test]
    fn format_string_doubles_quotes() {
        assert_eq!(quote_string("it's"), "'it''s   '");
    }

    #[test]
    fn format_right_justified() {
        assert_eq!(format_value(&Value::Logical(true), None), format!("{:>20}", "T"));
        assert_eq!(format_value(&Value::Integer(-7), None), format!("{:>20}", "-7"));
        assert_eq!(format_value(&Value::Float(2.0), None), format!("{:>20}", "2.0"));
    }

    #[test]
    fn format_complex() {
        assert_eq!(
            format_value(&Value::Complex(1.0, -2.5), None),
            format!("{:>20}", "(1.0, -2.5)")
        );
    }

    #[test]
    fn format_prefers_original_text() {
        assert_eq!(
            format_value(&Value::Float(1500.0), Some("1.5D3")),
            format!("{:>20}", "1.5D3")
        );
    }

    #[test]
    fn format_undefined_is_empty() {
        assert_eq!(format_value(&Value::Undefined, None), "");
    }
}
