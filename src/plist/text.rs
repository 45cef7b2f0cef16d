//! Canonical text serialization for property-tree values.
//!
//! The grammar is a small tagged s-expression form:
//!
//! ```text
//! value   := "#t" | "#f" | "i:" int | "u:" uint | "s:" qstring
//!          | "b:" hex | "[" value* "]" | "{" (qstring "=" value ";")* "}"
//! ```
//!
//! Map keys are sorted lexicographically on output so two structurally
//! equal mappings with different insertion orders externalize to
//! byte-identical text. Internalization rejects any tag outside the set
//! above.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::value::{Mapping, Sequence, Value};

/// Errors that can occur while internalizing or externalizing a plist.
#[derive(Debug, thiserror::Error)]
pub enum PlistError {
    /// The input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// An unrecognized tag was encountered.
    #[error("unknown tag byte: {0:?}")]
    UnknownTag(char),
    /// A quoted string was malformed.
    #[error("malformed string literal")]
    MalformedString,
    /// A numeric literal failed to parse.
    #[error("malformed numeric literal: {0}")]
    MalformedNumber(String),
    /// Hex-encoded bytes were malformed.
    #[error("malformed hex literal")]
    MalformedHex,
    /// A container was not closed.
    #[error("unterminated container")]
    Unterminated,
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Serializes a value to its canonical text form.
#[must_use]
pub fn externalize(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Serializes a value to its canonical text form, gzip-compressed.
///
/// # Errors
/// Returns an error if the gzip encoder fails.
pub fn externalize_compressed(value: &Value) -> Result<Vec<u8>, PlistError> {
    let text = externalize(value);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    Ok(encoder.finish()?)
}

/// Parses a value from its canonical text form.
///
/// # Errors
/// Returns a [`PlistError`] if the text is not well-formed.
pub fn internalize(text: &str) -> Result<Value, PlistError> {
    let mut chars = text.trim_start().chars().peekable();
    let value = parse_value(&mut chars)?;
    Ok(value)
}

/// Decompresses and parses a gzip-compressed plist.
///
/// # Errors
/// Returns a [`PlistError`] if decompression or parsing fails.
pub fn internalize_compressed(bytes: &[u8]) -> Result<Value, PlistError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = String::new();
    decoder.read_to_string(&mut text)?;
    internalize(&text)
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Bool(true) => out.push_str("#t"),
        Value::Bool(false) => out.push_str("#f"),
        Value::Int(i) => {
            out.push_str("i:");
            out.push_str(&i.to_string());
        }
        Value::UInt(u) => {
            out.push_str("u:");
            out.push_str(&u.to_string());
        }
        Value::Str(s) => {
            out.push_str("s:");
            write_quoted(s, out);
        }
        Value::Bytes(b) => {
            out.push_str("b:");
            out.push_str(&hex::encode(b));
        }
        Value::Seq(seq) => write_seq(seq, out),
        Value::Map(map) => write_map(map, out),
    }
}

fn write_quoted(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

fn write_seq(seq: &Sequence, out: &mut String) {
    out.push('[');
    for (i, item) in seq.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write_value(item, out);
    }
    out.push(']');
}

fn write_map(map: &Mapping, out: &mut String) {
    let mut keys: Vec<&str> = map.keys().collect();
    keys.sort_unstable();
    out.push('{');
    for key in keys {
        write_quoted(key, out);
        out.push('=');
        write_value(map.get(key).expect("key from map.keys() exists"), out);
        out.push(';');
    }
    out.push('}');
}

type Chars<'a> = std::iter::Peekable<std::str::Chars<'a>>;

fn skip_ws(chars: &mut Chars<'_>) {
    while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
        chars.next();
    }
}

fn parse_value(chars: &mut Chars<'_>) -> Result<Value, PlistError> {
    skip_ws(chars);
    match chars.peek().copied() {
        None => Err(PlistError::UnexpectedEof),
        Some('#') => {
            chars.next();
            match chars.next() {
                Some('t') => Ok(Value::Bool(true)),
                Some('f') => Ok(Value::Bool(false)),
                Some(c) => Err(PlistError::UnknownTag(c)),
                None => Err(PlistError::UnexpectedEof),
            }
        }
        Some('i') => {
            chars.next();
            expect_colon(chars)?;
            let num = take_number_literal(chars);
            num.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| PlistError::MalformedNumber(num))
        }
        Some('u') => {
            chars.next();
            expect_colon(chars)?;
            let num = take_number_literal(chars);
            num.parse::<u64>()
                .map(Value::UInt)
                .map_err(|_| PlistError::MalformedNumber(num))
        }
        Some('s') => {
            chars.next();
            expect_colon(chars)?;
            parse_quoted(chars).map(Value::Str)
        }
        Some('b') => {
            chars.next();
            expect_colon(chars)?;
            let literal = take_hex_literal(chars);
            hex::decode(&literal)
                .map(Value::Bytes)
                .map_err(|_| PlistError::MalformedHex)
        }
        Some('[') => parse_seq(chars),
        Some('{') => parse_map(chars),
        Some(other) => Err(PlistError::UnknownTag(other)),
    }
}

fn expect_colon(chars: &mut Chars<'_>) -> Result<(), PlistError> {
    match chars.next() {
        Some(':') => Ok(()),
        Some(c) => Err(PlistError::UnknownTag(c)),
        None => Err(PlistError::UnexpectedEof),
    }
}

fn take_number_literal(chars: &mut Chars<'_>) -> String {
    let mut s = String::new();
    if matches!(chars.peek(), Some('-')) {
        s.push(chars.next().expect("peeked"));
    }
    while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
        s.push(chars.next().expect("peeked"));
    }
    s
}

fn take_hex_literal(chars: &mut Chars<'_>) -> String {
    let mut s = String::new();
    while matches!(chars.peek(), Some(c) if c.is_ascii_hexdigit()) {
        s.push(chars.next().expect("peeked"));
    }
    s
}

fn parse_quoted(chars: &mut Chars<'_>) -> Result<String, PlistError> {
    if chars.next() != Some('"') {
        return Err(PlistError::MalformedString);
    }
    let mut s = String::new();
    loop {
        match chars.next() {
            None => return Err(PlistError::MalformedString),
            Some('"') => return Ok(s),
            Some('\\') => match chars.next() {
                Some('"') => s.push('"'),
                Some('\\') => s.push('\\'),
                Some('n') => s.push('\n'),
                Some(c) => s.push(c),
                None => return Err(PlistError::MalformedString),
            },
            Some(c) => s.push(c),
        }
    }
}

fn parse_seq(chars: &mut Chars<'_>) -> Result<Value, PlistError> {
    chars.next(); // consume '['
    let mut seq = Sequence::new();
    loop {
        skip_ws(chars);
        match chars.peek() {
            Some(']') => {
                chars.next();
                return Ok(Value::Seq(seq));
            }
            None => return Err(PlistError::Unterminated),
            _ => {
                let v = parse_value(chars)?;
                seq.append(v).expect("freshly built sequence is mutable");
            }
        }
    }
}

fn parse_map(chars: &mut Chars<'_>) -> Result<Value, PlistError> {
    chars.next(); // consume '{'
    let mut map = Mapping::new();
    loop {
        skip_ws(chars);
        match chars.peek() {
            Some('}') => {
                chars.next();
                return Ok(Value::Map(map));
            }
            None => return Err(PlistError::Unterminated),
            _ => {
                let key = parse_quoted(chars)?;
                skip_ws(chars);
                if chars.next() != Some('=') {
                    return Err(PlistError::MalformedString);
                }
                let value = parse_value(chars)?;
                skip_ws(chars);
                if chars.peek() == Some(&';') {
                    chars.next();
                }
                map.insert(key, value)
                    .expect("freshly built mapping is mutable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let mut map = Mapping::new();
        map.insert("pkgname", Value::str("foo")).unwrap();
        map.insert("installed_size", Value::UInt(4096)).unwrap();
        map.insert("hold", Value::Bool(false)).unwrap();
        let mut deps = Sequence::new();
        deps.append(Value::str("bar>=1.0")).unwrap();
        deps.append(Value::str("baz")).unwrap();
        map.insert("run_depends", Value::Seq(deps)).unwrap();
        map.insert("filename-sha256", Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]))
            .unwrap();
        Value::Map(map)
    }

    #[test]
    fn round_trips_plain_text() {
        let v = sample();
        let text = externalize(&v);
        let back = internalize(&text).unwrap();
        assert!(v.structural_eq(&back));
    }

    #[test]
    fn round_trips_compressed() {
        let v = sample();
        let bytes = externalize_compressed(&v).unwrap();
        let back = internalize_compressed(&bytes).unwrap();
        assert!(v.structural_eq(&back));
    }

    #[test]
    fn output_is_deterministic_regardless_of_insertion_order() {
        let mut a = Mapping::new();
        a.insert("z", Value::Int(1)).unwrap();
        a.insert("a", Value::Int(2)).unwrap();
        let mut b = Mapping::new();
        b.insert("a", Value::Int(2)).unwrap();
        b.insert("z", Value::Int(1)).unwrap();
        assert_eq!(externalize(&Value::Map(a)), externalize(&Value::Map(b)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(internalize("x:1").is_err());
    }
}
