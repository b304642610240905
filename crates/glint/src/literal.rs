//! String and number literal decoding.
//!
//! Lexing only finds a literal's byte span; turning that span into the
//! value it denotes — unescaping a string, parsing a hex or decimal number —
//! happens here, once, at the point the parser pushes the literal onto the
//! expression stack.

use crate::error::ScriptError;

/// Decodes a quoted string literal's *inner* bytes (the lexer's span
/// includes the surrounding quotes). Recognizes `\'`/`\"` matching whichever
/// delimiter opened the literal, `\n`, `\r`, `\t`, `\xHH`, and `\\` for a
/// literal backslash; any other escape is left as-is (backslash and the
/// following byte both copied through).
pub(crate) fn decode_string_literal(raw: &[u8]) -> Result<Vec<u8>, ScriptError> {
    if raw.len() < 2 {
        return Err(ScriptError::BadStrLiteral);
    }
    let quote = raw[0];
    let inner = &raw[1..raw.len() - 1];
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let c = inner[i];
        if c != b'\\' {
            out.push(c);
            i += 1;
            continue;
        }
        let next = *inner.get(i + 1).ok_or(ScriptError::BadStrLiteral)?;
        match next {
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b'x' => {
                let hex = inner.get(i + 2..i + 4).ok_or(ScriptError::BadStrLiteral)?;
                let text = std::str::from_utf8(hex).map_err(|_| ScriptError::BadStrLiteral)?;
                let byte = u8::from_str_radix(text, 16).map_err(|_| ScriptError::BadStrLiteral)?;
                out.push(byte);
                i += 4;
            }
            q if q == quote => {
                out.push(quote);
                i += 2;
            }
            other => {
                out.push(b'\\');
                out.push(other);
                i += 2;
            }
        }
    }
    Ok(out)
}

/// Parses a numeric literal's raw span: `0x`/`0X`-prefixed hex as an
/// integer, everything else as a decimal float.
pub(crate) fn parse_number(raw: &[u8]) -> Result<f64, ScriptError> {
    let text = std::str::from_utf8(raw).map_err(|_| ScriptError::ParseError)?;
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        let n = u64::from_str_radix(hex, 16).map_err(|_| ScriptError::ParseError)?;
        return Ok(n as f64);
    }
    text.parse::<f64>().map_err(|_| ScriptError::ParseError)
}

/// Renders a number the way `str()`/`stringify()` present it: integral
/// values (within the range an `f64` represents exactly) print without a
/// trailing `.0`; everything else uses the shortest round-tripping decimal
/// via `ryu` rather than a lossy fixed-precision format.
pub(crate) fn format_number(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        return format!("{}", f as i64);
    }
    let mut buf = ryu::Buffer::new();
    buf.format(f).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_common_escapes() {
        assert_eq!(decode_string_literal(b"\"a\\nb\"").unwrap(), b"a\nb");
        assert_eq!(decode_string_literal(b"'it\\'s'").unwrap(), b"it's");
        assert_eq!(decode_string_literal(b"\"\\x41\"").unwrap(), b"A");
        assert_eq!(decode_string_literal(b"\"a\\\\b\"").unwrap(), b"a\\b");
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_number(b"0x1F").unwrap(), 31.0);
        assert_eq!(parse_number(b"3.5").unwrap(), 3.5);
        assert_eq!(parse_number(b"10").unwrap(), 10.0);
    }

    #[test]
    fn formats_integers_without_trailing_zero() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(3.5), "3.5");
    }
}
