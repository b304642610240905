//! Function values: literal parsing and call-frame setup.
//!
//! A `Function` value's payload is the arena offset of a String entity.
//! Its *first byte* distinguishes the two things a `Function` can be:
//!
//! - `(` — a script function; the string is the verbatim source slice from
//!   the parameter list's opening paren through the body's closing brace,
//!   e.g. `(a,b){return a+b;}`. There is no captured environment: calling it
//!   re-parses that slice from scratch inside a new scope.
//! - anything else — a native binding; the string instead holds a decimal
//!   index into the engine's native-function table (see [`crate::native`]).
//!
//! Dispatch on that leading byte stands in for a raw C function pointer —
//! Rust has no safe equivalent of "hex-encode an address and call through
//! it", so a table index plays the same role.

use crate::arena::Arena;
use crate::error::ScriptError;
use crate::value::{Type, Value};

pub(crate) const NATIVE_MARKER: u8 = b'n';

/// Builds the native-function marker string `"n<index>"` and wraps it as a
/// `Function` value.
pub(crate) fn make_native(arena: &mut Arena, index: u32) -> Result<Value, ScriptError> {
    let text = format!("n{index}");
    let s = arena.mk_string(text.as_bytes()).map_err(|_| ScriptError::Oom)?;
    Ok(Value::offset_entity(Type::Function, s.offset()))
}

/// Wraps an already-allocated source-slice string (built while parsing a
/// `function(...)  { ... }` literal) as a `Function` value.
pub(crate) fn make_script(source: Value) -> Value {
    Value::offset_entity(Type::Function, source.offset())
}

pub(crate) enum Callee<'a> {
    Script { source: &'a [u8] },
    Native { index: u32 },
}

/// Classifies a `Function` value's payload string without allocating.
pub(crate) fn classify<'a>(arena: &'a Arena, func: Value) -> Callee<'a> {
    let bytes = arena.string_bytes(Value::offset_entity(Type::Str, func.offset()));
    if bytes.first() == Some(&b'(') {
        Callee::Script { source: bytes }
    } else {
        let digits = std::str::from_utf8(&bytes[1..]).unwrap_or("0");
        let index = digits.parse().unwrap_or(0);
        Callee::Native { index }
    }
}

/// One parameter name parsed out of a script function's `(a, b, c)` header,
/// as a byte range relative to the function's source slice.
pub(crate) struct ParamIter<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> ParamIter<'a> {
    /// `src` starts at the opening `(` of a script function's source slice.
    pub(crate) fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 1 }
    }

    fn skip_space(&self, mut n: usize) -> usize {
        while n < self.src.len() && (self.src[n] as char).is_whitespace() {
            n += 1;
        }
        n
    }
}

impl<'a> Iterator for ParamIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        self.pos = self.skip_space(self.pos);
        if self.pos >= self.src.len() || self.src[self.pos] == b')' {
            return None;
        }
        let start = self.pos;
        while self.pos < self.src.len() && is_ident_continue(self.src[self.pos]) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let name = &self.src[start..self.pos];
        self.pos = self.skip_space(self.pos);
        if self.pos < self.src.len() && self.src[self.pos] == b',' {
            self.pos += 1;
        }
        Some(name)
    }
}

fn is_ident_continue(c: u8) -> bool {
    c == b'_' || c == b'$' || c.is_ascii_alphanumeric()
}

/// Splits a script function's source slice into `(params)` and `{body}`,
/// returning the body with its braces stripped (exactly one leading and
/// trailing byte).
pub(crate) fn split_body(src: &[u8]) -> &[u8] {
    let open_brace = src.iter().position(|&b| b == b'{').unwrap_or(src.len());
    let body = &src[open_brace + 1..];
    &body[..body.len().saturating_sub(1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_iter_splits_names() {
        let src = b"(a, b,c)";
        let names: Vec<&[u8]> = ParamIter::new(src).collect();
        assert_eq!(names, vec![b"a".as_slice(), b"b", b"c"]);
    }

    #[test]
    fn param_iter_empty_list() {
        let src = b"()";
        assert!(ParamIter::new(src).next().is_none());
    }

    #[test]
    fn split_body_strips_braces() {
        let src = b"(n){return n*2;}";
        assert_eq!(split_body(src), b"return n*2;");
    }
}
