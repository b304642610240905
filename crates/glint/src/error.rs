//! Error value and message catalog.
//!
//! Scripts see a single in-band `Error` value; there is no catch. This
//! module carries two distinct things that share the same vocabulary:
//!
//! - [`EngineError`]: the Rust-level error a host-facing API call returns
//!   (`create` failing because the buffer is too small, `set` failing
//!   because a key isn't valid UTF-8, and so on).
//! - The error *message* an [`crate::value::Value`] of type `Error` carries,
//!   which is produced during `eval` and surfaced through `str()` with the
//!   `ERROR: ` prefix, truncated to the engine's fixed message buffer.

use std::fmt;

/// Room for `"ERROR: "` plus a short message, including the NUL. Longer
/// messages are truncated, never reallocated — the buffer lives inline in
/// [`crate::api::Engine`].
pub const ERROR_MESSAGE_CAPACITY: usize = 36;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures raised by host-facing API calls (construction, globals, value
/// constructors) as opposed to script-level evaluation errors, which are
/// in-band `Value`s carrying one of the messages below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `create()` was handed a buffer too small to hold the header plus one
    /// empty Object entity.
    BufferTooSmall,
    /// Allocation would cross the arena's `size` boundary.
    OutOfMemory,
    /// A key or source string passed across the host boundary wasn't valid
    /// UTF-8.
    InvalidUtf8,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "buffer too small for engine header and global scope"),
            Self::OutOfMemory => write!(f, "oom"),
            Self::InvalidUtf8 => write!(f, "invalid utf-8"),
        }
    }
}

impl std::error::Error for EngineError {}

/// The fixed catalog of script-visible error messages. Stored as a format
/// string plus optional substitution so the 36-byte buffer is built
/// directly with the same truncation behavior as [`write_message`], rather
/// than via a Rust-side unbounded `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    Oom,
    BadLhs,
    BadExpr,
    ParseError,
    BadStrLiteral,
    BadStrOp,
    TypeMismatch,
    DivByZero,
    NumArgs,
    Ffi,
    NotInLoop,
    NotInFunc,
    CallingNonFunction,
    LookupInNonObj,
    IdentExpected,
    ExprTooDeep,
    CStack,
    BadSig,
    /// A native's argument at this 0-based index failed its own type check
    /// (as opposed to [`Self::BadSig`], which covers a wrong argument count).
    BadArg(u32),
    /// An operator token reached the application stage without a handler —
    /// reachable only if the precedence table and the apply match fall out
    /// of sync, which a well-formed parser never triggers.
    UnknownOp(u32),
    /// An identifier wasn't found on the scope chain. Carries the name so
    /// the message can read `'<name>' not found`.
    NotFound(Box<str>),
    /// `let` redeclared a name already an own binding of the current scope.
    AlreadyDeclared(Box<str>),
    /// A recognized-but-unsupported keyword (`for`, `class`, `try`, ...).
    NotImplemented(Box<str>),
    /// The parser expected a different token than it found.
    UnexpectedToken(Box<str>),
}

impl ScriptError {
    fn template(&self) -> std::borrow::Cow<'static, str> {
        match self {
            Self::Oom => "oom".into(),
            Self::BadLhs => "bad lhs".into(),
            Self::BadExpr => "bad expr".into(),
            Self::ParseError => "parse error".into(),
            Self::BadStrLiteral => "bad str literal".into(),
            Self::BadStrOp => "bad str op".into(),
            Self::TypeMismatch => "type mismatch".into(),
            Self::DivByZero => "div by zero".into(),
            Self::NumArgs => "num args".into(),
            Self::Ffi => "ffi".into(),
            Self::NotInLoop => "not in loop".into(),
            Self::NotInFunc => "not in func".into(),
            Self::CallingNonFunction => "calling non-function".into(),
            Self::LookupInNonObj => "lookup in non-obj".into(),
            Self::IdentExpected => "ident expected".into(),
            Self::ExprTooDeep => "expr too deep".into(),
            Self::CStack => "C stack".into(),
            Self::BadSig => "bad sig".into(),
            Self::BadArg(i) => format!("bad arg {i}").into(),
            Self::UnknownOp(n) => format!("unknown op {n}").into(),
            Self::NotFound(name) => format!("'{name}' not found").into(),
            Self::AlreadyDeclared(name) => format!("'{name}' already declared").into(),
            Self::NotImplemented(word) => format!("'{word}' not implemented").into(),
            Self::UnexpectedToken(word) => format!("unexpected token '{word}'").into(),
        }
    }

    /// Renders into `out`, truncating to [`ERROR_MESSAGE_CAPACITY`] bytes
    /// including the `"ERROR: "` prefix rather than reallocating.
    pub(crate) fn write_into(&self, out: &mut [u8; ERROR_MESSAGE_CAPACITY]) -> usize {
        write_message(out, &self.template())
    }
}

/// Writes `msg` into `out` prefixed `"ERROR: "` and NUL-terminated,
/// truncating rather than reallocating. Used both by [`ScriptError`]'s own
/// catalog and by [`crate::api::Engine::mkerr`] for host-raised messages.
pub(crate) fn write_raw_message(out: &mut [u8; ERROR_MESSAGE_CAPACITY], msg: &str) -> usize {
    write_message(out, msg)
}

fn write_message(out: &mut [u8; ERROR_MESSAGE_CAPACITY], msg: &str) -> usize {
    const PREFIX: &[u8] = b"ERROR: ";
    out.fill(0);
    let mut n = PREFIX.len().min(out.len());
    out[..n].copy_from_slice(&PREFIX[..n]);
    let room = out.len().saturating_sub(n + 1); // reserve the NUL
    let msg_bytes = msg.as_bytes();
    let take = room.min(msg_bytes.len());
    out[n..n + take].copy_from_slice(&msg_bytes[..take]);
    n += take;
    out[n] = 0;
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_and_message_fit_in_buffer() {
        let mut buf = [0u8; ERROR_MESSAGE_CAPACITY];
        let n = ScriptError::TypeMismatch.write_into(&mut buf);
        assert_eq!(&buf[..n], b"ERROR: type mismatch");
    }

    #[test]
    fn long_names_are_truncated_not_reallocated() {
        let mut buf = [0u8; ERROR_MESSAGE_CAPACITY];
        let long_name: Box<str> = "a".repeat(64).into();
        let n = ScriptError::NotFound(long_name).write_into(&mut buf);
        assert!(n <= ERROR_MESSAGE_CAPACITY - 1);
        assert!(buf.iter().any(|&b| b == 0));
    }

    #[test]
    fn bad_arg_and_unknown_op_carry_their_index() {
        let mut buf = [0u8; ERROR_MESSAGE_CAPACITY];
        let n = ScriptError::BadArg(2).write_into(&mut buf);
        assert_eq!(&buf[..n], b"ERROR: bad arg 2");

        let mut buf = [0u8; ERROR_MESSAGE_CAPACITY];
        let n = ScriptError::UnknownOp(9).write_into(&mut buf);
        assert_eq!(&buf[..n], b"ERROR: unknown op 9");
    }
}
