//! Public embedding API: construct an engine over a caller-sized arena,
//! evaluate script source, inject globals, and query engine state.
//!
//! This is the seam between [`crate::parser`]'s single-pass evaluator and a
//! host program. Every operation here either prepares the engine's mutable
//! state before handing control to the evaluator, or reads a terminal result
//! back out of the arena. The opaque `engine` handle and 64-bit value word
//! of a C embedding become, here, an owned [`Engine`] and a `Copy` [`Value`].

use std::rc::Rc;

use crate::arena::Arena;
use crate::error::{EngineError, ERROR_MESSAGE_CAPACITY, Result};
use crate::function;
use crate::lexer::{Token, TokenInfo};
use crate::native::{CallbackHandle, NativeFn, NativeTable};
use crate::parser::stringify;
use crate::resource::{DEFAULT_MAX_C_STACK, RecursionGuard};
use crate::value::{Type, Value};

/// Percentage of arena usage past which [`Engine::eval`] runs a full
/// mark-compact collection between top-level statements.
pub const DEFAULT_GC_THRESHOLD: u32 = 50;

/// Evaluator control flags threaded through every statement/expression call:
/// no-execute mode for dead branches and function-body parsing, loop/call
/// context for `break`/`continue`/`return` validity, and the in-flight
/// break/continue/return signals themselves.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Flags {
    pub(crate) noexec: bool,
    pub(crate) in_loop: bool,
    pub(crate) in_call: bool,
    pub(crate) brk: bool,
    pub(crate) cont: bool,
    pub(crate) ret: bool,
}

/// An embeddable script engine: one caller-sized [`Arena`] plus the parser
/// state a single-pass evaluator needs to suspend and resume around nested
/// calls — script-to-script, script-to-native, and native-to-script alike.
///
/// Not safe for concurrent access: an `Engine` has no internal
/// synchronization and every API entry point runs to completion on the
/// calling thread.
pub struct Engine {
    pub(crate) arena: Arena,
    pub(crate) scope: Value,
    pub(crate) src: Rc<[u8]>,
    pub(crate) pos: u32,
    pub(crate) tok: TokenInfo,
    /// Call-nesting depth: zero at the outermost statement list a host's
    /// [`Self::eval`] is running, incremented around every native or script
    /// call. [`Self::maybe_collect`](crate::parser) only runs a full
    /// collection at depth zero — inside a call frame, only the block
    /// scope's bump-pointer fast path reclaims memory.
    pub(crate) lev: u32,
    pub(crate) gc_threshold: u32,
    pub(crate) flags: Flags,
    pub(crate) recursion: RecursionGuard,
    pub(crate) natives: NativeTable,
    pub(crate) errmsg: [u8; ERROR_MESSAGE_CAPACITY],
    strbuf: String,
}

impl Engine {
    /// Creates an engine over a freshly allocated `capacity`-byte arena,
    /// carving the global scope object from its front. Fails if `capacity`
    /// can't hold even an empty global scope object.
    pub fn create(capacity: usize) -> Result<Self> {
        let mut arena = Arena::new(capacity)?;
        let scope = arena.mk_object(0).map_err(|_| EngineError::BufferTooSmall)?;
        Ok(Self {
            arena,
            scope,
            src: Rc::from(Vec::new().into_boxed_slice()),
            pos: 0,
            tok: TokenInfo { tok: Token::Eof, offset: 0, len: 0 },
            lev: 0,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            flags: Flags::default(),
            recursion: RecursionGuard::new(DEFAULT_MAX_C_STACK),
            natives: NativeTable::default(),
            errmsg: [0u8; ERROR_MESSAGE_CAPACITY],
            strbuf: String::new(),
        })
    }

    /// Sets the recursion ceiling; exceeding it surfaces a `C stack` error
    /// value instead of risking a host stack overflow.
    pub fn set_max_c_stack(&mut self, max: u16) {
        self.recursion.set_max(max);
    }

    /// Sets the arena-usage percentage past which [`Self::eval`] runs a full
    /// collection between top-level statements (the CLI's `-gct` flag).
    pub fn set_gc_threshold(&mut self, percent: u32) {
        self.gc_threshold = percent.min(100);
    }

    /// Evaluates `source` as a sequence of statements, returning the value
    /// of the last one, or an `Error` value recorded in the engine's
    /// message buffer. Safe to call reentrantly from a native function: the
    /// parser's cursor, source buffer, and control flags are saved and
    /// restored around the call, so a native invoked mid-evaluation can
    /// itself call `eval` without disturbing the outer evaluation that
    /// invoked it.
    pub fn eval(&mut self, source: &str) -> Value {
        let saved_src = Rc::clone(&self.src);
        let saved_pos = self.pos;
        let saved_tok = self.tok;
        let saved_flags = self.flags;
        let result = self.run(source);
        self.src = saved_src;
        self.pos = saved_pos;
        self.tok = saved_tok;
        self.flags = saved_flags;
        result
    }

    /// Returns the global scope object as a `Value`.
    #[must_use]
    pub fn glob(&self) -> Value {
        self.scope
    }

    /// Allocates a fresh, empty object in the arena.
    pub fn mkobj(&mut self) -> Result<Value> {
        self.arena.mk_object(0).map_err(|_| EngineError::OutOfMemory)
    }

    /// Allocates a string entity holding `bytes`.
    pub fn mkstr(&mut self, bytes: &[u8]) -> Result<Value> {
        self.arena.mk_string(bytes).map_err(|_| EngineError::OutOfMemory)
    }

    #[must_use]
    pub fn mknum(f: f64) -> Value {
        Value::number(f)
    }

    #[must_use]
    pub fn mkbool(b: bool) -> Value {
        Value::boolean(b)
    }

    #[must_use]
    pub fn mknull() -> Value {
        Value::null()
    }

    #[must_use]
    pub fn mkundef() -> Value {
        Value::undefined()
    }

    /// Builds an `Error` value carrying `message`, truncated to the
    /// engine's fixed message buffer and prefixed `ERROR: ` the same way a
    /// script-raised error is, for natives that want to report their own
    /// failures back through [`Self::str`].
    pub fn mkerr(&mut self, message: &str) -> Value {
        crate::error::write_raw_message(&mut self.errmsg, message);
        Value::error()
    }

    /// Defines or updates `key` as an own property of `obj`.
    pub fn set(&mut self, obj: Value, key: &str, value: Value) -> Result<()> {
        if !self.arena.set_own(obj, key.as_bytes(), value) {
            let k = self.arena.mk_string(key.as_bytes()).map_err(|_| EngineError::OutOfMemory)?;
            self.arena.set_prop(obj, k, value).map_err(|_| EngineError::OutOfMemory)?;
        }
        Ok(())
    }

    /// Registers `func` as a native binding named `name` on the global
    /// scope.
    pub fn set_native(&mut self, name: &str, func: NativeFn) -> Result<()> {
        let index = self.natives.register(func);
        let fval = function::make_native(&mut self.arena, index).map_err(|_| EngineError::OutOfMemory)?;
        self.set(self.scope, name, fval)
    }

    /// Pins a script function value so a native can invoke it later via
    /// [`Self::call_callback`], even across intervening garbage collections.
    pub fn pin_callback(&mut self, func: Value) -> Result<CallbackHandle> {
        debug_assert_eq!(func.value_type(), Type::Function);
        crate::native::pin(&mut self.arena, func).map_err(|_| EngineError::OutOfMemory)
    }

    /// Invokes a previously pinned callback with already-evaluated
    /// argument values (there is no caller source buffer to draw them
    /// from, unlike a script-level call).
    pub fn call_callback(&mut self, handle: CallbackHandle, args: &[Value]) -> Value {
        let func = crate::native::resolve(&self.arena, handle);
        match self.call_with_values(func, args) {
            Ok(v) => v,
            Err(e) => {
                e.write_into(&mut self.errmsg);
                Value::error()
            }
        }
    }

    /// Stringifies `v` into the engine's scratch buffer and returns it.
    /// The returned `&str` is invalidated by the next call to `str`, `eval`,
    /// or any other engine operation (mirrors the C API's "arena tail,
    /// invalidated by the next allocation" contract without literally
    /// writing into live arena space).
    pub fn str(&mut self, v: Value) -> &str {
        self.strbuf = stringify(self, v);
        &self.strbuf
    }

    /// Integer percentage of the arena's live-entity region currently in
    /// use.
    #[must_use]
    pub fn usage(&self) -> u32 {
        self.arena.usage_percent()
    }

    /// Byte capacity of the engine's arena (live-entity region plus pinned
    /// callback tail).
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.arena.size()
    }

    /// Current `brk` cursor: bytes of the arena committed to live entities.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.arena.brk()
    }

    /// Number of pinned native-callback descriptors registered so far.
    #[must_use]
    pub fn pinned_count(&self) -> u32 {
        self.arena.pinned_count()
    }

    pub(crate) fn arena_ref(&self) -> &Arena {
        &self.arena
    }

    pub(crate) fn arena_string_bytes(&self, v: Value) -> &[u8] {
        self.arena.string_bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fails_below_minimum_capacity() {
        assert!(Engine::create(4).is_err());
    }

    #[test]
    fn glob_is_the_global_scope_object() {
        let e = Engine::create(4096).unwrap();
        assert_eq!(e.glob().value_type(), Type::Object);
        assert_eq!(e.glob().offset(), 0);
    }

    #[test]
    fn set_and_read_back_a_global() {
        let mut e = Engine::create(4096).unwrap();
        let v = Value::number(42.0);
        let g = e.glob();
        e.set(g, "answer", v).unwrap();
        let result = e.eval("answer");
        assert_eq!(result.as_number(), 42.0);
    }

    #[test]
    fn native_binding_is_callable_from_script() {
        fn double(_e: &mut Engine, argv: &[Value]) -> Value {
            Value::number(argv.first().map_or(0.0, Value::as_number) * 2.0)
        }
        let mut e = Engine::create(4096).unwrap();
        e.set_native("double", double).unwrap();
        let v = e.eval("double(21)");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.as_number(), 42.0);
    }

    #[test]
    fn usage_reflects_allocation() {
        let mut e = Engine::create(4096).unwrap();
        let before = e.usage();
        e.eval("let a = {x:1,y:2,z:3};");
        assert!(e.usage() >= before);
    }
}
