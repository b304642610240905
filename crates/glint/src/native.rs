//! The native bridge (Model 2: typed native closures).
//!
//! Two calling conventions are possible: a signature-string FFI
//! that marshals raw C function pointers out of a hex suffix, and a typed
//! native-closure model where the registered item is just a function taking
//! the engine, the argument values, and the argument count. The hex/raw-
//! pointer model has no safe Rust expression — it would force every native
//! registration through `unsafe` pointer casts for no benefit over a
//! closure table — so this engine implements only the closure model.
//!
//! A registered native is a plain `fn(&mut Engine, &[Value]) -> Value`
//! stored in the engine's native table; the table is addressed by index
//! from a [`crate::function::Callee::Native`] marker string, not by raw
//! pointer.

use crate::api::Engine;
use crate::error::ScriptError;
use crate::value::{Type, Value};

pub type NativeFn = fn(&mut Engine, &[Value]) -> Value;

/// A single registered native binding.
#[derive(Clone, Copy)]
pub(crate) struct NativeSlot {
    pub(crate) func: NativeFn,
}

/// Table of host-registered natives, addressed by index from a `Function`
/// value's marker string (see [`crate::function`]).
#[derive(Default)]
pub(crate) struct NativeTable {
    slots: Vec<NativeSlot>,
}

impl NativeTable {
    pub(crate) fn register(&mut self, func: NativeFn) -> u32 {
        self.slots.push(NativeSlot { func });
        (self.slots.len() - 1) as u32
    }

    pub(crate) fn get(&self, index: u32) -> Option<NativeSlot> {
        self.slots.get(index as usize).copied()
    }
}

/// Signature-letter argument checker: `d` number, `b` bool, `s` string,
/// `j` any.
pub fn checkargs(argv: &[Value], sig: &str) -> bool {
    if argv.len() != sig.len() {
        return false;
    }
    argv.iter().zip(sig.chars()).all(|(v, c)| match c {
        'd' => v.value_type() == Type::Number,
        'b' => v.value_type() == Type::Boolean,
        's' => v.value_type() == Type::Str,
        'j' => true,
        _ => false,
    })
}

/// Extracts the numeric argument checked to be present by [`checkargs`];
/// returns a `bad sig` error value if the caller skipped the check.
pub(crate) fn expect_number(argv: &[Value], i: usize) -> Result<f64, ScriptError> {
    argv.get(i)
        .filter(|v| v.value_type() == Type::Number)
        .map(|v| v.as_number())
        .ok_or(ScriptError::BadArg(i as u32))
}

pub(crate) fn expect_bool(argv: &[Value], i: usize) -> Result<bool, ScriptError> {
    argv.get(i)
        .filter(|v| v.value_type() == Type::Boolean)
        .map(|v| v.as_bool())
        .ok_or(ScriptError::BadArg(i as u32))
}

/// A handle a native function can retain across calls (and across GC
/// cycles) to invoke a script function it was handed as a callback
/// argument. Backed by a pinned arena descriptor (see [`crate::arena`]):
/// pinning never moves or frees the entity, it only tracks its offset
/// across compaction, so the handle stays valid for the engine's lifetime.
#[derive(Clone, Copy)]
pub struct CallbackHandle(pub(crate) u32);

/// Pins `func` (must be a `Function` value) so it can be invoked later via
/// a [`CallbackHandle`] even after a garbage collection. The descriptor
/// comes from the arena's shrinking tail region and is never reclaimed,
/// which is why hosts that install unboundedly many distinct callbacks over
/// a script's lifetime will eventually exhaust the arena.
pub(crate) fn pin(arena: &mut crate::arena::Arena, func: Value) -> Result<CallbackHandle, ScriptError> {
    debug_assert_eq!(func.value_type(), Type::Function);
    let index = arena.pin_callback(func.offset(), 0).map_err(|_| ScriptError::Oom)?;
    Ok(CallbackHandle(index))
}

pub(crate) fn resolve(arena: &crate::arena::Arena, handle: CallbackHandle) -> Value {
    let cb = arena.pinned(handle.0);
    Value::offset_entity(Type::Function, cb.func)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkargs_matches_signature_letters() {
        let argv = [Value::number(1.0), Value::boolean(true)];
        assert!(checkargs(&argv, "db"));
        assert!(!checkargs(&argv, "bd"));
        assert!(!checkargs(&argv, "d"));
    }

    #[test]
    fn expect_number_reports_bad_arg_with_index() {
        let argv = [Value::number(1.0), Value::boolean(true)];
        assert_eq!(expect_number(&argv, 0), Ok(1.0));
        assert_eq!(expect_number(&argv, 1), Err(ScriptError::BadArg(1)));
        assert_eq!(expect_bool(&argv, 2), Err(ScriptError::BadArg(2)));
    }
}
