//! The scope chain: declaration, lookup, and the global-assignment rule.
//!
//! A scope is nothing more than an [`Object`](Type::Object) entity whose
//! parent-offset is another scope (or `0` for the global scope). There is no
//! separate scope data structure — [`crate::arena::Arena`] already knows how
//! to walk an object's property list and its parent pointer; this module
//! just gives those walks their scoping meaning: declare-here,
//! look-up-through-parents, assign-to-existing-or-fall-through-to-global.

use crate::arena::Arena;
use crate::error::ScriptError;
use crate::value::{Type, Value};

/// Creates a new scope whose parent is `current`. Used both for function
/// call frames and for block entry (`{ ... }`) when the block isn't already
/// a call frame.
pub(crate) fn push(arena: &mut Arena, current: Value) -> Result<Value, ScriptError> {
    arena.mk_object(current.offset()).map_err(|_| ScriptError::Oom)
}

/// Declares `name` as a fresh binding on `scope`. Errors if `name` is
/// already an own property of `scope` — redeclaration is only an error
/// within the *same* scope; shadowing an outer binding is fine.
pub(crate) fn declare(arena: &mut Arena, scope: Value, name: Value, init: Value) -> Result<(), ScriptError> {
    if arena.lookup_own(scope, arena.string_bytes(name)).is_some() {
        let word = String::from_utf8_lossy(arena.string_bytes(name)).into_owned().into_boxed_str();
        return Err(ScriptError::AlreadyDeclared(word));
    }
    arena.set_prop(scope, name, init).map(|_| ()).map_err(|_| ScriptError::Oom)
}

/// Walks the parent chain starting at `scope`, returning the value of the
/// first matching own property found, or `None` if the chain is exhausted
/// without a match (the caller turns that into a `'<name>' not found`
/// error, since this module doesn't own the error-message formatting).
pub(crate) fn lookup(arena: &Arena, scope: Value, name: &[u8]) -> Option<Value> {
    let mut current = scope;
    loop {
        if let Some(v) = arena.lookup_own(current, name) {
            return Some(v);
        }
        if current.offset() == 0 {
            return None;
        }
        current = arena.parent_scope(current);
    }
}

/// Like [`lookup`], but returns a `Property`-tagged [`Value`] addressing the
/// binding itself rather than its current contents, so the caller can use it
/// as an lvalue for compound assignment or postfix `++`/`--`. Unlike plain
/// `=`, these never auto-vivify: a miss here is always `'<name>' not found`.
pub(crate) fn lookup_property(arena: &Arena, scope: Value, name: &[u8]) -> Option<Value> {
    let mut current = scope;
    loop {
        if let Some(off) = arena.lookup_own_property(current, name) {
            return Some(Value::offset_entity(Type::Property, off));
        }
        if current.offset() == 0 {
            return None;
        }
        current = arena.parent_scope(current);
    }
}

/// Assignment to an undeclared name creates or updates a property on the
/// *global* scope — there is no implicit-global-is-an-error mode.
pub(crate) fn assign(arena: &mut Arena, scope: Value, name: Value, val: Value) -> Result<(), ScriptError> {
    let key = arena.string_bytes(name).to_vec();
    let mut current = scope;
    loop {
        if arena.set_own(current, &key, val) {
            return Ok(());
        }
        if current.offset() == 0 {
            break;
        }
        current = arena.parent_scope(current);
    }
    let global = global_of(arena, scope);
    arena.set_prop(global, name, val).map(|_| ()).map_err(|_| ScriptError::Oom)
}

/// Walks to the root of the parent chain, i.e. the global scope.
pub(crate) fn global_of(arena: &Arena, scope: Value) -> Value {
    let mut current = scope;
    while current.offset() != 0 {
        current = arena.parent_scope(current);
    }
    current
}
