//! An embeddable scripting engine sized for microcontroller-class hosts: a
//! single fixed-size arena, a NaN-boxed value representation, and a
//! single-pass recursive-descent parser that evaluates directly as it
//! parses — no AST, no bytecode.
//!
//! The crate root exposes only what a host needs to embed the engine:
//! [`Engine`], the [`Value`] word, the error types, and the native bridge.
//! Everything else — the arena layout, the scope chain, the lexer — is an
//! internal implementation detail reachable only from within the crate.

mod api;
mod arena;
mod error;
mod function;
mod lexer;
mod literal;
mod native;
mod parser;
mod resource;
mod scope;
mod value;

pub use crate::api::{Engine, DEFAULT_GC_THRESHOLD};
pub use crate::error::{EngineError, Result, ScriptError, ERROR_MESSAGE_CAPACITY};
pub use crate::native::{checkargs, CallbackHandle, NativeFn};
pub use crate::resource::{DEFAULT_MAX_C_STACK, EXPR_MAX};
pub use crate::value::{Type, Value};
