//! The Alyx policy expression language.
//!
//! Rules are small, pure, total boolean expressions over `auth`, `doc`,
//! `file`, and `request`. They compile once per schema load
//! ([`RuleSet::compile`]) and evaluate in constant-path time on every
//! guarded operation ([`RuleSet::check_collection`]).

mod ast;
mod compile;
mod error;
mod eval;
mod parser;
mod token;

pub use ast::{BinaryOp, Expr, Func};
pub use compile::{validate, CompileFailure, Program, RuleSet};
pub use error::{RuleError, Span};
pub use eval::{EvalContext, RuleValue};
pub use parser::parse;
