use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use alyx_core::value::{Document, Value};

use crate::ast::{BinaryOp, Expr, Func};
use crate::compile::Program;

/// A value produced while evaluating a rule expression.
///
/// `Missing` marks an unresolved path (`auth.id` with no auth, a doc
/// field the document lacks). Missing compares equal to null and to
/// itself, false to everything else; `has` is the only way to observe
/// it directly.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RuleValue {
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<RuleValue>),
    Map(BTreeMap<String, RuleValue>),
}

impl RuleValue {
    fn from_core(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(v) => Self::Float(*v),
            Value::String(s) => Self::String(s.clone()),
            Value::Timestamp(dt) => Self::Timestamp(*dt),
            Value::Uuid(u) => Self::String(u.to_string()),
            Value::Json(json) => Self::from_json(json),
            Value::Blob(_) => Self::Null,
            _ => unreachable!("alyx_core::Value is non_exhaustive but all variants are handled"),
        }
    }

    /// Converts wire JSON (auth metadata, file metadata) for evaluation.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn is_present(&self) -> bool {
        !matches!(self, Self::Missing | Self::Null)
    }
}

/// The variable bindings one policy check evaluates against.
///
/// Construction is cheap relative to I/O; contexts are built per check
/// and never shared across requests.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    roots: BTreeMap<String, RuleValue>,
}

impl EvalContext {
    /// An empty context: every variable is missing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `auth` from the caller's claims JSON.
    pub fn with_auth(mut self, claims: &serde_json::Value) -> Self {
        self.roots
            .insert("auth".to_string(), RuleValue::from_json(claims));
        self
    }

    /// Binds `doc` from a typed document.
    pub fn with_doc(mut self, doc: &Document) -> Self {
        let map: BTreeMap<String, RuleValue> = doc
            .iter()
            .map(|(k, v)| (k.clone(), RuleValue::from_core(v)))
            .collect();
        self.roots.insert("doc".to_string(), RuleValue::Map(map));
        self
    }

    /// Nests the pre-update document under `doc.previous`.
    pub fn with_previous(mut self, previous: &Document) -> Self {
        let prev: BTreeMap<String, RuleValue> = previous
            .iter()
            .map(|(k, v)| (k.clone(), RuleValue::from_core(v)))
            .collect();
        match self.roots.get_mut("doc") {
            Some(RuleValue::Map(doc)) => {
                doc.insert("previous".to_string(), RuleValue::Map(prev));
            }
            _ => {
                let mut doc = BTreeMap::new();
                doc.insert("previous".to_string(), RuleValue::Map(prev));
                self.roots.insert("doc".to_string(), RuleValue::Map(doc));
            }
        }
        self
    }

    /// Binds `file` from file metadata JSON.
    pub fn with_file(mut self, metadata: &serde_json::Value) -> Self {
        self.roots
            .insert("file".to_string(), RuleValue::from_json(metadata));
        self
    }

    /// Binds `request`: method, client ip, and the per-request instant.
    ///
    /// The instant is fixed once per request so repeated checks within
    /// it are deterministic.
    pub fn with_request(mut self, method: &str, ip: &str, time: DateTime<Utc>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("method".to_string(), RuleValue::String(method.to_string()));
        map.insert("ip".to_string(), RuleValue::String(ip.to_string()));
        map.insert("time".to_string(), RuleValue::Timestamp(time));
        self.roots.insert("request".to_string(), RuleValue::Map(map));
        self
    }

    fn resolve(&self, root: &str, segments: &[String]) -> RuleValue {
        let mut current = match self.roots.get(root) {
            Some(v) => v.clone(),
            None => return RuleValue::Missing,
        };
        for segment in segments {
            current = match current {
                RuleValue::Map(map) => match map.get(segment) {
                    Some(v) => v.clone(),
                    None => return RuleValue::Missing,
                },
                _ => return RuleValue::Missing,
            };
        }
        current
    }
}

/// Evaluates an expression to a value. Total: never panics, never errors.
pub(crate) fn eval(expr: &Expr, ctx: &EvalContext, program: &Program) -> RuleValue {
    match expr {
        Expr::Null => RuleValue::Null,
        Expr::Bool(b) => RuleValue::Bool(*b),
        Expr::Int(i) => RuleValue::Int(*i),
        Expr::Float(v) => RuleValue::Float(*v),
        Expr::Str(s) => RuleValue::String(s.clone()),
        Expr::List(items) => {
            RuleValue::List(items.iter().map(|e| eval(e, ctx, program)).collect())
        }
        Expr::Path { root, segments } => ctx.resolve(root, segments),
        Expr::Not(inner) => match eval(inner, ctx, program) {
            RuleValue::Bool(b) => RuleValue::Bool(!b),
            // Negating a non-boolean is false, not an inverted guess.
            _ => RuleValue::Bool(false),
        },
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx, program),
        Expr::Call { func, args } => eval_call(*func, args, ctx, program),
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &EvalContext,
    program: &Program,
) -> RuleValue {
    match op {
        BinaryOp::And => {
            let l = eval(lhs, ctx, program);
            if l != RuleValue::Bool(true) {
                return RuleValue::Bool(false);
            }
            RuleValue::Bool(eval(rhs, ctx, program) == RuleValue::Bool(true))
        }
        BinaryOp::Or => {
            let l = eval(lhs, ctx, program);
            if l == RuleValue::Bool(true) {
                return RuleValue::Bool(true);
            }
            RuleValue::Bool(eval(rhs, ctx, program) == RuleValue::Bool(true))
        }
        BinaryOp::Eq => RuleValue::Bool(values_equal(
            &eval(lhs, ctx, program),
            &eval(rhs, ctx, program),
        )),
        BinaryOp::Ne => RuleValue::Bool(!values_equal(
            &eval(lhs, ctx, program),
            &eval(rhs, ctx, program),
        )),
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            let ordering = compare(&eval(lhs, ctx, program), &eval(rhs, ctx, program));
            let result = match (op, ordering) {
                (BinaryOp::Lt, Some(o)) => o.is_lt(),
                (BinaryOp::Lte, Some(o)) => o.is_le(),
                (BinaryOp::Gt, Some(o)) => o.is_gt(),
                (BinaryOp::Gte, Some(o)) => o.is_ge(),
                _ => false,
            };
            RuleValue::Bool(result)
        }
        BinaryOp::In => {
            let needle = eval(lhs, ctx, program);
            let haystack = eval(rhs, ctx, program);
            let found = match haystack {
                RuleValue::List(items) => items.iter().any(|item| values_equal(&needle, item)),
                RuleValue::String(s) => match needle {
                    RuleValue::String(sub) => s.contains(sub.as_str()),
                    _ => false,
                },
                _ => false,
            };
            RuleValue::Bool(found)
        }
    }
}

fn eval_call(func: Func, args: &[Expr], ctx: &EvalContext, program: &Program) -> RuleValue {
    match func {
        Func::Size => match eval(&args[0], ctx, program) {
            RuleValue::String(s) => RuleValue::Int(s.chars().count() as i64),
            RuleValue::List(items) => RuleValue::Int(items.len() as i64),
            RuleValue::Map(map) => RuleValue::Int(map.len() as i64),
            _ => RuleValue::Int(0),
        },
        Func::Has => RuleValue::Bool(eval(&args[0], ctx, program).is_present()),
        Func::Matches => {
            let subject = eval(&args[0], ctx, program);
            let pattern = eval(&args[1], ctx, program);
            match (subject, pattern) {
                (RuleValue::String(s), RuleValue::String(p)) => {
                    RuleValue::Bool(program.regex_matches(&p, &s))
                }
                _ => RuleValue::Bool(false),
            }
        }
        Func::StartsWith => str_pair(args, ctx, program, |s, sub| s.starts_with(sub)),
        Func::EndsWith => str_pair(args, ctx, program, |s, sub| s.ends_with(sub)),
        Func::Contains => str_pair(args, ctx, program, |s, sub| s.contains(sub)),
        Func::Timestamp => match eval(&args[0], ctx, program) {
            RuleValue::String(s) => match DateTime::parse_from_rfc3339(&s) {
                Ok(dt) => RuleValue::Timestamp(dt.with_timezone(&Utc)),
                Err(_) => RuleValue::Null,
            },
            RuleValue::Timestamp(dt) => RuleValue::Timestamp(dt),
            _ => RuleValue::Null,
        },
    }
}

fn str_pair(
    args: &[Expr],
    ctx: &EvalContext,
    program: &Program,
    f: impl Fn(&str, &str) -> bool,
) -> RuleValue {
    let a = eval(&args[0], ctx, program);
    let b = eval(&args[1], ctx, program);
    match (a, b) {
        (RuleValue::String(s), RuleValue::String(sub)) => RuleValue::Bool(f(&s, &sub)),
        _ => RuleValue::Bool(false),
    }
}

fn values_equal(a: &RuleValue, b: &RuleValue) -> bool {
    use RuleValue::*;
    match (a, b) {
        // Absent and null are indistinguishable to ==; `has` tells
        // them apart.
        (Missing | Null, Missing | Null) => true,
        (Int(x), Float(y)) | (Float(y), Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn compare(a: &RuleValue, b: &RuleValue) -> Option<std::cmp::Ordering> {
    use RuleValue::*;
    match (a, b) {
        (Int(x), Int(y)) => Some(x.cmp(y)),
        (Float(x), Float(y)) => x.partial_cmp(y),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)),
        (String(x), String(y)) => Some(x.cmp(y)),
        (Timestamp(x), Timestamp(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
