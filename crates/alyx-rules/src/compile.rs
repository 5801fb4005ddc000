use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use alyx_core::types::{Operation, Schema};

use crate::ast::{Expr, Func};
use crate::error::RuleError;
use crate::eval::{eval, EvalContext, RuleValue};
use crate::parser::parse;

/// A pattern passed to `matches` may at most be this long when it
/// arrives dynamically (not as a literal); longer patterns fail closed.
const MAX_DYNAMIC_PATTERN_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// A compiled rule expression: validated AST plus precompiled regexes.
///
/// Programs are immutable and shared (`Arc`) across every request
/// evaluating the same rule; evaluation takes `&self` only.
#[derive(Debug)]
pub struct Program {
    source: String,
    expr: Expr,
    /// Literal `matches` patterns, compiled once here.
    regexes: HashMap<String, Regex>,
}

impl Program {
    /// Compiles a rule expression.
    pub fn compile(source: &str) -> Result<Self, RuleError> {
        let expr = parse(source)?;
        let mut regexes = HashMap::new();
        collect_literal_patterns(&expr, &mut |pattern, span| {
            if regexes.contains_key(pattern) {
                return Ok(());
            }
            let compiled = Regex::new(pattern).map_err(|_| RuleError::InvalidRegex {
                pattern: pattern.to_string(),
                span: span.clone(),
            })?;
            regexes.insert(pattern.to_string(), compiled);
            Ok(())
        })?;
        Ok(Self {
            source: source.to_string(),
            expr,
            regexes,
        })
    }

    /// The original rule source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates to a raw value. Pure; safe for concurrent callers.
    pub fn eval(&self, ctx: &EvalContext) -> RuleValue {
        eval(&self.expr, ctx, self)
    }

    /// The policy decision: allow only on a strict boolean `true`.
    pub fn check(&self, ctx: &EvalContext) -> bool {
        self.eval(ctx) == RuleValue::Bool(true)
    }

    /// Regex dispatch for `matches`: precompiled literals hit the
    /// cache; dynamic patterns compile ad hoc with a length cap.
    pub(crate) fn regex_matches(&self, pattern: &str, subject: &str) -> bool {
        if let Some(re) = self.regexes.get(pattern) {
            return re.is_match(subject);
        }
        if pattern.len() > MAX_DYNAMIC_PATTERN_LEN {
            return false;
        }
        Regex::new(pattern).map(|re| re.is_match(subject)).unwrap_or(false)
    }

    /// Yields every doc field the expression touches (first path
    /// segment under the `doc` root, `previous` skipped).
    pub fn doc_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        self.expr.walk_paths(&mut |root, segments| {
            if root != "doc" {
                return;
            }
            let field = match segments.first().map(String::as_str) {
                Some("previous") => segments.get(1),
                Some(_) => segments.first(),
                None => None,
            };
            if let Some(field) = field {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
        });
        fields
    }
}

/// Parse + field check for interactive rule editing.
///
/// `allowed_fields` is the collection's field-name set; any other doc
/// field is rejected so typos surface in the editor instead of
/// evaluating to `Missing` forever.
pub fn validate(source: &str, allowed_fields: &[&str]) -> Result<(), RuleError> {
    let program = Program::compile(source)?;
    for field in program.doc_fields() {
        if !allowed_fields.contains(&field.as_str()) {
            return Err(RuleError::UnknownDocField {
                field,
                span: crate::error::Span::new(0, source.len()),
            });
        }
    }
    Ok(())
}

fn collect_literal_patterns(
    expr: &Expr,
    collect: &mut impl FnMut(&str, &crate::error::Span) -> Result<(), RuleError>,
) -> Result<(), RuleError> {
    match expr {
        Expr::Call { func: Func::Matches, args } => {
            if let Some(Expr::Str(pattern)) = args.get(1) {
                // Spans are not kept on the AST; report against the
                // whole pattern text.
                let span = crate::error::Span::new(0, pattern.len());
                collect(pattern, &span)?;
            }
            for arg in args {
                collect_literal_patterns(arg, collect)?;
            }
            Ok(())
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_literal_patterns(arg, collect)?;
            }
            Ok(())
        }
        Expr::Not(inner) => collect_literal_patterns(inner, collect),
        Expr::Binary { lhs, rhs, .. } => {
            collect_literal_patterns(lhs, collect)?;
            collect_literal_patterns(rhs, collect)
        }
        Expr::List(items) => {
            for item in items {
                collect_literal_patterns(item, collect)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// RuleSet
// ---------------------------------------------------------------------------

/// A rule that failed to compile, with its location in the schema.
#[derive(Debug, Clone)]
pub struct CompileFailure {
    /// Collection or bucket name.
    pub scope: String,
    pub operation: Operation,
    pub error: RuleError,
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule for {} on '{}': {}",
            self.operation, self.scope, self.error
        )
    }
}

impl std::error::Error for CompileFailure {}

/// Every compiled rule of a schema, keyed by (name, operation).
///
/// Built once per schema load and swapped atomically with the registry
/// snapshot; readers share it via `Arc`.
#[derive(Debug, Default)]
pub struct RuleSet {
    collections: HashMap<(String, Operation), Arc<Program>>,
    buckets: HashMap<(String, Operation), Arc<Program>>,
}

impl RuleSet {
    /// Compiles every rule in the schema. Any failure prevents the
    /// schema from going live; all failures are reported at once.
    pub fn compile(schema: &Schema) -> Result<Self, Vec<CompileFailure>> {
        let mut set = Self::default();
        let mut failures = Vec::new();

        for collection in &schema.collections {
            for (op, source) in collection.rules.iter() {
                match Program::compile(source) {
                    Ok(program) => {
                        set.collections.insert(
                            (collection.name.as_str().to_string(), op),
                            Arc::new(program),
                        );
                    }
                    Err(error) => failures.push(CompileFailure {
                        scope: collection.name.as_str().to_string(),
                        operation: op,
                        error,
                    }),
                }
            }
        }

        for (name, bucket) in &schema.buckets {
            for (op, source) in bucket.rules.iter() {
                match Program::compile(source) {
                    Ok(program) => {
                        set.buckets.insert((name.clone(), op), Arc::new(program));
                    }
                    Err(error) => failures.push(CompileFailure {
                        scope: name.clone(),
                        operation: op,
                        error,
                    }),
                }
            }
        }

        if failures.is_empty() {
            Ok(set)
        } else {
            Err(failures)
        }
    }

    /// The compiled program for a collection operation, if one exists.
    pub fn collection_program(&self, collection: &str, op: Operation) -> Option<&Arc<Program>> {
        self.collections.get(&(collection.to_string(), op))
    }

    /// The compiled program for a bucket operation, if one exists.
    pub fn bucket_program(&self, bucket: &str, op: Operation) -> Option<&Arc<Program>> {
        self.buckets.get(&(bucket.to_string(), op))
    }

    /// The policy decision for a collection operation.
    ///
    /// A missing rule allows: the engine is default-open, and the data
    /// gateway separately requires authentication for mutations.
    pub fn check_collection(&self, collection: &str, op: Operation, ctx: &EvalContext) -> bool {
        match self.collection_program(collection, op) {
            Some(program) => program.check(ctx),
            None => true,
        }
    }

    /// The policy decision for a bucket operation; same default.
    pub fn check_bucket(&self, bucket: &str, op: Operation, ctx: &EvalContext) -> bool {
        match self.bucket_program(bucket, op) {
            Some(program) => program.check(ctx),
            None => true,
        }
    }

    /// The number of compiled programs.
    pub fn len(&self) -> usize {
        self.collections.len() + self.buckets.len()
    }

    /// Returns true if no rule is declared anywhere.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alyx_core::types::{
        Bucket, Collection, CollectionName, FieldDefinition, FieldName, FieldType, Rules,
    };

    fn schema_with_rule(op_rule: (&str, &str)) -> Schema {
        let mut collection = Collection::new(
            CollectionName::new("posts").unwrap(),
            vec![
                FieldDefinition::new(FieldName::new("published").unwrap(), FieldType::Bool),
                FieldDefinition::new(FieldName::new("author_id").unwrap(), FieldType::String),
            ],
        );
        let mut rules = Rules::default();
        match op_rule.0 {
            "create" => rules.create = Some(op_rule.1.to_string()),
            "read" => rules.read = Some(op_rule.1.to_string()),
            "update" => rules.update = Some(op_rule.1.to_string()),
            _ => rules.delete = Some(op_rule.1.to_string()),
        }
        collection.rules = rules;
        let mut schema = Schema {
            collections: vec![collection],
            ..Schema::default()
        };
        schema.validate().unwrap();
        schema
    }

    #[test]
    fn compile_whole_schema() {
        let schema = schema_with_rule(("read", "doc.published == true"));
        let rules = RuleSet::compile(&schema).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules
            .collection_program("posts", Operation::Read)
            .is_some());
        assert!(rules
            .collection_program("posts", Operation::Create)
            .is_none());
    }

    #[test]
    fn compile_failure_reports_scope_and_op() {
        let schema = schema_with_rule(("read", "doc.published =="));
        let failures = RuleSet::compile(&schema).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].scope, "posts");
        assert_eq!(failures[0].operation, Operation::Read);
        assert!(failures[0].to_string().contains("posts"));
    }

    #[test]
    fn missing_rule_allows() {
        let schema = schema_with_rule(("read", "doc.published == true"));
        let rules = RuleSet::compile(&schema).unwrap();
        let ctx = EvalContext::new();
        assert!(rules.check_collection("posts", Operation::Delete, &ctx));
        assert!(rules.check_collection("unknown", Operation::Read, &ctx));
    }

    #[test]
    fn bucket_rules_compiled_with_download() {
        let mut bucket = Bucket::new("avatars");
        bucket.rules.download = Some("has(auth.id)".to_string());
        let mut schema = Schema::default();
        schema.buckets.insert("avatars".into(), bucket);
        schema.validate().unwrap();

        let rules = RuleSet::compile(&schema).unwrap();
        assert!(rules.bucket_program("avatars", Operation::Download).is_some());
        assert!(!rules.check_bucket("avatars", Operation::Download, &EvalContext::new()));
        let authed = EvalContext::new().with_auth(&serde_json::json!({"id": "u1"}));
        assert!(rules.check_bucket("avatars", Operation::Download, &authed));
    }

    #[test]
    fn literal_regex_precompiled_and_invalid_rejected() {
        let program = Program::compile(r#"matches(doc.author_id, "^[a-z]+$")"#).unwrap();
        assert_eq!(program.regexes.len(), 1);

        let err = Program::compile(r#"matches(doc.author_id, "[unclosed")"#).unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex { .. }));
    }

    #[test]
    fn validate_rejects_unknown_doc_field() {
        let err = validate("doc.titel == \"x\"", &["title", "body"]).unwrap_err();
        assert!(matches!(err, RuleError::UnknownDocField { field, .. } if field == "titel"));

        assert!(validate("doc.title == \"x\"", &["title", "body"]).is_ok());
        // previous.<field> resolves against the same field set.
        assert!(validate("doc.previous.title != doc.title", &["title"]).is_ok());
        // Non-doc roots are not checked against the field set.
        assert!(validate("auth.role == \"admin\"", &["title"]).is_ok());
    }

    #[test]
    fn doc_fields_extraction() {
        let program =
            Program::compile("doc.a == 1 && doc.previous.b == 2 || size(doc.c) > 0").unwrap();
        assert_eq!(program.doc_fields(), vec!["a", "b", "c"]);
    }

    #[test]
    fn program_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Program>();
        assert_send_sync::<RuleSet>();
    }
}
