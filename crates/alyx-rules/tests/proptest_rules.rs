//! Property tests: the evaluator is total and deterministic.

use proptest::prelude::*;

use alyx_core::value::{Document, Value};
use alyx_rules::{EvalContext, Program};

fn arb_doc() -> impl Strategy<Value = Document> {
    prop::collection::btree_map(
        prop::sample::select(vec![
            "published".to_string(),
            "author_id".to_string(),
            "score".to_string(),
            "title".to_string(),
        ]),
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,12}".prop_map(Value::String),
        ],
        0..4,
    )
}

const RULES: &[&str] = &[
    "doc.published == true || auth.id == doc.author_id",
    "doc.score >= 10 && doc.score <= 100",
    r#"auth.role in ["admin", "editor"]"#,
    r#"matches(doc.title, "^[a-z ]+$") && size(doc.title) > 0"#,
    "!has(auth.id)",
    r#"contains(doc.title, "x") || startsWith(doc.author_id, "u")"#,
];

proptest! {
    /// Evaluation never panics and yields the same decision on
    /// repeated calls with the same context.
    #[test]
    fn eval_is_total_and_deterministic(
        doc in arb_doc(),
        rule_idx in 0..RULES.len(),
        user in proptest::option::of("[a-z]{1,8}"),
    ) {
        let program = Program::compile(RULES[rule_idx]).unwrap();
        let mut ctx = EvalContext::new().with_doc(&doc);
        if let Some(user) = user {
            ctx = ctx.with_auth(&serde_json::json!({"id": user, "role": "viewer"}));
        }
        let first = program.check(&ctx);
        for _ in 0..10 {
            prop_assert_eq!(program.check(&ctx), first);
        }
    }

    /// Any input string either parses or errors; no panics.
    #[test]
    fn parse_never_panics(input in ".{0,64}") {
        let _ = alyx_rules::parse(&input);
    }
}
