use logos::Logos;

use crate::ast::{BinaryOp, Expr, Func};
use crate::error::{RuleError, Span};
use crate::token::Token;

/// A token paired with its source span and text.
#[derive(Debug, Clone)]
struct SpannedToken {
    token: Token,
    span: Span,
    text: String,
}

/// The variable roots the language defines.
const ROOTS: [&str; 4] = ["auth", "doc", "file", "request"];

/// Parses a rule expression into an AST.
///
/// Variable roots and builtin function names are resolved here, so a
/// successful parse means the expression is structurally evaluable.
pub fn parse(source: &str) -> Result<Expr, RuleError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(RuleError::EmptyExpression);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(RuleError::UnexpectedToken {
            expected: "end of expression".to_string(),
            found: format!("{} ('{}')", extra.token.description(), extra.text),
            span: extra.span.clone(),
        });
    }
    Ok(expr)
}

fn tokenize(source: &str) -> Result<Vec<SpannedToken>, RuleError> {
    let mut tokens = Vec::new();
    let lexer = Token::lexer(source);
    for (result, range) in lexer.spanned() {
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => tokens.push(SpannedToken {
                token,
                span,
                text: source[range].to_string(),
            }),
            Err(()) => return Err(RuleError::InvalidToken { span }),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    // -- Cursor helpers --

    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn peek_token(&self) -> Option<&Token> {
        self.peek().map(|st| &st.token)
    }

    fn advance(&mut self) -> Option<SpannedToken> {
        if self.pos < self.tokens.len() {
            let tok = self.tokens[self.pos].clone();
            self.pos += 1;
            Some(tok)
        } else {
            None
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<SpannedToken, RuleError> {
        match self.advance() {
            Some(st) if st.token == *expected => Ok(st),
            Some(st) => Err(RuleError::UnexpectedToken {
                expected: expected.description().to_string(),
                found: format!("{} ('{}')", st.token.description(), st.text),
                span: st.span,
            }),
            None => Err(RuleError::UnexpectedEndOfInput {
                expected: expected.description().to_string(),
            }),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek_token() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    // -- Grammar productions, lowest precedence first --

    /// or = and ("||" and)*
    fn parse_or(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// and = equality ("&&" equality)*
    fn parse_and(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// equality = comparison (("==" | "!=") comparison)*
    fn parse_equality(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = if self.eat(&Token::EqEq) {
                BinaryOp::Eq
            } else if self.eat(&Token::NotEq) {
                BinaryOp::Ne
            } else {
                break;
            };
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// comparison = unary (("<" | "<=" | ">" | ">=" | "in") unary)*
    fn parse_comparison(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.eat(&Token::Less) {
                BinaryOp::Lt
            } else if self.eat(&Token::LessEq) {
                BinaryOp::Lte
            } else if self.eat(&Token::Greater) {
                BinaryOp::Gt
            } else if self.eat(&Token::GreaterEq) {
                BinaryOp::Gte
            } else if self.eat(&Token::In) {
                BinaryOp::In
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// unary = "!" unary | primary
    fn parse_unary(&mut self) -> Result<Expr, RuleError> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    /// primary = literal | list | "(" or ")" | call | path
    fn parse_primary(&mut self) -> Result<Expr, RuleError> {
        let st = match self.advance() {
            Some(st) => st,
            None => {
                return Err(RuleError::UnexpectedEndOfInput {
                    expected: "expression".to_string(),
                })
            }
        };

        match st.token {
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::IntLiteral => st
                .text
                .parse::<i64>()
                .map(Expr::Int)
                .map_err(|_| RuleError::InvalidNumberLiteral {
                    text: st.text.clone(),
                    span: st.span,
                }),
            Token::FloatLiteral => st
                .text
                .parse::<f64>()
                .map(Expr::Float)
                .map_err(|_| RuleError::InvalidNumberLiteral {
                    text: st.text.clone(),
                    span: st.span,
                }),
            Token::StringLiteral => {
                unescape(&st.text).map(Expr::Str).ok_or(
                    RuleError::InvalidStringLiteral { span: st.span },
                )
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::Ident => {
                if self.peek_token() == Some(&Token::LParen) {
                    self.parse_call(&st)
                } else {
                    self.parse_path(&st)
                }
            }
            other => Err(RuleError::UnexpectedToken {
                expected: "expression".to_string(),
                found: format!("{} ('{}')", other.description(), st.text),
                span: st.span,
            }),
        }
    }

    /// call = IDENT "(" (or ("," or)*)? ")"
    fn parse_call(&mut self, name: &SpannedToken) -> Result<Expr, RuleError> {
        let func = Func::parse(&name.text).ok_or_else(|| RuleError::UnknownFunction {
            name: name.text.clone(),
            span: name.span.clone(),
        })?;
        self.expect(&Token::LParen)?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }

        if args.len() != func.arity() {
            return Err(RuleError::WrongArity {
                function: func.name().to_string(),
                expected: func.arity(),
                found: args.len(),
                span: name.span.clone(),
            });
        }

        Ok(Expr::Call { func, args })
    }

    /// path = ROOT ("." IDENT)*
    fn parse_path(&mut self, root: &SpannedToken) -> Result<Expr, RuleError> {
        if !ROOTS.contains(&root.text.as_str()) {
            return Err(RuleError::UnknownVariable {
                name: root.text.clone(),
                span: root.span.clone(),
            });
        }

        let mut segments = Vec::new();
        while self.eat(&Token::Dot) {
            let seg = match self.advance() {
                // Keywords double as path segments: `doc.in` is a
                // legal field access.
                Some(st) if matches!(st.token, Token::Ident | Token::In) => st,
                Some(st) => {
                    return Err(RuleError::UnexpectedToken {
                        expected: "field name".to_string(),
                        found: format!("{} ('{}')", st.token.description(), st.text),
                        span: st.span,
                    })
                }
                None => {
                    return Err(RuleError::UnexpectedEndOfInput {
                        expected: "field name".to_string(),
                    })
                }
            };
            segments.push(seg.text);
        }

        Ok(Expr::Path {
            root: root.text.clone(),
            segments,
        })
    }
}

/// Strips quotes and resolves `\"`, `\\`, `\n`, `\t` escapes.
fn unescape(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                'n' => out.push('\n'),
                't' => out.push('\t'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comparison() {
        let expr = parse("doc.published == true").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Eq,
                lhs: Box::new(Expr::Path {
                    root: "doc".into(),
                    segments: vec!["published".into()],
                }),
                rhs: Box::new(Expr::Bool(true)),
            }
        );
    }

    #[test]
    fn precedence_or_binds_loosest() {
        // a == b || c == d parses as (a == b) || (c == d)
        let expr = parse("doc.a == 1 || doc.b == 2").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Or, .. }));
    }

    #[test]
    fn precedence_and_over_or() {
        let expr = parse("doc.a == 1 || doc.b == 2 && doc.c == 3").unwrap();
        // Top node must be Or; the And groups to the right.
        match expr {
            Expr::Binary { op: BinaryOp::Or, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::And, .. }));
            }
            other => panic!("expected Or at top, got {other:?}"),
        }
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let expr = parse("!has(auth.id) && doc.open == true").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::And, lhs, .. } => {
                assert!(matches!(*lhs, Expr::Not(_)));
            }
            other => panic!("expected And at top, got {other:?}"),
        }
    }

    #[test]
    fn parse_in_list() {
        let expr = parse(r#"auth.role in ["admin", "editor"]"#).unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::In, rhs, .. } => match *rhs {
                Expr::List(items) => assert_eq!(items.len(), 2),
                other => panic!("expected list, got {other:?}"),
            },
            other => panic!("expected In, got {other:?}"),
        }
    }

    #[test]
    fn parse_nested_call() {
        let expr = parse(r#"matches(doc.slug, "^[a-z-]+$")"#).unwrap();
        assert!(matches!(expr, Expr::Call { func: Func::Matches, .. }));
    }

    #[test]
    fn parse_parenthesized() {
        let expr = parse("(doc.a == 1 || doc.b == 2) && has(auth.id)").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn unknown_variable_rejected_with_span() {
        let err = parse("user.id == 1").unwrap_err();
        match err {
            RuleError::UnknownVariable { name, span } => {
                assert_eq!(name, "user");
                assert_eq!(span, Span::new(0, 4));
            }
            other => panic!("expected UnknownVariable, got {other}"),
        }
    }

    #[test]
    fn unknown_function_rejected() {
        let err = parse("frobnicate(doc.x)").unwrap_err();
        assert!(matches!(err, RuleError::UnknownFunction { .. }));
    }

    #[test]
    fn wrong_arity_rejected() {
        let err = parse("matches(doc.x)").unwrap_err();
        assert!(matches!(
            err,
            RuleError::WrongArity { expected: 2, found: 1, .. }
        ));
    }

    #[test]
    fn trailing_tokens_rejected() {
        let err = parse("doc.a == 1 doc.b").unwrap_err();
        assert!(matches!(err, RuleError::UnexpectedToken { .. }));
    }

    #[test]
    fn empty_expression_rejected() {
        assert_eq!(parse("").unwrap_err(), RuleError::EmptyExpression);
        assert_eq!(parse("   ").unwrap_err(), RuleError::EmptyExpression);
    }

    #[test]
    fn string_escapes() {
        let expr = parse(r#"doc.title == "say \"hi\"""#).unwrap();
        match expr {
            Expr::Binary { rhs, .. } => assert_eq!(*rhs, Expr::Str("say \"hi\"".into())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deep_path() {
        let expr = parse("doc.previous.title == doc.title").unwrap();
        match expr {
            Expr::Binary { lhs, .. } => {
                assert_eq!(
                    *lhs,
                    Expr::Path {
                        root: "doc".into(),
                        segments: vec!["previous".into(), "title".into()],
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
