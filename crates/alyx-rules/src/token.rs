use logos::Logos;

/// Tokens of the rule expression language.
///
/// Whitespace is skipped automatically by logos; the language has no
/// comments.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token {
    // -- Keywords --
    #[token("in")]
    In,

    #[token("true")]
    True,

    #[token("false")]
    False,

    #[token("null")]
    Null,

    // -- Operators --
    #[token("==")]
    EqEq,

    #[token("!=")]
    NotEq,

    #[token("<=")]
    LessEq,

    #[token(">=")]
    GreaterEq,

    #[token("<")]
    Less,

    #[token(">")]
    Greater,

    #[token("&&")]
    AndAnd,

    #[token("||")]
    OrOr,

    #[token("!")]
    Bang,

    #[token(".")]
    Dot,

    #[token(",")]
    Comma,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    // -- Literals --
    /// A double-quoted string literal, e.g. `"general"`.
    #[regex(r#""([^"\\]|\\.)*""#)]
    StringLiteral,

    /// A float literal, e.g. `3.5`. Listed before integers so the
    /// longer match wins.
    #[regex(r"-?[0-9]+\.[0-9]+")]
    FloatLiteral,

    /// An integer literal, e.g. `42` or `-1`.
    #[regex(r"-?[0-9]+")]
    IntLiteral,

    /// An identifier: variable roots, path segments, function names.
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,
}

impl Token {
    /// A human-readable description used in parse errors.
    pub fn description(&self) -> &'static str {
        match self {
            Self::In => "'in'",
            Self::True => "'true'",
            Self::False => "'false'",
            Self::Null => "'null'",
            Self::EqEq => "'=='",
            Self::NotEq => "'!='",
            Self::LessEq => "'<='",
            Self::GreaterEq => "'>='",
            Self::Less => "'<'",
            Self::Greater => "'>'",
            Self::AndAnd => "'&&'",
            Self::OrOr => "'||'",
            Self::Bang => "'!'",
            Self::Dot => "'.'",
            Self::Comma => "','",
            Self::LParen => "'('",
            Self::RParen => "')'",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::StringLiteral => "string literal",
            Self::FloatLiteral => "float literal",
            Self::IntLiteral => "integer literal",
            Self::Ident => "identifier",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Token::lexer(source).map(|r| r.unwrap()).collect()
    }

    #[test]
    fn lex_comparison() {
        assert_eq!(
            lex("doc.published == true"),
            vec![Token::Ident, Token::Dot, Token::Ident, Token::EqEq, Token::True]
        );
    }

    #[test]
    fn lex_operators() {
        assert_eq!(
            lex("a != b && c <= d || !e"),
            vec![
                Token::Ident,
                Token::NotEq,
                Token::Ident,
                Token::AndAnd,
                Token::Ident,
                Token::LessEq,
                Token::Ident,
                Token::OrOr,
                Token::Bang,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn lex_literals() {
        assert_eq!(
            lex(r#""hi" 42 -1 3.5 null"#),
            vec![
                Token::StringLiteral,
                Token::IntLiteral,
                Token::IntLiteral,
                Token::FloatLiteral,
                Token::Null,
            ]
        );
    }

    #[test]
    fn lex_in_keyword_vs_ident() {
        assert_eq!(lex("role in roles"), vec![Token::Ident, Token::In, Token::Ident]);
        // 'inner' must lex as one identifier, not 'in' + 'ner'.
        assert_eq!(lex("inner"), vec![Token::Ident]);
    }

    #[test]
    fn lex_invalid_character_errors() {
        let mut lexer = Token::lexer("a # b");
        assert!(lexer.next().unwrap().is_ok());
        assert!(lexer.next().unwrap().is_err());
    }
}
