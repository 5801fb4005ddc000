use std::fmt;

/// Binary operators, lowest to highest precedence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "in",
        };
        write!(f, "{s}")
    }
}

/// The builtin functions of the rule language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Func {
    Size,
    Has,
    Matches,
    StartsWith,
    EndsWith,
    Contains,
    Timestamp,
}

impl Func {
    /// Resolves a function name, if it is a builtin.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "size" => Some(Self::Size),
            "has" => Some(Self::Has),
            "matches" => Some(Self::Matches),
            "startsWith" => Some(Self::StartsWith),
            "endsWith" => Some(Self::EndsWith),
            "contains" => Some(Self::Contains),
            "timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }

    /// The number of arguments the builtin takes.
    pub fn arity(self) -> usize {
        match self {
            Self::Size | Self::Has | Self::Timestamp => 1,
            Self::Matches | Self::StartsWith | Self::EndsWith | Self::Contains => 2,
        }
    }

    /// The wire name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Has => "has",
            Self::Matches => "matches",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Contains => "contains",
            Self::Timestamp => "timestamp",
        }
    }
}

/// A parsed rule expression.
///
/// Expressions are pure and total: evaluation cannot fail, only
/// produce `false`-y results for type-confused input.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Expr>),
    /// A variable access path: `auth.id`, `doc.previous.title`.
    Path { root: String, segments: Vec<String> },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call { func: Func, args: Vec<Expr> },
}

impl Expr {
    /// Walks the expression, yielding every path node.
    pub fn walk_paths(&self, visit: &mut impl FnMut(&str, &[String])) {
        match self {
            Self::Path { root, segments } => visit(root, segments),
            Self::Not(inner) => inner.walk_paths(visit),
            Self::Binary { lhs, rhs, .. } => {
                lhs.walk_paths(visit);
                rhs.walk_paths(visit);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.walk_paths(visit);
                }
            }
            Self::List(items) => {
                for item in items {
                    item.walk_paths(visit);
                }
            }
            _ => {}
        }
    }
}
