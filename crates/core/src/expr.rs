//! Targeting expressions.
//!
//! Items and bundles carry a boolean predicate over target facts, written as
//! text and parsed when the bundle is loaded:
//!
//! ```text
//! os.version >= 10.0.19041 AND groups contains "Sales" AND NOT on_battery == true
//! site in [hq, "branch-2"] OR tags contains kiosk
//! ```
//!
//! `AND` binds tighter than `OR`; keywords are case-insensitive. An empty
//! expression always matches. Syntax errors are reported as
//! [`PredicateError`] at load time, never mid-cycle.

use serde::{Deserialize, Serialize};

/// Maximum nesting depth accepted by the parser and by [`Expr::validate`].
pub const MAX_DEPTH: usize = 32;

/// Errors raised while parsing or validating a targeting expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    /// Malformed expression text
    #[error("syntax error at offset {position}: {message}")]
    Syntax {
        /// Byte offset of the offending token
        position: usize,
        /// What went wrong
        message: String,
    },

    /// Expression nests deeper than [`MAX_DEPTH`]
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    /// Fact name is empty or has invalid characters
    #[error("invalid fact name {0:?}")]
    InvalidFact(String),

    /// `in []` with no candidates
    #[error("empty set for fact {0:?}")]
    EmptySet(String),

    /// Ordering comparison against a literal that is neither a number nor a version
    #[error("fact {fact:?} is compared with {literal:?}, which is not a number or version")]
    NotOrderable {
        /// Fact name
        fact: String,
        /// Offending literal
        literal: String,
    },

    /// `AND`/`OR` without operands
    #[error("empty AND/OR group")]
    EmptyGroup,
}

/// Comparison operator of a [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CompareOp {
    /// Whether the operator orders values (as opposed to testing equality).
    pub fn is_ordering(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::NotEq)
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

/// Literal operand of a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// `true` / `false`
    Bool(bool),
    /// Quoted string
    Text(String),
    /// Bare word: identifier, number or dotted version
    Word(String),
}

impl Literal {
    /// Textual form used for equality and membership checks.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Literal::Bool(b) => std::borrow::Cow::Owned(b.to_string()),
            Literal::Text(s) | Literal::Word(s) => std::borrow::Cow::Borrowed(s),
        }
    }

    fn is_orderable(&self) -> bool {
        match self {
            Literal::Bool(_) => false,
            Literal::Text(s) | Literal::Word(s) => {
                s.parse::<f64>().is_ok() || crate::fact::Version::parse(s).is_some()
            }
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Word(w) => f.write_str(w),
            Literal::Text(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str("\"")
            }
        }
    }
}

/// A leaf test against one fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// `fact <op> literal`
    Compare {
        /// Fact name
        fact: String,
        /// Operator
        op: CompareOp,
        /// Right-hand side
        value: Literal,
    },
    /// `fact contains literal`: list fact holds the literal
    Contains {
        /// Fact name
        fact: String,
        /// Member to look for
        value: Literal,
    },
    /// `fact in [a, b]`: scalar fact is one of the literals
    In {
        /// Fact name
        fact: String,
        /// Candidates
        values: Vec<Literal>,
    },
    /// `fact exists`
    Exists {
        /// Fact name
        fact: String,
    },
}

impl Predicate {
    /// Name of the fact this predicate reads.
    pub fn fact(&self) -> &str {
        match self {
            Predicate::Compare { fact, .. }
            | Predicate::Contains { fact, .. }
            | Predicate::In { fact, .. }
            | Predicate::Exists { fact } => fact,
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Compare { fact, op, value } => write!(f, "{} {} {}", fact, op.symbol(), value),
            Predicate::Contains { fact, value } => write!(f, "{} contains {}", fact, value),
            Predicate::In { fact, values } => {
                let list: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{} in [{}]", fact, list.join(", "))
            }
            Predicate::Exists { fact } => write!(f, "{} exists", fact),
        }
    }
}

/// Boolean expression tree over target facts.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant; `Const(true)` is the empty expression
    Const(bool),
    /// Leaf predicate
    Predicate(Predicate),
    /// Negation
    Not(Box<Expr>),
    /// Conjunction
    And(Vec<Expr>),
    /// Disjunction
    Or(Vec<Expr>),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Const(true)
    }
}

impl Expr {
    /// The always-true expression.
    pub fn always() -> Self {
        Expr::Const(true)
    }

    /// Whether this is the empty (always-true) expression.
    pub fn is_always(&self) -> bool {
        matches!(self, Expr::Const(true))
    }

    /// Parse expression text. Empty or whitespace-only text is [`Expr::always`].
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Expr::always());
        }
        let mut parser = Parser { tokens, pos: 0, depth: 0, end: input.len() };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(PredicateError::Syntax {
                position: tok.offset,
                message: format!("unexpected {}", tok.kind.describe()),
            });
        }
        expr.validate()?;
        Ok(expr)
    }

    /// Structural checks applied to every expression before any cycle uses it.
    pub fn validate(&self) -> Result<(), PredicateError> {
        if self.depth() > MAX_DEPTH {
            return Err(PredicateError::TooDeep(MAX_DEPTH));
        }
        self.validate_nodes()
    }

    fn validate_nodes(&self) -> Result<(), PredicateError> {
        match self {
            Expr::Const(_) => Ok(()),
            Expr::Not(inner) => inner.validate_nodes(),
            Expr::And(children) | Expr::Or(children) => {
                if children.is_empty() {
                    return Err(PredicateError::EmptyGroup);
                }
                children.iter().try_for_each(Expr::validate_nodes)
            }
            Expr::Predicate(p) => {
                if !is_valid_fact_name(p.fact()) {
                    return Err(PredicateError::InvalidFact(p.fact().to_string()));
                }
                match p {
                    Predicate::In { fact, values } if values.is_empty() => {
                        Err(PredicateError::EmptySet(fact.clone()))
                    }
                    Predicate::Compare { fact, op, value } if op.is_ordering() && !value.is_orderable() => {
                        Err(PredicateError::NotOrderable {
                            fact: fact.clone(),
                            literal: value.to_string(),
                        })
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Nesting depth; leaves have depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Const(_) | Expr::Predicate(_) => 1,
            Expr::Not(inner) => 1 + inner.depth(),
            Expr::And(children) | Expr::Or(children) => {
                1 + children.iter().map(Expr::depth).max().unwrap_or(0)
            }
        }
    }

    /// Names of all facts the expression reads, sorted and deduplicated.
    pub fn facts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_facts(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_facts<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Predicate(p) => out.push(p.fact()),
            Expr::Not(inner) => inner.collect_facts(out),
            Expr::And(children) | Expr::Or(children) => {
                children.iter().for_each(|c| c.collect_facts(out))
            }
        }
    }

    fn fmt_operand(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::And(_) | Expr::Or(_) | Expr::Not(_) => write!(f, "({})", self),
            _ => write!(f, "{}", self),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(b) => write!(f, "{}", b),
            Expr::Predicate(p) => write!(f, "{}", p),
            Expr::Not(inner) => {
                f.write_str("NOT ")?;
                inner.fmt_operand(f)
            }
            Expr::And(children) | Expr::Or(children) => {
                let sep = if matches!(self, Expr::And(_)) { " AND " } else { " OR " };
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    child.fmt_operand(f)?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for Expr {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expr::parse(s)
    }
}

impl TryFrom<String> for Expr {
    type Error = PredicateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Expr::parse(&s)
    }
}

impl From<Expr> for String {
    fn from(expr: Expr) -> Self {
        if expr.is_always() {
            String::new()
        } else {
            expr.to_string()
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text: String = self.clone().into();
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Expr::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn is_valid_fact_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'))
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Op(CompareOp),
    Quoted(String),
    Word(String),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::LBracket => "'['".into(),
            TokenKind::RBracket => "']'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::Op(op) => format!("'{}'", op.symbol()),
            TokenKind::Quoted(s) => format!("string {:?}", s),
            TokenKind::Word(w) => format!("'{}'", w),
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, TokenKind::Word(w) if w.eq_ignore_ascii_case(kw))
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, PredicateError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let single = match c {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            ',' => Some(TokenKind::Comma),
            _ => None,
        };
        if let Some(kind) = single {
            chars.next();
            tokens.push(Token { kind, offset });
            continue;
        }

        if matches!(c, '=' | '!' | '<' | '>') {
            chars.next();
            let followed_by_eq = matches!(chars.peek(), Some(&(_, '=')));
            let op = match (c, followed_by_eq) {
                ('=', true) => CompareOp::Eq,
                ('!', true) => CompareOp::NotEq,
                ('<', true) => CompareOp::LtEq,
                ('>', true) => CompareOp::GtEq,
                ('<', false) => CompareOp::Lt,
                ('>', false) => CompareOp::Gt,
                _ => {
                    return Err(PredicateError::Syntax {
                        position: offset,
                        message: format!("unknown operator '{}'", c),
                    })
                }
            };
            if followed_by_eq {
                chars.next();
            }
            tokens.push(Token { kind: TokenKind::Op(op), offset });
            continue;
        }

        if c == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, ch)) = chars.next() {
                match ch {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some((_, escaped)) => text.push(escaped),
                        None => break,
                    },
                    other => text.push(other),
                }
            }
            if !closed {
                return Err(PredicateError::Syntax {
                    position: offset,
                    message: "unterminated string".into(),
                });
            }
            tokens.push(Token { kind: TokenKind::Quoted(text), offset });
            continue;
        }

        let mut word = String::new();
        while let Some(&(_, ch)) = chars.peek() {
            if ch.is_whitespace() || "()[],\"=!<>".contains(ch) {
                break;
            }
            word.push(ch);
            chars.next();
        }
        tokens.push(Token { kind: TokenKind::Word(word), offset });
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.offset).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<TokenKind> {
        let tok = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> PredicateError {
        PredicateError::Syntax {
            position: self.offset(),
            message: message.into(),
        }
    }

    fn enter(&mut self) -> Result<(), PredicateError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(PredicateError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, PredicateError> {
        let mut children = vec![self.parse_and()?];
        while self.peek().is_some_and(|t| t.is_keyword("or")) {
            self.next();
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 { children.remove(0) } else { Expr::Or(children) })
    }

    fn parse_and(&mut self) -> Result<Expr, PredicateError> {
        let mut children = vec![self.parse_unary()?];
        while self.peek().is_some_and(|t| t.is_keyword("and")) {
            self.next();
            children.push(self.parse_unary()?);
        }
        Ok(if children.len() == 1 { children.remove(0) } else { Expr::And(children) })
    }

    fn parse_unary(&mut self) -> Result<Expr, PredicateError> {
        match self.peek() {
            Some(t) if t.is_keyword("not") => {
                self.next();
                self.enter()?;
                let inner = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some(TokenKind::LParen) => {
                self.next();
                self.enter()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(TokenKind::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            _ => self.parse_predicate(),
        }
    }

    fn parse_predicate(&mut self) -> Result<Expr, PredicateError> {
        let fact = match self.next() {
            Some(TokenKind::Word(w)) => w,
            Some(other) => return Err(self.error(format!("expected fact name, found {}", other.describe()))),
            None => return Err(self.error("expected fact name, found end of input")),
        };
        if fact.eq_ignore_ascii_case("true") {
            return Ok(Expr::Const(true));
        }
        if fact.eq_ignore_ascii_case("false") {
            return Ok(Expr::Const(false));
        }

        let predicate = match self.next() {
            Some(TokenKind::Op(op)) => Predicate::Compare {
                fact,
                op,
                value: self.parse_literal()?,
            },
            Some(t) if t.is_keyword("contains") => Predicate::Contains {
                fact,
                value: self.parse_literal()?,
            },
            Some(t) if t.is_keyword("exists") => Predicate::Exists { fact },
            Some(t) if t.is_keyword("in") => {
                if self.next() != Some(TokenKind::LBracket) {
                    return Err(self.error("expected '[' after 'in'"));
                }
                let mut values = Vec::new();
                if self.peek() == Some(&TokenKind::RBracket) {
                    self.next();
                } else {
                    loop {
                        values.push(self.parse_literal()?);
                        match self.next() {
                            Some(TokenKind::Comma) => continue,
                            Some(TokenKind::RBracket) => break,
                            _ => return Err(self.error("expected ',' or ']'")),
                        }
                    }
                }
                Predicate::In { fact, values }
            }
            Some(other) => {
                return Err(self.error(format!(
                    "expected operator after fact '{}', found {}",
                    fact,
                    other.describe()
                )))
            }
            None => return Err(self.error(format!("expected operator after fact '{}'", fact))),
        };
        Ok(Expr::Predicate(predicate))
    }

    fn parse_literal(&mut self) -> Result<Literal, PredicateError> {
        match self.next() {
            Some(TokenKind::Quoted(s)) => Ok(Literal::Text(s)),
            Some(TokenKind::Word(w)) if w.eq_ignore_ascii_case("true") => Ok(Literal::Bool(true)),
            Some(TokenKind::Word(w)) if w.eq_ignore_ascii_case("false") => Ok(Literal::Bool(false)),
            Some(TokenKind::Word(w)) => Ok(Literal::Word(w)),
            Some(other) => Err(self.error(format!("expected value, found {}", other.describe()))),
            None => Err(self.error("expected value, found end of input")),
        }
    }
}
