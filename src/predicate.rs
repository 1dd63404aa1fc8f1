//! Predicates - boolean filter expressions over entity fields
//!
//! The same predicate is evaluated in two places: compiled to SQL for rows
//! already in the store, and evaluated in memory against objects still
//! pending in a context. Both use two-valued logic:
//! - `==` / `!=` are null-safe (`IS` / `IS NOT`)
//! - ordering comparisons and `LIKE` are false when the field is null
//!
//! Text syntax accepted by [`Predicate::parse`]:
//! `title == 'Dune' AND (pages > 300 OR NOT available == true)`

use crate::entity::{Entity, Value};
use crate::model::EntityDescription;
use crate::{Error, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// A boolean expression over the fields of one entity
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every object
    True,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare { field: field.into(), op, value: value.into() }
    }

    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    /// SQL `LIKE` pattern: `%` matches any run, `_` one character
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Like, Value::Text(pattern.into()))
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            this => Predicate::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            this => Predicate::Or(vec![this, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Parse the text form
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.parse_or()?;
        match parser.peek() {
            None => Ok(predicate),
            Some(tok) => Err(Error::Parse(format!("Unexpected {:?} in predicate", tok))),
        }
    }

    /// Resolve field names against an entity description and convert every
    /// literal to the type of the field it is compared with.
    pub fn bind(self, entity: &EntityDescription) -> Result<Self> {
        Ok(match self {
            Predicate::True => Predicate::True,
            Predicate::Compare { field, op, value } => {
                let desc = entity.require_field(&field)?;
                let value = if op == CompareOp::Like {
                    match value {
                        Value::Text(pattern) => Value::Text(pattern),
                        other => {
                            return Err(Error::Query(format!(
                                "LIKE on {}.{} needs a text pattern, got {}",
                                entity.name, field, other
                            )));
                        }
                    }
                } else {
                    value.clone().coerce(desc.ty).ok_or_else(|| {
                        Error::Query(format!(
                            "Cannot compare {}.{} ({}) with {:?}",
                            entity.name, field, desc.ty, value
                        ))
                    })?
                };
                Predicate::Compare { field, op, value }
            }
            Predicate::IsNull(field) => {
                entity.require_field(&field)?;
                Predicate::IsNull(field)
            }
            Predicate::IsNotNull(field) => {
                entity.require_field(&field)?;
                Predicate::IsNotNull(field)
            }
            Predicate::And(parts) => Predicate::And(
                parts.into_iter().map(|p| p.bind(entity)).collect::<Result<_>>()?,
            ),
            Predicate::Or(parts) => Predicate::Or(
                parts.into_iter().map(|p| p.bind(entity)).collect::<Result<_>>()?,
            ),
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.bind(entity)?)),
        })
    }

    /// Evaluate against an in-memory object
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Compare { field, op, value } => compare(entity.get(field), *op, value),
            Predicate::IsNull(field) => entity.get(field).is_null(),
            Predicate::IsNotNull(field) => !entity.get(field).is_null(),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(entity)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(entity)),
            Predicate::Not(inner) => !inner.matches(entity),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Like => match (actual, expected) {
            (Value::Null, _) => false,
            (actual, pattern) => match (actual.sql_text(), pattern.sql_text()) {
                (Some(text), Some(pattern)) => like_matches(&pattern, &text),
                _ => false,
            },
        },
        _ => {
            if actual.is_null() || expected.is_null() {
                return false;
            }
            let ord = actual.sort_cmp(expected);
            match op {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                _ => false,
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => a.sort_cmp(b) == Ordering::Equal,
    }
}

/// SQLite `LIKE` semantics: ASCII case-insensitive, `%` and `_` wildcards,
/// `\` escapes
fn like_matches(pattern: &str, text: &str) -> bool {
    let mut re = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    push_literal(&mut re, next);
                }
            }
            other => push_literal(&mut re, other),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(text)).unwrap_or(false)
}

fn push_literal(re: &mut String, c: char) {
    if c.is_ascii_alphabetic() {
        re.push('[');
        re.push(c.to_ascii_lowercase());
        re.push(c.to_ascii_uppercase());
        re.push(']');
    } else {
        re.push_str(&regex::escape(&c.to_string()));
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => write!(f, "TRUEPREDICATE"),
            Predicate::Compare { field, op, value } => match value {
                Value::Text(s) => write!(f, "{} {} '{}'", field, op.as_str(), s.replace('\'', "\\'")),
                other => write!(f, "{} {} {}", field, op.as_str(), other),
            },
            Predicate::IsNull(field) => write!(f, "{} IS NULL", field),
            Predicate::IsNotNull(field) => write!(f, "{} IS NOT NULL", field),
            Predicate::And(parts) => write_joined(f, parts, " AND "),
            Predicate::Or(parts) => write_joined(f, parts, " OR "),
            Predicate::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", part)?;
    }
    write!(f, ")")
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Predicate::parse(s)
    }
}

// ========== Parser ==========

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(CompareOp),
    And,
    Or,
    Not,
    Is,
    Null,
    TruePredicate,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(Error::Parse("Unterminated string in predicate".to_string())),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                text.push(*next);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::Text(text)));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                    ('=', _) => (Token::Op(CompareOp::Eq), 1),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                    ('<', Some('>')) => (Token::Op(CompareOp::Ne), 2),
                    ('<', _) => (Token::Op(CompareOp::Lt), 1),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                    ('>', _) => (Token::Op(CompareOp::Gt), 1),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    _ => return Err(Error::Parse(format!("Unexpected '{}' in predicate", c))),
                };
                tokens.push(token);
                i += width;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let ch = chars[i];
                    let exponent_sign = (ch == '+' || ch == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if !(ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || exponent_sign) {
                        break;
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let value = if let Ok(int) = raw.parse::<i64>() {
                    Value::Integer(int)
                } else {
                    raw.parse::<f64>()
                        .map(Value::Real)
                        .map_err(|_| Error::Parse(format!("Invalid number in predicate: {}", raw)))?
                };
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "LIKE" => Token::Op(CompareOp::Like),
                    "NULL" | "NIL" => Token::Null,
                    "TRUE" => Token::Literal(Value::Bool(true)),
                    "FALSE" => Token::Literal(Value::Bool(false)),
                    "TRUEPREDICATE" => Token::TruePredicate,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(Error::Parse(format!("Unexpected '{}' in predicate", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut parts = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Predicate::Or(parts) })
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Predicate::And(parts) })
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        if self.eat(&Token::Not) {
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(Error::Parse("Expected ')' in predicate".to_string()));
                }
                Ok(inner)
            }
            Some(Token::TruePredicate) => Ok(Predicate::True),
            Some(Token::Ident(field)) => match self.next() {
                Some(Token::Is) => {
                    let negated = self.eat(&Token::Not);
                    if !self.eat(&Token::Null) {
                        return Err(Error::Parse(format!("Expected NULL after {} IS", field)));
                    }
                    Ok(if negated { Predicate::IsNotNull(field) } else { Predicate::IsNull(field) })
                }
                Some(Token::Op(op)) => {
                    let value = match self.next() {
                        Some(Token::Literal(v)) => v,
                        Some(Token::Null) => Value::Null,
                        other => {
                            return Err(Error::Parse(format!(
                                "Expected a literal after {} {}, got {:?}",
                                field,
                                op.as_str(),
                                other
                            )));
                        }
                    };
                    Ok(Predicate::Compare { field, op, value })
                }
                other => Err(Error::Parse(format!("Expected an operator after {}, got {:?}", field, other))),
            },
            other => Err(Error::Parse(format!("Unexpected {:?} in predicate", other))),
        }
    }
}
