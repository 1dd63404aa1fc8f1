//! Entity types - records staged in contexts and persisted in the store
//!
//! Every record carries:
//! - `ObjectId`: stable identity assigned at creation, before the record reaches the store
//! - the entity name it belongs to (a table in the model)
//! - a map of field values

use crate::model::FieldType;
use crate::{Error, Result};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a record across every context and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Parse(format!("Invalid object id {}: {}", s, e)))
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in a field of the given type
    pub fn fits(&self, ty: FieldType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), FieldType::Bool)
                | (Value::Integer(_), FieldType::Integer)
                | (Value::Integer(_), FieldType::Real)
                | (Value::Real(_), FieldType::Real)
                | (Value::Text(_), FieldType::Text)
        )
    }

    /// Convert a value to the given field type where that is lossless.
    ///
    /// Text is parsed (`"42"` becomes `42` for an integer field), integers
    /// widen to reals, and `0`/`1` become booleans.
    pub fn coerce(self, ty: FieldType) -> Option<Value> {
        match (self, ty) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Bool(b), FieldType::Bool) => Some(Value::Bool(b)),
            (Value::Bool(b), FieldType::Integer) => Some(Value::Integer(i64::from(b))),
            (Value::Integer(i), FieldType::Integer) => Some(Value::Integer(i)),
            (Value::Integer(i), FieldType::Real) => Some(Value::Real(i as f64)),
            (Value::Integer(0), FieldType::Bool) => Some(Value::Bool(false)),
            (Value::Integer(1), FieldType::Bool) => Some(Value::Bool(true)),
            (Value::Real(r), FieldType::Real) => Some(Value::Real(r)),
            (Value::Real(r), FieldType::Integer) if r.fract() == 0.0 && (I64_MIN_F..I64_MAX_F).contains(&r) => {
                Some(Value::Integer(r as i64))
            }
            (Value::Text(s), FieldType::Text) => Some(Value::Text(s)),
            (Value::Text(s), ty) => Value::parse_as(&s, ty).ok(),
            (v, FieldType::Text) => Some(Value::Text(v.to_string())),
            _ => None,
        }
    }

    /// Parse a textual value for a field of the given type
    pub fn parse_as(raw: &str, ty: FieldType) -> Result<Value> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("nil") {
            return Ok(Value::Null);
        }
        let parsed = match ty {
            FieldType::Text => Some(Value::Text(raw.to_string())),
            FieldType::Integer => raw.parse().ok().map(Value::Integer),
            FieldType::Real => raw.parse().ok().map(Value::Real),
            FieldType::Bool => match raw.to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
        };
        parsed.ok_or_else(|| Error::Parse(format!("'{}' is not a valid {} value", raw, ty)))
    }

    /// Total order used for sorting: null < number < text, booleans counting
    /// as `0`/`1`.
    ///
    /// Matches SQLite's ordering of storage classes so that in-memory sorting
    /// of pending objects agrees with `ORDER BY`. Integers compare exactly;
    /// an integer against a real compares without rounding either side.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) | Value::Integer(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
            }
        }
        match (self.as_integer(), other.as_integer(), self, other) {
            (Some(a), Some(b), _, _) => a.cmp(&b),
            (Some(a), None, _, Value::Real(b)) => int_real_cmp(a, *b),
            (None, Some(b), Value::Real(a), _) => int_real_cmp(b, *a).reverse(),
            (_, _, Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (_, _, Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Integer view; booleans are stored as `0`/`1`
    fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The text SQLite produces when it casts this value, as `LIKE` sees it
    pub fn sql_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Real(r) if r.is_nan() => None,
            Value::Bool(b) => Some(i64::from(*b).to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(r) => Some(format_real(*r)),
            Value::Text(s) => Some(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Decode a column read from SQLite into a value of the declared type
    pub(crate) fn from_sql(raw: ValueRef<'_>, ty: FieldType) -> rusqlite::Result<Value> {
        Ok(match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => match ty {
                FieldType::Bool => Value::Bool(i != 0),
                FieldType::Real => Value::Real(i as f64),
                _ => Value::Integer(i),
            },
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                let s = std::str::from_utf8(t).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Value::Text(s.to_string())
            }
        })
    }
}

const I64_MIN_F: f64 = -9_223_372_036_854_775_808.0;
const I64_MAX_F: f64 = 9_223_372_036_854_775_808.0;

/// Exact integer/real comparison, as SQLite does it
fn int_real_cmp(i: i64, r: f64) -> Ordering {
    if r.is_nan() {
        return Ordering::Greater;
    }
    if r < I64_MIN_F {
        return Ordering::Greater;
    }
    if r >= I64_MAX_F {
        return Ordering::Less;
    }
    match i.cmp(&(r as i64)) {
        Ordering::Equal => (i as f64).partial_cmp(&r).unwrap_or(Ordering::Equal),
        ord => ord,
    }
}

/// Render a real like SQLite's `%!.15g`: 15 significant digits, trailing
/// zeros trimmed but at least one digit after the point.
fn format_real(r: f64) -> String {
    if r.is_infinite() {
        return if r > 0.0 { "Inf".to_string() } else { "-Inf".to_string() };
    }
    if r == 0.0 {
        return if r.is_sign_negative() { "-0.0".to_string() } else { "0.0".to_string() };
    }

    let sci = format!("{:.14e}", r);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();

    if !(-4..15).contains(&exp) {
        let (head, tail) = digits.split_at(1);
        let tail = trim_fraction(tail);
        let exp_sign = if exp < 0 { '-' } else { '+' };
        return format!("{}{}.{}e{}{:02}", sign, head, tail, exp_sign, exp.abs());
    }

    let (int_part, frac_part) = if exp >= 0 {
        let split = (exp + 1) as usize;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        let zeros = "0".repeat((-exp - 1) as usize);
        ("0".to_string(), format!("{}{}", zeros, digits))
    };
    format!("{}{}.{}", sign, int_part, trim_fraction(&frac_part))
}

fn trim_fraction(frac: &str) -> &str {
    let trimmed = frac.trim_end_matches('0');
    if trimmed.is_empty() { "0" } else { trimmed }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::from(i64::from(*b)),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(r) => ToSqlOutput::from(*r),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A record of a model entity.
///
/// Entities are plain values: fetching returns a snapshot, and changes only
/// take effect once the entity is staged again with `Context::insert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identity shared by every copy of this record
    pub id: ObjectId,
    /// Name of the entity description in the model
    pub entity: String,
    /// Field values; absent fields read as null
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    /// Create a new record with a fresh identity
    pub fn new(entity: impl Into<String>) -> Self {
        Self::with_id(ObjectId::new(), entity)
    }

    pub fn with_id(id: ObjectId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Read a field; missing fields are null
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).as_str()
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.get(field) {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_text_to_integer() {
        assert_eq!(Value::from("42").coerce(FieldType::Integer), Some(Value::Integer(42)));
        assert_eq!(Value::from("abc").coerce(FieldType::Integer), None);
        assert_eq!(Value::from(7).coerce(FieldType::Real), Some(Value::Real(7.0)));
        assert_eq!(Value::from(42).coerce(FieldType::Text), Some(Value::from("42")));
    }

    #[test]
    fn test_sort_order_matches_sqlite_classes() {
        let mut values = vec![
            Value::from("b"),
            Value::from(3),
            Value::Null,
            Value::from(1.5),
            Value::from("a"),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![Value::Null, Value::from(1.5), Value::from(3), Value::from("a"), Value::from("b")]
        );
    }

    #[test]
    fn test_real_to_integer_needs_whole_in_range_value() {
        assert_eq!(Value::from(3.0).coerce(FieldType::Integer), Some(Value::Integer(3)));
        assert_eq!(Value::from(3.5).coerce(FieldType::Integer), None);
        assert_eq!(Value::from(1e19).coerce(FieldType::Integer), None);
        assert_eq!(Value::from(-1e19).coerce(FieldType::Integer), None);
        assert_eq!(Value::from(-9.223372036854775808e18).coerce(FieldType::Integer), Some(Value::Integer(i64::MIN)));
    }

    #[test]
    fn test_integers_compare_exactly() {
        let a = Value::Integer(9_007_199_254_740_993);
        let b = Value::Integer(9_007_199_254_740_992);
        assert_eq!(a.sort_cmp(&b), Ordering::Greater);
        assert_eq!(a.sort_cmp(&Value::Real(9_007_199_254_740_992.0)), Ordering::Greater);
        assert_eq!(Value::Real(9_007_199_254_740_992.0).sort_cmp(&a), Ordering::Less);
        assert_eq!(Value::Integer(3).sort_cmp(&Value::Real(3.0)), Ordering::Equal);
        assert_eq!(Value::Integer(-4).sort_cmp(&Value::Real(-3.5)), Ordering::Less);
        assert_eq!(Value::Bool(true).sort_cmp(&Value::Integer(1)), Ordering::Equal);
        assert_eq!(Value::Integer(i64::MAX).sort_cmp(&Value::Real(1e19)), Ordering::Less);
    }

    #[test]
    fn test_sql_text_follows_sqlite_casts() {
        assert_eq!(Value::Bool(true).sql_text().as_deref(), Some("1"));
        assert_eq!(Value::Integer(-7).sql_text().as_deref(), Some("-7"));
        assert_eq!(Value::Real(4.0).sql_text().as_deref(), Some("4.0"));
        assert_eq!(Value::Real(0.1).sql_text().as_deref(), Some("0.1"));
        assert_eq!(Value::Real(-123456.789).sql_text().as_deref(), Some("-123456.789"));
        assert_eq!(Value::Real(0.00012).sql_text().as_deref(), Some("0.00012"));
        assert_eq!(Value::Real(1e20).sql_text().as_deref(), Some("1.0e+20"));
        assert_eq!(Value::Real(1.5e-7).sql_text().as_deref(), Some("1.5e-07"));
        assert_eq!(Value::Real(1.0 / 3.0).sql_text().as_deref(), Some("0.333333333333333"));
        assert_eq!(Value::Null.sql_text(), None);
    }

    #[test]
    fn test_entity_fields() {
        let book = Entity::new("Book").with("title", "Dune").with("pages", 412);
        assert_eq!(book.get_str("title"), Some("Dune"));
        assert_eq!(book.get_i64("pages"), Some(412));
        assert!(book.get("missing").is_null());
    }

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new();
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ObjectId>().is_err());
    }
}
