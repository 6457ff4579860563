//! Tests for values and rows

use chrono::NaiveDate;
use dynrepo::types::{Row, Value};
use rust_decimal::Decimal;
use uuid::Uuid;

#[test]
fn test_value_null() {
    let v = Value::Null;

    assert!(v.is_null());
    assert_eq!(v.sql_type(), "NULL");
    assert_eq!(v.as_i64(), None);
    assert_eq!(v.as_string(), None);
}

#[test]
fn test_value_integer_widening() {
    assert_eq!(Value::Int16(7).as_i64(), Some(7));
    assert_eq!(Value::Int32(7).as_i64(), Some(7));
    assert_eq!(Value::Int64(7).as_i64(), Some(7));
    assert_eq!(Value::String(" 42 ".into()).as_i64(), Some(42));
    assert_eq!(Value::Float64(2.5).as_i64(), None);
}

#[test]
fn test_value_decimal() {
    let d = Decimal::new(1999, 2);
    assert_eq!(Value::Decimal(d).as_decimal(), Some(d));
    assert_eq!(Value::Int32(3).as_decimal(), Some(Decimal::from(3)));
    assert_eq!(Value::String("19.99".into()).as_decimal(), Some(d));
}

#[test]
fn test_value_bool_parsing() {
    assert_eq!(Value::String("yes".into()).as_bool(), Some(true));
    assert_eq!(Value::Int32(0).as_bool(), Some(false));
    assert_eq!(Value::String("maybe".into()).as_bool(), None);
}

#[test]
fn test_value_uuid() {
    let id = Uuid::new_v4();

    assert_eq!(Value::Uuid(id).as_uuid(), Some(id));
    assert_eq!(Value::String(id.to_string()).as_uuid(), Some(id));
    assert_eq!(Value::Uuid(id).sql_type(), "UUID");
}

#[test]
fn test_value_to_json_is_untagged() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

    assert_eq!(Value::Date(date).to_json(), serde_json::json!("2024-03-01"));
    assert_eq!(Value::Int32(5).to_json(), serde_json::json!(5));
    assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
    assert_eq!(
        Value::Decimal(Decimal::new(125, 1)).to_json(),
        serde_json::json!("12.5")
    );
}

#[test]
fn test_value_from_primitives() {
    assert_eq!(Value::from(true), Value::Bool(true));
    assert_eq!(Value::from(42_i32), Value::Int32(42));
    assert_eq!(Value::from(42_i64), Value::Int64(42));
    assert_eq!(Value::from("hi"), Value::String("hi".into()));
    assert_eq!(Value::from(None::<i32>), Value::Null);
    assert_eq!(Value::from(Some(1_i32)), Value::Int32(1));
}

#[test]
fn test_value_serialization_roundtrip() {
    let v = Value::String("abc".into());
    let json = serde_json::to_string(&v).unwrap();
    let back: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(back, v);
}

#[test]
fn test_row_get_by_index_and_name() {
    let row = Row::from_pairs([("Id", Value::Int32(1)), ("Name", Value::from("Alice"))]);

    assert_eq!(row.len(), 2);
    assert_eq!(row.get(0), Some(&Value::Int32(1)));
    assert_eq!(row.get(5), None);
    assert_eq!(row.get_by_name("name"), Some(&Value::from("Alice")));
    assert_eq!(row.get_by_name("missing"), None);
}

#[test]
fn test_row_iter_and_into_map() {
    let row = Row::new(
        vec!["a".into(), "b".into()],
        vec![Value::Int32(1), Value::Null],
    );

    let pairs: Vec<_> = row.iter().map(|(c, _)| c.to_string()).collect();
    assert_eq!(pairs, vec!["a", "b"]);

    let map = row.into_map();
    assert_eq!(map.get("a"), Some(&Value::Int32(1)));
    assert_eq!(map.get("b"), Some(&Value::Null));
}
