use std::collections::BTreeMap;

use super::value_codec::*;
use super::Value;
use crate::schema::TypeKind;
use crate::schema::TypeTag;

#[test]
fn test_scalars_are_stored_as_native_text() {
    assert_eq!(encode_scalar(&Value::from("abc")).unwrap(), b"abc");
    assert_eq!(encode_scalar(&Value::Int(-4)).unwrap(), b"-4");
    assert_eq!(encode_scalar(&Value::Bool(true)).unwrap(), b"true");
    assert_eq!(encode_scalar(&Value::Float(2.5)).unwrap(), b"2.5");
    assert_eq!(encode_scalar(&Value::Bytes(vec![0xFE, 0x01])).unwrap(), vec![0xFE, 0x01]);
}

#[test]
fn test_non_string_elements_become_blobs() {
    let encoded = encode_element(&Value::Int(80)).unwrap();
    assert!(is_blob(&encoded));
    assert_eq!(decode(&encoded), Value::Int(80));

    let text = encode_element(&Value::from("auto")).unwrap();
    assert!(!is_blob(&text));
    assert_eq!(decode(&text), Value::from("auto"));
}

#[test]
fn test_nested_values_survive_the_blob() {
    let mut map = BTreeMap::new();
    map.insert("x".to_string(), Value::Float(1.5));
    map.insert("tags".to_string(), Value::List(vec![Value::from("a"), Value::Null]));
    let value = Value::Map(map);

    let encoded = encode_for(TypeTag::new(TypeKind::Any), &value).unwrap();
    assert_eq!(decode(&encoded), value);
}

#[test]
fn test_non_utf8_without_header_decodes_to_bytes() {
    assert_eq!(decode(&[0xC3, 0x28]), Value::Bytes(vec![0xC3, 0x28]));
    // Header present but truncated body
    assert_eq!(decode(&[0xFF, b'D', b'V', 1]), Value::Bytes(vec![0xFF, b'D', b'V', 1]));
}

#[test]
fn test_typed_decode_parses_scalar_text() {
    let int = Some(TypeTag::new(TypeKind::Int));
    let float = Some(TypeTag::new(TypeKind::Float));
    let boolean = Some(TypeTag::new(TypeKind::Bool));

    assert_eq!(decode_typed(b"42", int), Value::Int(42));
    assert_eq!(decode_typed(b"1", float), Value::Float(1.0));
    assert_eq!(decode_typed(b"True", boolean), Value::Bool(true));
    assert_eq!(decode_typed(b"false", boolean), Value::Bool(false));
    // Unparsable text stays a string
    assert_eq!(decode_typed(b"n/a", int), Value::from("n/a"));
    assert_eq!(decode_typed(b"42", None), Value::from("42"));
    assert_eq!(decode_typed(b"42", Some(TypeTag::new(TypeKind::Str))), Value::from("42"));
}

#[test]
fn test_key_values_use_the_leaf_kind() {
    assert_eq!(parse_key_value("7", Some(TypeTag::in_key(TypeKind::Int))), Value::Int(7));
    assert_eq!(parse_key_value("north", Some(TypeTag::in_key(TypeKind::Str))), Value::from("north"));
    assert_eq!(parse_key_value("7", None), Value::from("7"));
}
