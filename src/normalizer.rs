use crate::parsers::PyValue;
use serde_json::{Map, Number, Value};

/// How a value is carried into JSON, checked in declaration order.
#[derive(Debug, PartialEq)]
enum Shape<'a> {
    Mapping(&'a [(PyValue, PyValue)]),
    Sequence(&'a [PyValue]),
    Primitive,
    Textual,
    Opaque,
}

fn classify(value: &PyValue) -> Shape<'_> {
    match value {
        PyValue::Dict(pairs) => Shape::Mapping(pairs),
        // instances of dict and list subclasses
        PyValue::Object(obj) if !obj.dict_items.is_empty() => Shape::Mapping(&obj.dict_items),
        PyValue::List(items) => Shape::Sequence(items),
        PyValue::Object(obj) if !obj.list_items.is_empty() => Shape::Sequence(&obj.list_items),
        PyValue::None
        | PyValue::Bool(_)
        | PyValue::Int(_)
        | PyValue::Float(_)
        | PyValue::Str(_) => Shape::Primitive,
        PyValue::Complex { .. } | PyValue::Bytes(_) | PyValue::ByteArray(_) => Shape::Textual,
        _ => Shape::Opaque,
    }
}

/// Restricts a decoded value to the JSON data model. Never fails: anything
/// without a textual form becomes `null`.
pub fn normalize(value: &PyValue) -> Value {
    match classify(value) {
        Shape::Mapping(pairs) => Value::Object(
            pairs
                .iter()
                .map(|(key, value)| (key_text(key), normalize(value)))
                .collect::<Map<_, _>>(),
        ),
        Shape::Sequence(items) => Value::Array(items.iter().map(normalize).collect()),
        Shape::Primitive => primitive(value),
        Shape::Textual => value.render().map_or(Value::Null, Value::String),
        Shape::Opaque => {
            if let PyValue::Scalar { dtype, .. } = value {
                tracing::trace!(dtype = dtype.as_str(), "rendering numpy scalar as text");
            }
            match value.render() {
                Some(text) => Value::String(text),
                None => {
                    tracing::debug!(kind = value.type_name(), "value has no text form, writing null");
                    Value::Null
                }
            }
        }
    }
}

fn primitive(value: &PyValue) -> Value {
    match value {
        PyValue::Bool(b) => Value::Bool(*b),
        PyValue::Int(n) => Value::from(*n),
        // NaN and infinities have no JSON form
        PyValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        PyValue::Str(s) => Value::String(s.clone()),
        _ => Value::Null,
    }
}

/// Object key for a dict key, following `json.dumps` for non-string keys.
pub fn key_text(key: &PyValue) -> String {
    match key {
        PyValue::Str(s) => s.clone(),
        PyValue::None => "null".to_owned(),
        PyValue::Bool(true) => "true".to_owned(),
        PyValue::Bool(false) => "false".to_owned(),
        other => other.render().unwrap_or_else(|| "null".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::value::PyObject;
    use serde_json::json;

    fn s(text: &str) -> PyValue {
        PyValue::Str(text.to_owned())
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(normalize(&PyValue::None), Value::Null);
        assert_eq!(normalize(&PyValue::Bool(true)), json!(true));
        assert_eq!(normalize(&PyValue::Int(-3)), json!(-3));
        assert_eq!(normalize(&PyValue::Float(2.5)), json!(2.5));
        assert_eq!(normalize(&s("Zoë")), json!("Zoë"));
    }

    #[test]
    fn mappings_keep_keys_and_order() {
        let value = PyValue::Dict(vec![
            (s("b"), PyValue::Int(1)),
            (s("a"), PyValue::List(vec![PyValue::Float(0.5), PyValue::None])),
        ]);
        let normalized = normalize(&value);
        assert_eq!(normalized, json!({"b": 1, "a": [0.5, null]}));
        let keys: Vec<_> = normalized.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn sequences_keep_length_and_order() {
        let value = PyValue::List(vec![s("x"), PyValue::Int(2), PyValue::Bool(false)]);
        assert_eq!(normalize(&value), json!(["x", 2, false]));
    }

    #[test]
    fn tuples_render_like_python_str() {
        let value = PyValue::Tuple(vec![s("sql"), s("python")]);
        assert_eq!(normalize(&value), json!("('sql', 'python')"));
    }

    #[test]
    fn complex_and_bytes_become_text() {
        assert_eq!(
            normalize(&PyValue::Complex { re: 1.0, im: 2.0 }),
            json!("(1+2j)")
        );
        assert_eq!(
            normalize(&PyValue::Bytes(b"ab\x01".to_vec())),
            json!("b'ab\\x01'")
        );
    }

    #[test]
    fn opaque_values_render_or_become_null() {
        let named = PyValue::Object(PyObject::new(Some("scoring.Candidate".into()), vec![]));
        let anonymous = PyValue::Object(PyObject::new(None, vec![]));
        assert_eq!(normalize(&named), json!("<scoring.Candidate object>"));
        assert_eq!(normalize(&anonymous), Value::Null);
        assert_eq!(
            normalize(&PyValue::Set(vec![PyValue::Int(1), PyValue::Int(2)])),
            json!("{1, 2}")
        );
        assert_eq!(
            normalize(&PyValue::BigInt("1180591620717411303424".into())),
            json!("1180591620717411303424")
        );
        let scalar = PyValue::Scalar {
            dtype: "int64".into(),
            value: Box::new(PyValue::Int(-7)),
        };
        assert_eq!(normalize(&scalar), json!("-7"));
    }

    #[test]
    fn container_subclasses_follow_their_base() {
        let mut record = PyObject::new(Some("scoring.Record".into()), vec![]);
        record.dict_items = vec![(s("a"), PyValue::Int(1))];
        let mut roster = PyObject::new(Some("scoring.Roster".into()), vec![]);
        roster.list_items = vec![PyValue::Object(record)];

        assert_eq!(normalize(&PyValue::Object(roster)), json!([{"a": 1}]));
    }

    #[test]
    fn subclass_group_from_pickle() {
        let data = b"\x80\x02}q\x00X\x0b\x00\x00\x00peer_groupsq\x01}q\x02X\x01\x00\x00\x00Gq\x03]q\x04c__main__\nRec\nq\x05)\x81q\x06X\x01\x00\x00\x00aq\x07K\x01sass.";
        let value = crate::parsers::parse(data).unwrap();
        assert_eq!(normalize(&value), json!({"peer_groups": {"G": [{"a": 1}]}}));

        let empty_bytes = crate::parsers::parse(b"\x80\x02c__builtin__\nbytes\nq\x00)Rq\x01.").unwrap();
        assert_eq!(normalize(&empty_bytes), json!("b''"));
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(normalize(&PyValue::Float(f64::NAN)), Value::Null);
        assert_eq!(normalize(&PyValue::Float(f64::INFINITY)), Value::Null);
    }

    #[test]
    fn non_string_keys_follow_json_dumps() {
        let value = PyValue::Dict(vec![
            (PyValue::Int(1), s("one")),
            (PyValue::Bool(true), s("yes")),
            (PyValue::None, s("none")),
            (PyValue::Tuple(vec![PyValue::Int(1), PyValue::Int(2)]), s("pair")),
        ]);
        assert_eq!(
            normalize(&value),
            json!({"1": "one", "true": "yes", "null": "none", "(1, 2)": "pair"})
        );
    }

    #[test]
    fn classification_precedence() {
        assert!(matches!(classify(&PyValue::Dict(vec![])), Shape::Mapping(_)));
        assert!(matches!(classify(&s("abc")), Shape::Primitive));
        assert_eq!(classify(&PyValue::ByteArray(vec![])), Shape::Textual);
        assert_eq!(classify(&PyValue::Set(vec![])), Shape::Opaque);
    }
}
