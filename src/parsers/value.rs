use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// A value reconstructed from a pickle stream.
///
/// Mirrors the Python object model closely enough to reproduce `str()` and
/// `len()` for everything a peer group table is expected to hold. Instances of
/// classes the unpickler does not know are kept as [`PyObject`].
#[derive(Debug, Clone, PartialEq)]
pub enum PyValue {
    None,
    Bool(bool),
    Int(i64),
    /// Decimal digits of an integer outside the `i64` range.
    BigInt(String),
    Float(f64),
    Complex {
        re: f64,
        im: f64,
    },
    Str(String),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    List(Vec<PyValue>),
    Tuple(Vec<PyValue>),
    /// Key/value pairs in insertion order.
    Dict(Vec<(PyValue, PyValue)>),
    Set(Vec<PyValue>),
    FrozenSet(Vec<PyValue>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    /// A numpy scalar that is not a `float64`, e.g. `numpy.int64(3)`.
    Scalar {
        dtype: String,
        value: Box<PyValue>,
    },
    /// A reference to a class or function.
    Global {
        module: String,
        name: String,
    },
    Object(PyObject),
    /// Memo slot; only lives on the unpickler stack and never escapes `parse`.
    MemoRef(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PyObject {
    /// Dotted class path, `None` for classes behind an unregistered extension code.
    pub class: Option<String>,
    pub args: Vec<PyValue>,
    pub state: Option<Box<PyValue>>,
    /// Items appended to an instance of a `list` subclass.
    pub list_items: Vec<PyValue>,
    /// Items set on an instance of a `dict` subclass, in insertion order.
    pub dict_items: Vec<(PyValue, PyValue)>,
}

impl PyObject {
    pub fn new(class: Option<String>, args: Vec<PyValue>) -> Self {
        Self {
            class,
            args,
            state: None,
            list_items: Vec::new(),
            dict_items: Vec::new(),
        }
    }
}

impl PyValue {
    /// Python `len()`, `None` for values without a length.
    pub fn len(&self) -> Option<usize> {
        match self {
            PyValue::Str(s) => Some(s.chars().count()),
            PyValue::Bytes(b) | PyValue::ByteArray(b) => Some(b.len()),
            PyValue::List(items)
            | PyValue::Tuple(items)
            | PyValue::Set(items)
            | PyValue::FrozenSet(items) => Some(items.len()),
            PyValue::Dict(pairs) => Some(pairs.len()),
            PyValue::Object(obj) if !obj.dict_items.is_empty() => Some(obj.dict_items.len()),
            PyValue::Object(obj) if !obj.list_items.is_empty() => Some(obj.list_items.len()),
            _ => None,
        }
    }

    /// Python truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            PyValue::None => false,
            PyValue::Bool(b) => *b,
            PyValue::Int(n) => *n != 0,
            PyValue::Float(f) => *f != 0.0,
            PyValue::Complex { re, im } => *re != 0.0 || *im != 0.0,
            PyValue::Scalar { value, .. } => value.is_truthy(),
            other => other.len().is_none_or(|len| len > 0),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PyValue::None => "NoneType",
            PyValue::Bool(_) => "bool",
            PyValue::Int(_) | PyValue::BigInt(_) => "int",
            PyValue::Float(_) => "float",
            PyValue::Complex { .. } => "complex",
            PyValue::Str(_) => "str",
            PyValue::Bytes(_) => "bytes",
            PyValue::ByteArray(_) => "bytearray",
            PyValue::List(_) => "list",
            PyValue::Tuple(_) => "tuple",
            PyValue::Dict(_) => "dict",
            PyValue::Set(_) => "set",
            PyValue::FrozenSet(_) => "frozenset",
            PyValue::DateTime(_) => "datetime",
            PyValue::Date(_) => "date",
            PyValue::Scalar { .. } => "numpy scalar",
            PyValue::Global { .. } => "type",
            PyValue::Object(_) => "object",
            PyValue::MemoRef(_) => "memo reference",
        }
    }

    /// Python `str()`. Returns `None` when the value has no textual form.
    pub fn render(&self) -> Option<String> {
        match self {
            PyValue::Str(s) => Some(s.clone()),
            PyValue::DateTime(dt) => {
                let mut text = dt.format("%Y-%m-%d %H:%M:%S").to_string();
                let micros = dt.nanosecond() / 1_000;
                if micros != 0 {
                    text.push_str(&format!(".{micros:06}"));
                }
                Some(text)
            }
            PyValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            PyValue::Scalar { value, .. } => value.render(),
            other => other.repr(),
        }
    }

    /// Python `repr()`.
    pub fn repr(&self) -> Option<String> {
        Some(match self {
            PyValue::None => "None".to_owned(),
            PyValue::Bool(true) => "True".to_owned(),
            PyValue::Bool(false) => "False".to_owned(),
            PyValue::Int(n) => n.to_string(),
            PyValue::BigInt(digits) => digits.clone(),
            PyValue::Float(f) => float_repr(*f),
            PyValue::Complex { re, im } => complex_repr(*re, *im),
            PyValue::Str(s) => str_repr(s),
            PyValue::Bytes(b) => bytes_repr(b),
            PyValue::ByteArray(b) => format!("bytearray({})", bytes_repr(b)),
            PyValue::List(items) => format!("[{}]", join_repr(items)?),
            PyValue::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()?),
            PyValue::Tuple(items) => format!("({})", join_repr(items)?),
            PyValue::Dict(pairs) => dict_repr(pairs)?,
            PyValue::Set(items) if items.is_empty() => "set()".to_owned(),
            PyValue::Set(items) => format!("{{{}}}", join_repr(items)?),
            PyValue::FrozenSet(items) if items.is_empty() => "frozenset()".to_owned(),
            PyValue::FrozenSet(items) => format!("frozenset({{{}}})", join_repr(items)?),
            PyValue::DateTime(dt) => {
                let mut fields = vec![
                    dt.year().to_string(),
                    dt.month().to_string(),
                    dt.day().to_string(),
                    dt.hour().to_string(),
                    dt.minute().to_string(),
                ];
                let micros = dt.nanosecond() / 1_000;
                if micros != 0 {
                    fields.push(dt.second().to_string());
                    fields.push(micros.to_string());
                } else if dt.second() != 0 {
                    fields.push(dt.second().to_string());
                }
                format!("datetime.datetime({})", fields.join(", "))
            }
            PyValue::Date(d) => {
                format!("datetime.date({}, {}, {})", d.year(), d.month(), d.day())
            }
            PyValue::Scalar { value, .. } => return value.repr(),
            PyValue::Global { module, name } => format!("<class '{module}.{name}'>"),
            PyValue::Object(obj) if !obj.dict_items.is_empty() => dict_repr(&obj.dict_items)?,
            PyValue::Object(obj) if !obj.list_items.is_empty() => {
                format!("[{}]", join_repr(&obj.list_items)?)
            }
            PyValue::Object(obj) => format!("<{} object>", obj.class.as_deref()?),
            PyValue::MemoRef(_) => return None,
        })
    }
}

fn join_repr(items: &[PyValue]) -> Option<String> {
    let parts = items.iter().map(PyValue::repr).collect::<Option<Vec<_>>>()?;
    Some(parts.join(", "))
}

fn dict_repr(pairs: &[(PyValue, PyValue)]) -> Option<String> {
    let mut parts = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        parts.push(format!("{}: {}", k.repr()?, v.repr()?));
    }
    Some(format!("{{{}}}", parts.join(", ")))
}

/// `repr(float)`: shortest round-trip digits, exponent from 1e16 and below 1e-4.
fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let text = format!("{f:?}");
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            let mantissa = mantissa.strip_suffix(".0").unwrap_or(mantissa);
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => text,
    }
}

fn complex_part(f: f64) -> String {
    let text = float_repr(f);
    match text.strip_suffix(".0") {
        Some(stripped) => stripped.to_owned(),
        None => text,
    }
}

fn complex_repr(re: f64, im: f64) -> String {
    if re == 0.0 && re.is_sign_positive() {
        return format!("{}j", complex_part(im));
    }
    let sign = if im.is_sign_negative() && !im.is_nan() {
        ""
    } else {
        "+"
    };
    format!("({}{sign}{}j)", complex_part(re), complex_part(im))
}

fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if !is_printable(c) => {
                let code = u32::from(c);
                if code < 0x100 {
                    out.push_str(&format!("\\x{code:02x}"));
                } else if code < 0x10000 {
                    out.push_str(&format!("\\u{code:04x}"));
                } else {
                    out.push_str(&format!("\\U{code:08x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// `str.isprintable` for one character: false for control and format
/// characters, separators other than the ASCII space, private use code points
/// and noncharacters.
fn is_printable(c: char) -> bool {
    if c.is_control() {
        return false;
    }
    let code = u32::from(c);
    !matches!(
        code,
        0x00a0
            | 0x00ad
            | 0x0600..=0x0605
            | 0x061c
            | 0x06dd
            | 0x070f
            | 0x0890..=0x0891
            | 0x08e2
            | 0x1680
            | 0x180e
            | 0x2000..=0x200f
            | 0x2028..=0x202f
            | 0x205f..=0x206f
            | 0x3000
            | 0xd800..=0xdfff
            | 0xe000..=0xf8ff
            | 0xfdd0..=0xfdef
            | 0xfeff
            | 0xfff9..=0xfffb
            | 0x110bd
            | 0x110cd
            | 0x13430..=0x1343f
            | 0x1bca0..=0x1bca3
            | 0x1d173..=0x1d17a
            | 0xe0001
            | 0xe0020..=0xe007f
            | 0xf0000..
    ) && code & 0xfffe != 0xfffe
}

fn bytes_repr(bytes: &[u8]) -> String {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') {
        b'"'
    } else {
        b'\''
    };
    let mut out = String::with_capacity(bytes.len() + 3);
    out.push('b');
    out.push(quote as char);
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b == quote => {
                out.push('\\');
                out.push(b as char);
            }
            0x20..=0x7e => out.push(b as char),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push(quote as char);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_complex_like_python() {
        let cases = [
            ((1.0, 2.0), "(1+2j)"),
            ((0.0, -1.5), "-1.5j"),
            ((1.5, -2.0), "(1.5-2j)"),
            ((-0.0, 1.0), "(-0+1j)"),
        ];
        for ((re, im), expected) in cases {
            let value = PyValue::Complex { re, im };
            assert_eq!(value.render().as_deref(), Some(expected));
        }
    }

    #[test]
    fn renders_bytes_with_python_quoting() {
        assert_eq!(
            PyValue::Bytes(b"ab'c\x00".to_vec()).render().as_deref(),
            Some("b\"ab'c\\x00\"")
        );
        assert_eq!(
            PyValue::ByteArray(b"hi\n".to_vec()).render().as_deref(),
            Some("bytearray(b'hi\\n')")
        );
    }

    #[test]
    fn floats_use_python_exponent_form() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-7), "1.5e-07");
        assert_eq!(float_repr(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn containers_render_members_with_repr() {
        let value = PyValue::Tuple(vec![PyValue::Str("a".into())]);
        assert_eq!(value.render().as_deref(), Some("('a',)"));

        let value = PyValue::Dict(vec![(
            PyValue::Str("k".into()),
            PyValue::List(vec![PyValue::Int(1), PyValue::None]),
        )]);
        assert_eq!(value.render().as_deref(), Some("{'k': [1, None]}"));

        assert_eq!(PyValue::Set(vec![]).render().as_deref(), Some("set()"));
        assert_eq!(
            PyValue::FrozenSet(vec![PyValue::Int(3)]).render().as_deref(),
            Some("frozenset({3})")
        );
    }

    #[test]
    fn datetime_str_and_repr() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|d| d.and_hms_micro_opt(3, 4, 5, 600))
            .unwrap();
        let value = PyValue::DateTime(dt);
        assert_eq!(value.render().as_deref(), Some("2024-01-02 03:04:05.000600"));
        assert_eq!(
            value.repr().as_deref(),
            Some("datetime.datetime(2024, 1, 2, 3, 4, 5, 600)")
        );
    }

    #[test]
    fn instances_without_class_cannot_render() {
        let anonymous = PyValue::Object(PyObject::new(None, vec![PyValue::Int(42)]));
        assert_eq!(anonymous.render(), None);
        assert_eq!(PyValue::List(vec![anonymous]).render(), None);

        let named = PyValue::Object(PyObject::new(Some("scoring.Candidate".into()), vec![]));
        assert_eq!(named.render().as_deref(), Some("<scoring.Candidate object>"));
    }

    #[test]
    fn container_subclasses_render_their_items() {
        let mut record = PyObject::new(Some("scoring.Record".into()), vec![]);
        record.dict_items = vec![(PyValue::Str("a".into()), PyValue::Int(1))];
        let record = PyValue::Object(record);
        assert_eq!(record.len(), Some(1));
        assert_eq!(record.render().as_deref(), Some("{'a': 1}"));

        let mut roster = PyObject::new(Some("scoring.Roster".into()), vec![]);
        roster.list_items = vec![PyValue::Int(1), PyValue::Int(2)];
        let roster = PyValue::Object(roster);
        assert_eq!(roster.len(), Some(2));
        assert_eq!(
            PyValue::Tuple(vec![roster]).render().as_deref(),
            Some("([1, 2],)")
        );
    }

    #[test]
    fn strings_escape_non_printable_characters() {
        let value = PyValue::Tuple(
            ["\u{a0}", "\u{200b}", "\u{2028}", "😀", "é", "\u{7f}", "\u{ad}", "\u{f0000}"]
                .into_iter()
                .map(|s| PyValue::Str(s.to_owned()))
                .collect(),
        );
        assert_eq!(
            value.render().as_deref(),
            Some(r"('\xa0', '\u200b', '\u2028', '😀', 'é', '\x7f', '\xad', '\U000f0000')")
        );
    }

    #[test]
    fn len_and_truthiness() {
        assert_eq!(PyValue::Str("zoë".into()).len(), Some(3));
        assert_eq!(PyValue::Int(3).len(), None);
        assert!(!PyValue::Dict(vec![]).is_truthy());
        assert!(!PyValue::None.is_truthy());
        assert!(PyValue::Int(3).is_truthy());
    }
}
