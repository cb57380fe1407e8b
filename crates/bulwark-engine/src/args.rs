//! Argument binding for blueprint functions
//!
//! Blueprint arguments arrive as an untyped JSON map whose leaves were often
//! produced by template rendering, so `"3"` may stand in for `3` and a single
//! string for a one-element list. [`arg`] and [`optional_arg`] decode a
//! value through a weakly-typed deserializer:
//!
//! - numeric strings decode into integers and floats
//! - `"true"`/`"false"`/`"1"`/`"0"` (and the other Go spellings) decode into bools
//! - numbers and bools decode into strings
//! - a single value decodes into a one-element sequence
//! - struct fields match map keys case-insensitively

use std::fmt;

use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, Visitor};
use serde::Deserializer;
use serde_json::{Map, Number, Value};

use crate::{Error, Result};

/// Untyped argument map handed to a function
pub type Args = Map<String, Value>;

/// Decode a required argument
pub fn arg<T: DeserializeOwned>(args: &Args, key: &str) -> Result<T> {
    match args.get(key) {
        Some(value) => decode(key, value),
        None => Err(Error::missing_arg(key)),
    }
}

/// Decode an optional argument, substituting `default` when it is absent or null
pub fn optional_arg<T: DeserializeOwned>(args: &Args, key: &str, default: T) -> Result<T> {
    match args.get(key) {
        Some(Value::Null) | None => Ok(default),
        Some(value) => decode(key, value),
    }
}

/// Check whether an argument is present, without decoding it
pub fn arg_exists(args: &Args, key: &str) -> bool {
    args.contains_key(key)
}

/// Decode a whole argument map into a struct
pub fn decode_args<T: DeserializeOwned>(args: &Args) -> Result<T> {
    let value = Value::Object(args.clone());
    T::deserialize(WeakDeserializer::new(&value)).map_err(|e| match e.field {
        Some(field) => Error::arg_type_mismatch(field, e.message),
        None => Error::arg_type_mismatch("<args>", e.message),
    })
}

/// Reject unknown arguments, then missing required ones
pub fn check_args(function: &str, args: &Args, required: &[&str], allowed: &[&str]) -> Result<()> {
    if let Some(key) = args.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(Error::unknown_arg(key.as_str(), function));
    }
    if let Some(key) = required.iter().find(|k| !args.contains_key(**k)) {
        return Err(Error::missing_arg(*key));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    T::deserialize(WeakDeserializer::new(value))
        .map_err(|e| Error::arg_type_mismatch(key, e.message))
}

// =============================================================================
// Weakly-typed deserializer
// =============================================================================

/// Decode failure, remembering the struct field it happened under
#[derive(Debug)]
pub struct DecodeError {
    message: String,
    field: Option<String>,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DecodeError {}

impl de::Error for DecodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self {
            message: msg.to_string(),
            field: None,
        }
    }
}

impl DecodeError {
    fn under(mut self, field: &str) -> Self {
        if self.field.is_none() {
            self.field = Some(field.to_string());
        }
        self
    }
}

const NO_VALUES: &[Value] = &[];

struct WeakDeserializer<'a> {
    value: &'a Value,
}

impl<'a> WeakDeserializer<'a> {
    fn new(value: &'a Value) -> Self {
        Self { value }
    }

    fn unexpected(&self) -> de::Unexpected<'a> {
        match self.value {
            Value::Null => de::Unexpected::Unit,
            Value::Bool(b) => de::Unexpected::Bool(*b),
            Value::Number(_) => de::Unexpected::Other("number"),
            Value::String(s) => de::Unexpected::Str(s),
            Value::Array(_) => de::Unexpected::Seq,
            Value::Object(_) => de::Unexpected::Map,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self.value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole_i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(whole_i64))
            }
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Null => Some(0),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self.value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null => Some(0.0),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim() {
                "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
                "0" | "f" | "F" | "false" | "FALSE" | "False" | "" => Some(false),
                _ => None,
            },
            Value::Null => Some(false),
            _ => None,
        }
    }

    fn as_string(&self) -> Option<String> {
        match self.value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(number_to_string(n)),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => Some(String::new()),
            _ => None,
        }
    }
}

// A float with no fractional part that fits in an i64 without saturating
fn whole_i64(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then_some(f as i64)
}

fn number_to_string(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

macro_rules! weak_signed {
    ($de:lifetime; $($method:ident),*) => {$(
        fn $method<V: Visitor<$de>>(
            self,
            visitor: V,
        ) -> std::result::Result<V::Value, DecodeError> {
            match self.as_i64() {
                Some(n) => visitor.visit_i64(n),
                None => Err(de::Error::invalid_type(self.unexpected(), &visitor)),
            }
        }
    )*};
}

macro_rules! weak_unsigned {
    ($de:lifetime; $($method:ident),*) => {$(
        fn $method<V: Visitor<$de>>(
            self,
            visitor: V,
        ) -> std::result::Result<V::Value, DecodeError> {
            if let Some(n) = self.as_u64() {
                return visitor.visit_u64(n);
            }
            match self.as_i64() {
                Some(n) => visitor.visit_i64(n),
                None => Err(de::Error::invalid_type(self.unexpected(), &visitor)),
            }
        }
    )*};
}

impl<'de, 'a> Deserializer<'de> for WeakDeserializer<'a> {
    type Error = DecodeError;

    fn deserialize_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.value {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    visitor.visit_u64(u)
                } else if let Some(i) = n.as_i64() {
                    visitor.visit_i64(i)
                } else {
                    visitor.visit_f64(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => visitor.visit_str(s),
            Value::Array(items) => visitor.visit_seq(SeqAccess { iter: items.iter() }),
            Value::Object(map) => visitor.visit_map(MapAccess::new(
                map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            )),
        }
    }

    weak_signed!('de; deserialize_i8, deserialize_i16, deserialize_i32, deserialize_i64);
    weak_unsigned!('de; deserialize_u8, deserialize_u16, deserialize_u32, deserialize_u64);

    fn deserialize_bool<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.as_bool() {
            Some(b) => visitor.visit_bool(b),
            None => Err(de::Error::invalid_type(self.unexpected(), &visitor)),
        }
    }

    fn deserialize_f32<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_f64(visitor)
    }

    fn deserialize_f64<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.as_f64() {
            Some(f) => visitor.visit_f64(f),
            None => Err(de::Error::invalid_type(self.unexpected(), &visitor)),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_str<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.as_string() {
            Some(s) => visitor.visit_string(s),
            None => Err(de::Error::invalid_type(self.unexpected(), &visitor)),
        }
    }

    fn deserialize_bytes<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_any(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_any(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.value {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.value {
            Value::Array(items) => visitor.visit_seq(SeqAccess { iter: items.iter() }),
            Value::Null => visitor.visit_seq(SeqAccess { iter: NO_VALUES.iter() }),
            Value::Object(map) if map.is_empty() => visitor.visit_seq(SeqAccess {
                iter: NO_VALUES.iter(),
            }),
            single => visitor.visit_seq(SeqAccess {
                iter: std::slice::from_ref(single).iter(),
            }),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.value {
            Value::Object(map) => visitor.visit_map(MapAccess::new(
                map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            )),
            Value::Null => visitor.visit_map(MapAccess::new(Vec::new())),
            _ => Err(de::Error::invalid_type(self.unexpected(), &visitor)),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        let map = match self.value {
            Value::Object(map) => map,
            Value::Null => return visitor.visit_map(MapAccess::new(Vec::new())),
            _ => return Err(de::Error::invalid_type(self.unexpected(), &visitor)),
        };
        let entries = map
            .iter()
            .map(|(key, value)| (match_field(fields, key), value))
            .collect();
        visitor.visit_map(MapAccess::new(entries))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.value
            .clone()
            .deserialize_enum(name, variants, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_identifier<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }
}

/// Map a key onto a struct field name: exact match first, then case-insensitive
fn match_field(fields: &[&str], key: &str) -> String {
    fields
        .iter()
        .find(|f| **f == key)
        .or_else(|| fields.iter().find(|f| f.eq_ignore_ascii_case(key)))
        .map_or_else(|| key.to_string(), |f| f.to_string())
}

struct SeqAccess<'a> {
    iter: std::slice::Iter<'a, Value>,
}

impl<'de, 'a> de::SeqAccess<'de> for SeqAccess<'a> {
    type Error = DecodeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> std::result::Result<Option<T::Value>, DecodeError> {
        match self.iter.next() {
            Some(value) => seed.deserialize(WeakDeserializer::new(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapAccess<'a> {
    entries: std::vec::IntoIter<(String, &'a Value)>,
    pending: Option<(String, &'a Value)>,
}

impl<'a> MapAccess<'a> {
    fn new(entries: Vec<(String, &'a Value)>) -> Self {
        Self {
            entries: entries.into_iter(),
            pending: None,
        }
    }
}

impl<'de, 'a> de::MapAccess<'de> for MapAccess<'a> {
    type Error = DecodeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> std::result::Result<Option<K::Value>, DecodeError> {
        match self.entries.next() {
            Some((key, value)) => {
                let deserializer: de::value::StringDeserializer<DecodeError> =
                    key.clone().into_deserializer();
                let decoded = seed.deserialize(deserializer)?;
                self.pending = Some((key, value));
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> std::result::Result<V::Value, DecodeError> {
        match self.pending.take() {
            Some((key, value)) => seed
                .deserialize(WeakDeserializer::new(value))
                .map_err(|e| e.under(&key)),
            None => Err(de::Error::custom("value requested before key")),
        }
    }
}
