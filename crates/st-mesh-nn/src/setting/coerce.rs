// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Field coercion from loosely typed YAML values.
//!
//! Settings files are written by hand, so integers show up as `3.0` or `"3"`
//! and slices as short lists. Every helper takes the field name so a failure
//! says which key could not be converted.

use crate::{PureResult, TensorError};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{s}'"),
        Value::Sequence(seq) => format!("a sequence of {} items", seq.len()),
        Value::Mapping(map) => format!("a mapping of {} keys", map.len()),
        Value::Tagged(tagged) => format!("tagged value {}", tagged.tag),
    }
}

fn fail(field: &str, expected: &'static str, value: &Value) -> TensorError {
    TensorError::TypeCoercion {
        field: field.to_string(),
        expected,
        found: describe(value),
    }
}

pub(crate) fn to_string(field: &str, value: &Value) -> PureResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(fail(field, "str", other)),
    }
}

pub(crate) fn to_bool(field: &str, value: &Value) -> PureResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(fail(field, "bool", value)),
        },
        Value::String(s) => match s.trim() {
            "true" | "True" | "TRUE" => Ok(true),
            "false" | "False" | "FALSE" => Ok(false),
            _ => Err(fail(field, "bool", value)),
        },
        other => Err(fail(field, "bool", other)),
    }
}

pub(crate) fn to_i64(field: &str, value: &Value) -> PureResult<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
                _ => Err(fail(field, "int", value)),
            }
        }
        Value::String(s) => s.trim().parse().map_err(|_| fail(field, "int", value)),
        other => Err(fail(field, "int", other)),
    }
}

pub(crate) fn to_usize(field: &str, value: &Value) -> PureResult<usize> {
    let raw = to_i64(field, value)?;
    usize::try_from(raw).map_err(|_| fail(field, "non-negative int", value))
}

pub(crate) fn to_f32(field: &str, value: &Value) -> PureResult<f32> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(|f| f as f32)
            .ok_or_else(|| fail(field, "float", value)),
        Value::String(s) => s.trim().parse().map_err(|_| fail(field, "float", value)),
        other => Err(fail(field, "float", other)),
    }
}

pub(crate) fn to_path(field: &str, value: &Value) -> PureResult<PathBuf> {
    match value {
        Value::String(s) => Ok(PathBuf::from(s)),
        other => Err(fail(field, "Path", other)),
    }
}

/// Converts every element of a sequence, naming elements `field[i]`.
pub(crate) fn to_list<T>(
    field: &str,
    value: &Value,
    convert: impl Fn(&str, &Value) -> PureResult<T>,
) -> PureResult<Vec<T>> {
    let Value::Sequence(items) = value else {
        return Err(fail(field, "list", value));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| convert(&format!("{field}[{i}]"), item))
        .collect()
}

/// `None` for an explicit null, otherwise the converted value.
pub(crate) fn optional<T>(
    field: &str,
    value: &Value,
    convert: impl Fn(&str, &Value) -> PureResult<T>,
) -> PureResult<Option<T>> {
    match value {
        Value::Null => Ok(None),
        other => convert(field, other).map(Some),
    }
}

pub(crate) fn to_mapping<'a>(field: &str, value: &'a Value) -> PureResult<&'a Mapping> {
    match value {
        Value::Mapping(map) => Ok(map),
        other => Err(fail(field, "dict", other)),
    }
}

/// Walks a mapping, handing each `(key, value)` to `visit` and rejecting
/// non-string keys.
pub(crate) fn for_each_entry(
    owner: &str,
    map: &Mapping,
    mut visit: impl FnMut(&str, &Value) -> PureResult<()>,
) -> PureResult<()> {
    for (key, value) in map {
        let Value::String(key) = key else {
            return Err(fail(owner, "str key", key));
        };
        visit(key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(raw: &str) -> Value {
        serde_yaml::from_str(raw).unwrap()
    }

    #[test]
    fn integers_accept_floats_and_strings() {
        assert_eq!(to_i64("n", &yaml("3")).unwrap(), 3);
        assert_eq!(to_i64("n", &yaml("3.0")).unwrap(), 3);
        assert_eq!(to_i64("n", &yaml("'-1'")).unwrap(), -1);
        assert!(to_i64("n", &yaml("3.5")).is_err());
        assert!(to_usize("n", &yaml("-1")).is_err());
    }

    #[test]
    fn failures_name_the_field() {
        let err = to_list("nodes", &yaml("[1, two]"), to_i64).unwrap_err();
        assert_eq!(
            err,
            TensorError::TypeCoercion {
                field: "nodes[1]".into(),
                expected: "int",
                found: "'two'".into(),
            }
        );
        assert!(err.to_string().contains("nodes[1]"));
    }

    #[test]
    fn scalars_coerce_to_strings_and_bools() {
        assert_eq!(to_string("name", &yaml("12")).unwrap(), "12");
        assert!(to_bool("bias", &yaml("'False'")).map(|b| !b).unwrap());
        assert!(to_bool("bias", &yaml("[true]")).is_err());
        assert_eq!(to_f32("p", &yaml("1")).unwrap(), 1.0);
        assert_eq!(optional("x", &yaml("null"), to_f32).unwrap(), None);
    }
}
