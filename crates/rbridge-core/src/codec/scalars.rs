//! Scalar variable encoding.

use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{ScalarValue, ScalarVariable};
use crate::value::{EngineValue, INTEGER_NA, ListEntry, is_na_real};

/// Encode variables as a named list of one-element vectors.
pub fn encode_variables(variables: &[ScalarVariable]) -> EngineValue {
    let entries = variables
        .iter()
        .map(|var| {
            let value = match &var.value {
                ScalarValue::Int(v) => EngineValue::Integer(vec![*v]),
                ScalarValue::Double(v) => EngineValue::Double(vec![*v]),
                ScalarValue::String(v) => EngineValue::string(v.clone()),
            };
            ListEntry::named(var.name.clone(), value)
        })
        .collect();
    EngineValue::List(entries)
}

/// Decode a named list back into variables.
///
/// Integer, double and string entries become variables; entries of any other
/// kind, unnamed entries and missing first elements are skipped.
pub fn decode_variables(value: &EngineValue) -> Result<Vec<ScalarVariable>> {
    let entries = match value {
        EngineValue::Null => return Ok(Vec::new()),
        EngineValue::List(entries) => entries,
        other => {
            return Err(Error::UnsupportedShape(format!(
                "expected a named list of variables, found {}",
                other.kind()
            )));
        }
    };

    let mut variables = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(name) = &entry.name else {
            continue;
        };
        let value = match &entry.value {
            EngineValue::Integer(v) => v
                .first()
                .filter(|&&i| i != INTEGER_NA)
                .map(|&i| ScalarValue::Int(i)),
            EngineValue::Double(v) => v
                .first()
                .filter(|&&d| !is_na_real(d))
                .map(|&d| ScalarValue::Double(d)),
            EngineValue::String(v) => v.first().cloned().flatten().map(ScalarValue::String),
            _ => None,
        };
        match value {
            Some(value) => variables.push(ScalarVariable {
                name: name.clone(),
                value,
            }),
            None => debug!(name = %name, kind = %entry.value.kind(), "skipping variable"),
        }
    }
    Ok(variables)
}
