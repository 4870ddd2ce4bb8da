//! The engine's native value model.
//!
//! `EngineValue` is a closed tagged union over the vector, factor, list and
//! data-frame shapes the engine can hand back from an evaluation or accept in
//! an assignment. Missing values inside vectors use the engine's own NA
//! sentinels, which are exposed here as constants.

use std::fmt;

use bincode::{Decode, Encode};

use crate::error::{Error, Result};

/// Logical TRUE.
pub const LOGICAL_TRUE: i8 = 1;

/// Logical FALSE.
pub const LOGICAL_FALSE: i8 = 0;

/// Logical NA.
pub const LOGICAL_NA: i8 = i8::MIN;

/// Integer NA.
pub const INTEGER_NA: i32 = i32::MIN;

/// Bit pattern of the engine's real NA: a NaN whose low word is 1954.
pub const REAL_NA_BITS: u64 = 0x7FF0_0000_0000_07A2;

/// Class attached to table-shaped values.
pub const DATA_FRAME_CLASS: &str = "data.frame";

/// The engine's real NA value.
pub fn real_na() -> f64 {
    f64::from_bits(REAL_NA_BITS)
}

/// Whether `value` is the engine's NA sentinel (as opposed to an ordinary NaN).
pub fn is_na_real(value: f64) -> bool {
    value.is_nan() && (value.to_bits() & 0xFFFF_FFFF) == (REAL_NA_BITS & 0xFFFF_FFFF)
}

/// One element of a list, optionally named.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ListEntry {
    pub name: Option<String>,
    pub value: EngineValue,
}

impl ListEntry {
    /// Create a named entry.
    pub fn named(name: impl Into<String>, value: EngineValue) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }

    /// Create a positional entry.
    pub fn positional(value: EngineValue) -> Self {
        Self { name: None, value }
    }
}

/// Coarse classification of an [`EngineValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Logical,
    Integer,
    Double,
    String,
    Factor,
    List,
    DataFrame,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Null => "NULL",
            ValueKind::Logical => "logical vector",
            ValueKind::Integer => "integer vector",
            ValueKind::Double => "numeric vector",
            ValueKind::String => "character vector",
            ValueKind::Factor => "factor",
            ValueKind::List => "list",
            ValueKind::DataFrame => "data.frame",
        };
        f.write_str(s)
    }
}

/// A value living in (or headed for) the engine workspace.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum EngineValue {
    Null,
    Logical(Vec<i8>),
    Integer(Vec<i32>),
    Double(Vec<f64>),
    String(Vec<Option<String>>),
    /// 1-based level indices; 0 or [`INTEGER_NA`] mark a missing element.
    Factor {
        indices: Vec<i32>,
        levels: Vec<String>,
    },
    List(Vec<ListEntry>),
    /// A list of equal-length vectors tagged as a data frame.
    DataFrame {
        columns: Vec<ListEntry>,
        row_names: Vec<String>,
    },
}

impl EngineValue {
    /// Build a data frame, checking that every column is vector-shaped and
    /// as long as the row-name vector.
    pub fn data_frame(columns: Vec<ListEntry>, row_names: Vec<String>) -> Result<Self> {
        let rows = row_names.len();
        for (idx, column) in columns.iter().enumerate() {
            let label = column
                .name
                .clone()
                .unwrap_or_else(|| format!("#{}", idx + 1));
            if !column.value.is_vector() {
                return Err(Error::UnsupportedShape(format!(
                    "data frame column {} must be a vector, found {}",
                    label,
                    column.value.kind()
                )));
            }
            if column.value.len() != rows {
                return Err(Error::UnsupportedShape(format!(
                    "data frame column {} has {} elements, expected {}",
                    label,
                    column.value.len(),
                    rows
                )));
            }
        }
        Ok(EngineValue::DataFrame { columns, row_names })
    }

    /// Single-element string vector.
    pub fn string(value: impl Into<String>) -> Self {
        EngineValue::String(vec![Some(value.into())])
    }

    /// String vector without missing elements.
    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EngineValue::String(values.into_iter().map(|s| Some(s.into())).collect())
    }

    /// Single-element logical vector.
    pub fn logical(value: bool) -> Self {
        EngineValue::Logical(vec![if value { LOGICAL_TRUE } else { LOGICAL_FALSE }])
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            EngineValue::Null => ValueKind::Null,
            EngineValue::Logical(_) => ValueKind::Logical,
            EngineValue::Integer(_) => ValueKind::Integer,
            EngineValue::Double(_) => ValueKind::Double,
            EngineValue::String(_) => ValueKind::String,
            EngineValue::Factor { .. } => ValueKind::Factor,
            EngineValue::List(_) => ValueKind::List,
            EngineValue::DataFrame { .. } => ValueKind::DataFrame,
        }
    }

    /// The engine-side class name, as `class(x)` reports it.
    pub fn class_name(&self) -> &'static str {
        match self {
            EngineValue::Null => "NULL",
            EngineValue::Logical(_) => "logical",
            EngineValue::Integer(_) => "integer",
            EngineValue::Double(_) => "numeric",
            EngineValue::String(_) => "character",
            EngineValue::Factor { .. } => "factor",
            EngineValue::List(_) => "list",
            EngineValue::DataFrame { .. } => DATA_FRAME_CLASS,
        }
    }

    /// Number of elements (columns for a data frame).
    pub fn len(&self) -> usize {
        match self {
            EngineValue::Null => 0,
            EngineValue::Logical(v) => v.len(),
            EngineValue::Integer(v) => v.len(),
            EngineValue::Double(v) => v.len(),
            EngineValue::String(v) => v.len(),
            EngineValue::Factor { indices, .. } => indices.len(),
            EngineValue::List(v) => v.len(),
            EngineValue::DataFrame { columns, .. } => columns.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EngineValue::Null)
    }

    /// Whether the value can be a data frame column.
    pub fn is_vector(&self) -> bool {
        !matches!(self, EngineValue::Null | EngineValue::DataFrame { .. })
    }

    /// Row count of a data frame.
    pub fn row_count(&self) -> Option<usize> {
        match self {
            EngineValue::DataFrame { row_names, .. } => Some(row_names.len()),
            _ => None,
        }
    }

    /// Level string of factor element `idx`, `None` when missing.
    pub fn factor_level(&self, idx: usize) -> Option<&str> {
        match self {
            EngineValue::Factor { indices, levels } => {
                let code = *indices.get(idx)?;
                if code <= 0 {
                    return None;
                }
                levels.get(code as usize - 1).map(String::as_str)
            }
            _ => None,
        }
    }

    /// Character rendering of every element, `None` for missing ones.
    ///
    /// Lists and data frames render each entry as a whole.
    pub fn as_strings(&self) -> Vec<Option<String>> {
        match self {
            EngineValue::Null => Vec::new(),
            EngineValue::Logical(v) => v
                .iter()
                .map(|&b| match b {
                    LOGICAL_NA => None,
                    0 => Some("FALSE".to_string()),
                    _ => Some("TRUE".to_string()),
                })
                .collect(),
            EngineValue::Integer(v) => v
                .iter()
                .map(|&i| (i != INTEGER_NA).then(|| i.to_string()))
                .collect(),
            EngineValue::Double(v) => v
                .iter()
                .map(|&d| (!is_na_real(d)).then(|| format_real(d)))
                .collect(),
            EngineValue::String(v) => v.clone(),
            EngineValue::Factor { indices, .. } => (0..indices.len())
                .map(|i| self.factor_level(i).map(str::to_string))
                .collect(),
            EngineValue::List(entries) | EngineValue::DataFrame { columns: entries, .. } => {
                entries.iter().map(|e| Some(e.value.to_string())).collect()
            }
        }
    }
}

/// Format a real the way the engine prints it.
pub fn format_real(value: f64) -> String {
    if is_na_real(value) {
        "NA".to_string()
    } else if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let sign = if value > 0.0 { "" } else { "-" };
        format!("{}Inf", sign)
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineValue::Null => f.write_str("NULL"),
            EngineValue::List(entries) => {
                f.write_str("list(")?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some(name) = &entry.name {
                        write!(f, "{} = ", name)?;
                    }
                    write!(f, "{}", entry.value)?;
                }
                f.write_str(")")
            }
            EngineValue::DataFrame { columns, row_names } => {
                write!(
                    f,
                    "<data.frame: {} obs. of {} variables>",
                    row_names.len(),
                    columns.len()
                )
            }
            _ => {
                let quote = matches!(self, EngineValue::String(_));
                let parts: Vec<String> = self
                    .as_strings()
                    .into_iter()
                    .map(|s| match s {
                        Some(s) if quote => format!("\"{}\"", s),
                        Some(s) => s,
                        None => "NA".to_string(),
                    })
                    .collect();
                write!(f, "[1] {}", parts.join(" "))
            }
        }
    }
}
