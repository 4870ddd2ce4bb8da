//! Named scalar variables exchanged alongside tables.

use std::fmt;

/// Value of a scalar variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int(i32),
    Double(f64),
    String(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Int(v) => write!(f, "{}", v),
            ScalarValue::Double(v) => write!(f, "{}", v),
            ScalarValue::String(v) => f.write_str(v),
        }
    }
}

/// A host variable with a name and a scalar value.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarVariable {
    pub name: String,
    pub value: ScalarValue,
}

impl ScalarVariable {
    pub fn int(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            value: ScalarValue::Int(value),
        }
    }

    pub fn double(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: ScalarValue::Double(value),
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ScalarValue::String(value.into()),
        }
    }
}
