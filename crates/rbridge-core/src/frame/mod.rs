//! Host-side tabular data passed across the engine boundary.
//!
//! A [`TabularFrame`] is an immutable table of named, typed columns with an
//! optional row label per row. Cells carry either a typed value or
//! [`Cell::Missing`]. Frames are validated once when built and never mutated
//! afterwards; a changed table is a new frame.

mod table;
mod variables;

pub use table::{Cell, ColumnSpec, ColumnType, FrameBuilder, TabularFrame};
pub use variables::{ScalarValue, ScalarVariable};
