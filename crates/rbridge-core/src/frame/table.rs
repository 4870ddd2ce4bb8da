//! Frame types and construction.

use std::fmt;

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};

/// Type of a column (or of the elements of a collection column).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Int,
    Double,
    String,
    ListOf(Box<ColumnType>),
}

impl ColumnType {
    /// Collection column with the given element type.
    pub fn list_of(element: ColumnType) -> Self {
        ColumnType::ListOf(Box::new(element))
    }

    /// Element type of a collection column.
    pub fn element_type(&self) -> Option<&ColumnType> {
        match self {
            ColumnType::ListOf(inner) => Some(inner),
            _ => None,
        }
    }

    /// Whether `cell` may appear in a column of this type.
    pub fn accepts(&self, cell: &Cell) -> bool {
        match (self, cell) {
            (_, Cell::Missing) => true,
            (ColumnType::Boolean, Cell::Boolean(_)) => true,
            (ColumnType::Int, Cell::Int(_)) => true,
            (ColumnType::Double, Cell::Double(_)) => true,
            (ColumnType::String, Cell::String(_)) => true,
            (ColumnType::ListOf(inner), Cell::List(items)) => {
                items.iter().all(|item| inner.accepts(item))
            }
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::String => f.write_str("string"),
            ColumnType::ListOf(inner) => write!(f, "list<{}>", inner),
        }
    }
}

/// Name and type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A single table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Boolean(bool),
    Int(i32),
    Double(f64),
    String(String),
    List(Vec<Cell>),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Cell::String(value.into())
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Boolean(v)
    }
}

impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Double(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::String(v.to_string())
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Cell::Missing, Into::into)
    }
}

/// An immutable, validated table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TabularFrame {
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<Cell>>,
    row_labels: Option<Vec<String>>,
}

impl TabularFrame {
    /// Build a frame, validating every invariant.
    pub fn new(
        columns: Vec<ColumnSpec>,
        rows: Vec<Vec<Cell>>,
        row_labels: Option<Vec<String>>,
    ) -> Result<Self> {
        let mut seen = FxHashSet::default();
        for spec in &columns {
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::InvalidFrame(format!(
                    "duplicate column name {:?}",
                    spec.name
                )));
            }
        }

        for (r, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(Error::InvalidFrame(format!(
                    "row {} has {} cells, expected {}",
                    r,
                    row.len(),
                    columns.len()
                )));
            }
            for (cell, spec) in row.iter().zip(&columns) {
                if !spec.column_type.accepts(cell) {
                    return Err(Error::InvalidFrame(format!(
                        "row {}: cell {:?} does not match column {:?} of type {}",
                        r, cell, spec.name, spec.column_type
                    )));
                }
            }
        }

        if let Some(labels) = &row_labels
            && labels.len() != rows.len()
        {
            return Err(Error::InvalidFrame(format!(
                "{} row labels for {} rows",
                labels.len(),
                rows.len()
            )));
        }

        Ok(Self {
            columns,
            rows,
            row_labels,
        })
    }

    /// A frame with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a frame column by column, row by row.
    pub fn builder() -> FrameBuilder {
        FrameBuilder::default()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_labels(&self) -> Option<&[String]> {
        self.row_labels.as_deref()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&Cell> {
        self.rows.get(row)?.get(column)
    }

    /// Iterate the cells of one column, top to bottom.
    pub fn column_cells(&self, column: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().filter_map(move |row| row.get(column))
    }
}

/// Incremental construction of a [`TabularFrame`].
#[derive(Debug, Default)]
pub struct FrameBuilder {
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<Cell>>,
    labels: Vec<String>,
    labelled: Option<bool>,
}

impl FrameBuilder {
    /// Append a column. Column names must be unique.
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnSpec::new(name, column_type));
        self
    }

    /// Append an unlabelled row.
    pub fn row(mut self, cells: Vec<Cell>) -> Self {
        self.rows.push(cells);
        self.labelled.get_or_insert(false);
        self
    }

    /// Append a labelled row.
    pub fn labelled_row(mut self, label: impl Into<String>, cells: Vec<Cell>) -> Self {
        self.rows.push(cells);
        self.labels.push(label.into());
        self.labelled.get_or_insert(true);
        self
    }

    pub fn build(self) -> Result<TabularFrame> {
        let row_labels = match self.labelled {
            Some(true) => Some(self.labels),
            Some(false) if !self.labels.is_empty() => {
                return Err(Error::InvalidFrame(
                    "rows must be either all labelled or all unlabelled".to_string(),
                ));
            }
            _ => None,
        };
        TabularFrame::new(self.columns, self.rows, row_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_builds_frame() {
        let frame = TabularFrame::builder()
            .column("name", ColumnType::String)
            .column("age", ColumnType::Int)
            .labelled_row("r1", vec!["ann".into(), 31.into()])
            .labelled_row("r2", vec![Cell::Missing, Cell::Missing])
            .build()
            .unwrap();

        assert_eq!(frame.row_count(), 2);
        assert_eq!(frame.column_count(), 2);
        assert_eq!(frame.column_index("age"), Some(1));
        assert_eq!(frame.cell(0, 1), Some(&Cell::Int(31)));
        assert_eq!(frame.row_labels().unwrap(), ["r1", "r2"]);
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let err = TabularFrame::builder()
            .column("a", ColumnType::Int)
            .column("a", ColumnType::Double)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn test_row_width_checked() {
        let result = TabularFrame::builder()
            .column("a", ColumnType::Int)
            .row(vec![1.into(), 2.into()])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_cell_type_checked() {
        let result = TabularFrame::builder()
            .column("a", ColumnType::Int)
            .row(vec![Cell::Double(1.5)])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_collection_cells_must_be_homogeneous() {
        let ok = TabularFrame::builder()
            .column("xs", ColumnType::list_of(ColumnType::Double))
            .row(vec![Cell::List(vec![1.0.into(), Cell::Missing])])
            .build();
        assert!(ok.is_ok());

        let mixed = TabularFrame::builder()
            .column("xs", ColumnType::list_of(ColumnType::Double))
            .row(vec![Cell::List(vec![1.0.into(), "a".into()])])
            .build();
        assert!(mixed.is_err());
    }

    #[test]
    fn test_mixed_labelling_rejected() {
        let result = TabularFrame::builder()
            .column("a", ColumnType::Int)
            .labelled_row("r1", vec![1.into()])
            .row(vec![2.into()])
            .build();
        assert!(result.is_err());
    }
}
