//! Conversion between host tables and engine values.
//!
//! [`ValueCodec::encode`] turns a [`TabularFrame`] into an engine data frame,
//! [`ValueCodec::decode`] goes the other way. Missing cells map onto the
//! engine's NA sentinels of the matching vector type; strings are sent either
//! as factors or as character vectors depending on [`StringEncoding`].

mod factor;
mod scalars;

pub use factor::build_factor;
pub use scalars::{decode_variables, encode_variables};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{Cell, ColumnSpec, ColumnType, TabularFrame};
use crate::value::{
    EngineValue, INTEGER_NA, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE, ListEntry, ValueKind,
    is_na_real, real_na,
};

/// How string columns are represented in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// Factor with levels in first-occurrence order.
    #[default]
    Factor,
    /// Plain character vector.
    Character,
}

/// Table encoder / decoder.
#[derive(Debug, Clone, Copy)]
pub struct ValueCodec {
    string_encoding: StringEncoding,
    send_row_names: bool,
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self {
            string_encoding: StringEncoding::Factor,
            send_row_names: true,
        }
    }
}

impl ValueCodec {
    pub fn new(string_encoding: StringEncoding, send_row_names: bool) -> Self {
        Self {
            string_encoding,
            send_row_names,
        }
    }

    pub fn string_encoding(&self) -> StringEncoding {
        self.string_encoding
    }

    /// Encode a frame as an engine data frame.
    ///
    /// Row labels become the row names; frames without labels (or a codec
    /// configured not to send them) get `"1".."n"`.
    pub fn encode(&self, frame: &TabularFrame) -> Result<EngineValue> {
        let columns = frame
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                let value = self.encode_cells(&spec.column_type, frame.column_cells(idx));
                ListEntry::named(spec.name.clone(), value)
            })
            .collect();

        let row_names = match frame.row_labels() {
            Some(labels) if self.send_row_names => labels.to_vec(),
            _ => (1..=frame.row_count()).map(|i| i.to_string()).collect(),
        };

        EngineValue::data_frame(columns, row_names)
    }

    fn encode_cells<'a, I>(&self, column_type: &ColumnType, cells: I) -> EngineValue
    where
        I: IntoIterator<Item = &'a Cell>,
    {
        let cells = cells.into_iter();
        match column_type {
            ColumnType::Boolean => EngineValue::Logical(
                cells
                    .map(|cell| match cell {
                        Cell::Boolean(true) => LOGICAL_TRUE,
                        Cell::Boolean(false) => LOGICAL_FALSE,
                        _ => LOGICAL_NA,
                    })
                    .collect(),
            ),
            ColumnType::Int => EngineValue::Integer(
                cells
                    .map(|cell| match cell {
                        Cell::Int(v) => *v,
                        _ => INTEGER_NA,
                    })
                    .collect(),
            ),
            ColumnType::Double => EngineValue::Double(
                cells
                    .map(|cell| match cell {
                        Cell::Double(v) => *v,
                        _ => real_na(),
                    })
                    .collect(),
            ),
            ColumnType::String => {
                let strings = cells.map(|cell| match cell {
                    Cell::String(s) => Some(s.as_str()),
                    _ => None,
                });
                match self.string_encoding {
                    StringEncoding::Factor => build_factor(strings),
                    StringEncoding::Character => {
                        EngineValue::String(strings.map(|s| s.map(str::to_string)).collect())
                    }
                }
            }
            ColumnType::ListOf(element) => EngineValue::List(
                cells
                    .map(|cell| match cell {
                        Cell::List(items) => {
                            ListEntry::positional(self.encode_cells(element, items))
                        }
                        _ => ListEntry::positional(EngineValue::Null),
                    })
                    .collect(),
            ),
        }
    }

    /// Decode an engine data frame into a host frame.
    ///
    /// The engine's NA sentinels always become [`Cell::Missing`]; with
    /// `non_numbers_as_missing`, NaN and infinities do too.
    pub fn decode(&self, value: &EngineValue, non_numbers_as_missing: bool) -> Result<TabularFrame> {
        let (columns, row_names) = match value {
            EngineValue::DataFrame { columns, row_names } => (columns, row_names),
            other => {
                return Err(Error::UnsupportedShape(format!(
                    "only data.frame values can be imported, found {}",
                    other.kind()
                )));
            }
        };
        let row_count = row_names.len();

        let mut specs = Vec::with_capacity(columns.len());
        let mut column_cells = Vec::with_capacity(columns.len());
        let mut used = FxHashSet::default();

        for (idx, entry) in columns.iter().enumerate() {
            let base = match entry.name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => format!("R_out_{}", idx),
            };
            let name = unique_name(&mut used, base);

            if !matches!(entry.value, EngineValue::Null) && entry.value.len() != row_count {
                return Err(Error::UnsupportedShape(format!(
                    "column {:?} has {} elements, expected {}",
                    name,
                    entry.value.len(),
                    row_count
                )));
            }

            let (column_type, cells) =
                decode_column(&entry.value, row_count, non_numbers_as_missing)
                    .map_err(|e| match e {
                        Error::UnsupportedShape(msg) => {
                            Error::UnsupportedShape(format!("column {:?}: {}", name, msg))
                        }
                        other => other,
                    })?;
            specs.push(ColumnSpec::new(name, column_type));
            column_cells.push(cells);
        }

        let mut iters: Vec<_> = column_cells.into_iter().map(Vec::into_iter).collect();
        let rows = (0..row_count)
            .map(|_| {
                iters
                    .iter_mut()
                    .map(|it| it.next().unwrap_or(Cell::Missing))
                    .collect()
            })
            .collect();

        TabularFrame::new(specs, rows, Some(row_names.clone()))
    }
}

/// Make `base` unique among the names already used, suffixing ` (#n)`.
fn unique_name(used: &mut FxHashSet<String>, base: String) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{} (#{})", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn decode_column(
    value: &EngineValue,
    row_count: usize,
    non_numbers_as_missing: bool,
) -> Result<(ColumnType, Vec<Cell>)> {
    match value {
        EngineValue::Null => Ok((ColumnType::String, vec![Cell::Missing; row_count])),
        EngineValue::List(entries) => {
            let element = list_element_type(entries);
            let cells = entries
                .iter()
                .map(|entry| match &entry.value {
                    EngineValue::Null => Ok(Cell::Missing),
                    inner => decode_vector(inner, &element, non_numbers_as_missing).map(Cell::List),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((ColumnType::list_of(element), cells))
        }
        EngineValue::DataFrame { .. } => Err(Error::UnsupportedShape(
            "nested data frames are not supported".to_string(),
        )),
        vector => {
            let column_type = vector_type(vector.kind());
            let cells = decode_vector(vector, &column_type, non_numbers_as_missing)?;
            Ok((column_type, cells))
        }
    }
}

/// Host type of a plain vector kind.
fn vector_type(kind: ValueKind) -> ColumnType {
    match kind {
        ValueKind::Logical => ColumnType::Boolean,
        ValueKind::Integer => ColumnType::Int,
        ValueKind::Double => ColumnType::Double,
        _ => ColumnType::String,
    }
}

/// Element type shared by every non-null entry of a list column.
fn list_element_type(entries: &[ListEntry]) -> ColumnType {
    let mut kinds = entries
        .iter()
        .map(|e| e.value.kind())
        .filter(|k| *k != ValueKind::Null);
    match kinds.next() {
        Some(first) if kinds.all(|k| k == first) => vector_type(first),
        _ => ColumnType::String,
    }
}

/// Decode every element of a vector as a cell of `target`.
fn decode_vector(
    value: &EngineValue,
    target: &ColumnType,
    non_numbers_as_missing: bool,
) -> Result<Vec<Cell>> {
    let cells = match (value, target) {
        (EngineValue::Logical(v), ColumnType::Boolean) => v
            .iter()
            .map(|&b| match b {
                LOGICAL_TRUE => Cell::Boolean(true),
                LOGICAL_FALSE => Cell::Boolean(false),
                _ => Cell::Missing,
            })
            .collect(),
        (EngineValue::Integer(v), ColumnType::Int) => v
            .iter()
            .map(|&i| if i == INTEGER_NA { Cell::Missing } else { Cell::Int(i) })
            .collect(),
        (EngineValue::Double(v), ColumnType::Double) => v
            .iter()
            .map(|&d| {
                if is_na_real(d) || (non_numbers_as_missing && !d.is_finite()) {
                    Cell::Missing
                } else {
                    Cell::Double(d)
                }
            })
            .collect(),
        (EngineValue::DataFrame { .. }, _) => {
            return Err(Error::UnsupportedShape(
                "nested data frames are not supported".to_string(),
            ));
        }
        (other, _) => other
            .as_strings()
            .into_iter()
            .map(|s| s.map_or(Cell::Missing, Cell::String))
            .collect(),
    };
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> TabularFrame {
        TabularFrame::builder()
            .column("name", ColumnType::String)
            .column("age", ColumnType::Int)
            .column("score", ColumnType::Double)
            .column("member", ColumnType::Boolean)
            .labelled_row("a", vec!["ann".into(), 31.into(), 1.5.into(), true.into()])
            .labelled_row("b", vec![Cell::Missing, Cell::Missing, Cell::Missing, Cell::Missing])
            .labelled_row("c", vec!["bob".into(), 7.into(), (-2.0).into(), false.into()])
            .build()
            .unwrap()
    }

    #[test]
    fn test_encode_produces_data_frame() {
        let value = ValueCodec::default().encode(&people()).unwrap();
        match &value {
            EngineValue::DataFrame { columns, row_names } => {
                assert_eq!(row_names, &["a", "b", "c"]);
                assert_eq!(columns.len(), 4);
                assert_eq!(
                    columns[0].value,
                    EngineValue::Factor {
                        indices: vec![1, INTEGER_NA, 2],
                        levels: vec!["ann".into(), "bob".into()],
                    }
                );
                assert_eq!(columns[1].value, EngineValue::Integer(vec![31, INTEGER_NA, 7]));
                assert_eq!(
                    columns[3].value,
                    EngineValue::Logical(vec![LOGICAL_TRUE, LOGICAL_NA, LOGICAL_FALSE])
                );
                match &columns[2].value {
                    EngineValue::Double(v) => assert!(is_na_real(v[1])),
                    other => panic!("unexpected column {:?}", other),
                }
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = ValueCodec::default();
        let frame = people();
        let decoded = codec.decode(&codec.encode(&frame).unwrap(), false).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_character_encoding() {
        let codec = ValueCodec::new(StringEncoding::Character, true);
        let value = codec.encode(&people()).unwrap();
        let EngineValue::DataFrame { columns, .. } = value else {
            panic!("expected data frame");
        };
        assert_eq!(
            columns[0].value,
            EngineValue::String(vec![Some("ann".into()), None, Some("bob".into())])
        );
    }

    #[test]
    fn test_synthetic_row_names() {
        let frame = TabularFrame::builder()
            .column("x", ColumnType::Int)
            .row(vec![1.into()])
            .row(vec![2.into()])
            .build()
            .unwrap();
        let value = ValueCodec::default().encode(&frame).unwrap();
        assert_eq!(
            value,
            EngineValue::DataFrame {
                columns: vec![ListEntry::named("x", EngineValue::Integer(vec![1, 2]))],
                row_names: vec!["1".into(), "2".into()],
            }
        );

        let unlabelled = ValueCodec::new(StringEncoding::Factor, false)
            .encode(&people())
            .unwrap();
        assert_eq!(unlabelled.row_count(), Some(3));
        let EngineValue::DataFrame { row_names, .. } = unlabelled else {
            panic!("expected data frame");
        };
        assert_eq!(row_names, ["1", "2", "3"]);
    }

    #[test]
    fn test_non_numbers_as_missing() {
        let value = EngineValue::data_frame(
            vec![ListEntry::named(
                "x",
                EngineValue::Double(vec![f64::NAN, f64::INFINITY, real_na(), 1.0]),
            )],
            vec!["1".into(), "2".into(), "3".into(), "4".into()],
        )
        .unwrap();
        let codec = ValueCodec::default();

        let kept = codec.decode(&value, false).unwrap();
        let cells: Vec<_> = kept.column_cells(0).cloned().collect();
        assert!(matches!(cells[0], Cell::Double(d) if d.is_nan()));
        assert_eq!(cells[1], Cell::Double(f64::INFINITY));
        assert_eq!(cells[2], Cell::Missing);
        assert_eq!(cells[3], Cell::Double(1.0));

        let dropped = codec.decode(&value, true).unwrap();
        let cells: Vec<_> = dropped.column_cells(0).cloned().collect();
        assert_eq!(
            cells,
            vec![Cell::Missing, Cell::Missing, Cell::Missing, Cell::Double(1.0)]
        );
    }

    #[test]
    fn test_decode_rejects_non_frames() {
        let codec = ValueCodec::default();
        for value in [
            EngineValue::Integer(vec![1, 2]),
            EngineValue::Null,
            EngineValue::List(vec![]),
        ] {
            let err = codec.decode(&value, false).unwrap_err();
            assert!(matches!(err, Error::UnsupportedShape(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_decode_unnamed_and_null_columns() {
        let value = EngineValue::DataFrame {
            columns: vec![
                ListEntry::positional(EngineValue::Integer(vec![1])),
                ListEntry::named("empty", EngineValue::Null),
            ],
            row_names: vec!["r".into()],
        };
        let frame = ValueCodec::default().decode(&value, false).unwrap();
        assert_eq!(frame.columns()[0].name, "R_out_0");
        assert_eq!(frame.columns()[1].column_type, ColumnType::String);
        assert_eq!(frame.cell(0, 1), Some(&Cell::Missing));
    }

    #[test]
    fn test_list_columns() {
        let frame = TabularFrame::builder()
            .column("xs", ColumnType::list_of(ColumnType::Int))
            .row(vec![Cell::List(vec![1.into(), Cell::Missing])])
            .row(vec![Cell::Missing])
            .build()
            .unwrap();
        let codec = ValueCodec::default();
        let decoded = codec.decode(&codec.encode(&frame).unwrap(), false).unwrap();
        assert_eq!(decoded.columns(), frame.columns());
        assert_eq!(decoded.rows(), frame.rows());
    }

    #[test]
    fn test_mixed_list_column_falls_back_to_strings() {
        let value = EngineValue::DataFrame {
            columns: vec![ListEntry::named(
                "mixed",
                EngineValue::List(vec![
                    ListEntry::positional(EngineValue::Integer(vec![1])),
                    ListEntry::positional(EngineValue::strings(["a"])),
                ]),
            )],
            row_names: vec!["1".into(), "2".into()],
        };
        let frame = ValueCodec::default().decode(&value, false).unwrap();
        assert_eq!(
            frame.columns()[0].column_type,
            ColumnType::list_of(ColumnType::String)
        );
        assert_eq!(frame.cell(0, 0), Some(&Cell::List(vec!["1".into()])));
    }

    #[test]
    fn test_duplicate_engine_names_made_unique() {
        let value = EngineValue::DataFrame {
            columns: vec![
                ListEntry::named("x", EngineValue::Integer(vec![1])),
                ListEntry::named("x", EngineValue::Integer(vec![2])),
            ],
            row_names: vec!["1".into()],
        };
        let frame = ValueCodec::default().decode(&value, false).unwrap();
        assert_eq!(frame.columns()[1].name, "x (#1)");
    }
}
