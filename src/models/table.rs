//! Column-typed sample tables.
//!
//! Every tabular artifact that crosses a persistence boundary (iteration
//! samples, iteration results, algorithm history, cumulative summary) is a
//! `SampleTable`. Columns carry their numeric type explicitly so that a
//! restored table is indistinguishable from the one that was saved.
//!
//! K_i: All columns of a table have the same length (checked on construction
//! and on deserialization).

use crate::models::{CalibError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Numeric type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
}

/// Values of one column, tagged with their numeric type.
///
/// Float cells may be missing (`null` on disk), e.g. the score of a sample
/// that has not been analyzed yet. Non-finite cells are written as the
/// strings `"inf"`, `"-inf"` and `"nan"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    Int(Vec<i64>),
    Float(#[serde(with = "float_cells")] Vec<Option<f64>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> ColumnType {
        match self {
            Self::Int(_) => ColumnType::Int,
            Self::Float(_) => ColumnType::Float,
        }
    }

    fn empty(dtype: ColumnType) -> Self {
        match dtype {
            ColumnType::Int => Self::Int(Vec::new()),
            ColumnType::Float => Self::Float(Vec::new()),
        }
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Int(v) => Self::Int(rows.iter().map(|&i| v[i]).collect()),
            Self::Float(v) => Self::Float(rows.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn int(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Int(values),
        }
    }

    pub fn float(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Float(values.into_iter().map(Some).collect()),
        }
    }

    pub fn optional_float(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Float(values),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dtype(&self) -> ColumnType {
        self.data.dtype()
    }
}

/// An ordered set of equally long, uniquely named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct SampleTable {
    columns: Vec<Column>,
}

impl TryFrom<Vec<Column>> for SampleTable {
    type Error = String;

    fn try_from(columns: Vec<Column>) -> std::result::Result<Self, Self::Error> {
        if let Some(first) = columns.first() {
            let rows = first.len();
            if let Some(bad) = columns.iter().find(|c| c.len() != rows) {
                return Err(format!(
                    "column '{}' has {} rows, expected {}",
                    bad.name,
                    bad.len(),
                    rows
                ));
            }
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(format!("duplicate column '{}'", column.name));
            }
        }
        Ok(Self { columns })
    }
}

impl From<SampleTable> for Vec<Column> {
    fn from(table: SampleTable) -> Self {
        table.columns
    }
}

impl SampleTable {
    /// Create an empty table with no columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty (zero-row) table with the given schema.
    pub fn with_schema(schema: &[(String, ColumnType)]) -> Self {
        Self {
            columns: schema
                .iter()
                .map(|(name, dtype)| Column {
                    name: name.clone(),
                    data: ColumnData::empty(*dtype),
                })
                .collect(),
        }
    }

    /// Build a table from columns, checking lengths and name uniqueness.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        Self::try_from(columns).map_err(CalibError::InconsistentState)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column names with their numeric types, in order.
    pub fn schema(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.dtype()))
            .collect()
    }

    /// Append a column; its length must match the table's.
    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if !self.columns.is_empty() && column.len() != self.len() {
            return Err(CalibError::InconsistentState(format!(
                "column '{}' has {} rows, table has {}",
                column.name,
                column.len(),
                self.len()
            )));
        }
        if self.column(&column.name).is_some() {
            return Err(CalibError::InconsistentState(format!(
                "duplicate column '{}'",
                column.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Integer column values.
    pub fn ints(&self, name: &str) -> Result<&[i64]> {
        match self.column(name).map(|c| &c.data) {
            Some(ColumnData::Int(v)) => Ok(v),
            Some(ColumnData::Float(_)) => Err(type_mismatch(name, ColumnType::Int)),
            None => Err(missing(name)),
        }
    }

    /// Float column values, possibly missing.
    pub fn optional_floats(&self, name: &str) -> Result<&[Option<f64>]> {
        match self.column(name).map(|c| &c.data) {
            Some(ColumnData::Float(v)) => Ok(v),
            Some(ColumnData::Int(_)) => Err(type_mismatch(name, ColumnType::Float)),
            None => Err(missing(name)),
        }
    }

    /// Float column values; fails if any cell is missing.
    pub fn floats(&self, name: &str) -> Result<Vec<f64>> {
        self.optional_floats(name)?
            .iter()
            .enumerate()
            .map(|(row, v)| {
                v.ok_or_else(|| {
                    CalibError::InconsistentState(format!(
                        "column '{name}' has a missing value at row {row}"
                    ))
                })
            })
            .collect()
    }

    /// Append all rows of `other`, which must have the same schema.
    pub fn append(&mut self, other: &SampleTable) -> Result<()> {
        if self.columns.is_empty() {
            self.columns = other.columns.clone();
            return Ok(());
        }
        if self.schema() != other.schema() {
            return Err(CalibError::InconsistentState(format!(
                "cannot append table with schema {:?} to {:?}",
                other.schema(),
                self.schema()
            )));
        }
        for (mine, theirs) in self.columns.iter_mut().zip(&other.columns) {
            match (&mut mine.data, &theirs.data) {
                (ColumnData::Int(a), ColumnData::Int(b)) => a.extend_from_slice(b),
                (ColumnData::Float(a), ColumnData::Float(b)) => a.extend_from_slice(b),
                _ => unreachable!("schemas compared equal"),
            }
        }
        Ok(())
    }

    /// A new table holding the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> SampleTable {
        SampleTable {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.select(rows),
                })
                .collect(),
        }
    }

    /// Keep only the rows for which `keep(row)` holds.
    pub fn retain_rows(&mut self, keep: impl Fn(usize) -> bool) {
        let rows: Vec<usize> = (0..self.len()).filter(|&i| keep(i)).collect();
        *self = self.select_rows(&rows);
    }

    /// Sort rows by a float column, largest first; missing values sort last.
    pub fn sort_by_float_desc(&mut self, name: &str) -> Result<()> {
        let key = self.optional_floats(name)?.to_vec();
        let mut rows: Vec<usize> = (0..self.len()).collect();
        rows.sort_by(|&a, &b| match (key[a], key[b]) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        *self = self.select_rows(&rows);
        Ok(())
    }
}

/// JSON numbers cannot hold non-finite floats.
mod float_cells {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Cell {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(values: &[Option<f64>], serializer: S) -> Result<S::Ok, S::Error> {
        let cells: Vec<Option<Cell>> = values
            .iter()
            .map(|v| {
                v.map(|x| match x {
                    x if x.is_finite() => Cell::Number(x),
                    x if x.is_nan() => Cell::Text("nan".to_string()),
                    x if x > 0.0 => Cell::Text("inf".to_string()),
                    _ => Cell::Text("-inf".to_string()),
                })
            })
            .collect();
        cells.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Option<f64>>, D::Error> {
        let cells: Vec<Option<Cell>> = Vec::deserialize(deserializer)?;
        cells
            .into_iter()
            .map(|cell| match cell {
                None => Ok(None),
                Some(Cell::Number(x)) => Ok(Some(x)),
                Some(Cell::Text(t)) => match t.as_str() {
                    "inf" => Ok(Some(f64::INFINITY)),
                    "-inf" => Ok(Some(f64::NEG_INFINITY)),
                    "nan" => Ok(Some(f64::NAN)),
                    other => Err(de::Error::custom(format!("invalid float cell '{other}'"))),
                },
            })
            .collect()
    }
}

fn missing(name: &str) -> CalibError {
    CalibError::InconsistentState(format!("missing column '{name}'"))
}

fn type_mismatch(name: &str, expected: ColumnType) -> CalibError {
    CalibError::InconsistentState(format!("column '{name}' is not of type {expected:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> SampleTable {
        SampleTable::from_columns(vec![
            Column::int("sample_index", vec![0, 1, 2]),
            Column::float("x", vec![0.5, 0.1, 0.9]),
            Column::optional_float("total", vec![Some(-3.0), None, Some(-1.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_ragged_columns() {
        let err = SampleTable::from_columns(vec![
            Column::int("sample_index", vec![0, 1]),
            Column::float("x", vec![0.5]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("column 'x' has 1 rows"));
    }

    #[test]
    fn test_deserialize_rejects_ragged_columns() {
        let json = r#"[
            {"name": "a", "data": {"dtype": "int", "values": [1, 2]}},
            {"name": "b", "data": {"dtype": "float", "values": [1.0]}}
        ]"#;
        assert!(serde_json::from_str::<SampleTable>(json).is_err());
    }

    #[test]
    fn test_serialization_keeps_column_types() {
        let table = example();
        let json = serde_json::to_string(&table).unwrap();
        let restored: SampleTable = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, table);
        assert_eq!(restored.column("sample_index").unwrap().dtype(), ColumnType::Int);
        assert_eq!(restored.optional_floats("total").unwrap()[1], None);
    }

    #[test]
    fn test_non_finite_cells_survive_json() {
        let table = SampleTable::from_columns(vec![Column::optional_float(
            "result",
            vec![Some(f64::NEG_INFINITY), None, Some(-2.5), Some(f64::INFINITY)],
        )])
        .unwrap();
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.contains("\"-inf\""));
        let restored: SampleTable = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, table);
    }

    #[test]
    fn test_floats_reports_missing_cells() {
        let table = example();
        assert_eq!(table.floats("x").unwrap(), vec![0.5, 0.1, 0.9]);
        assert!(table.floats("total").is_err());
        assert!(table.ints("x").is_err());
    }

    #[test]
    fn test_append_requires_same_schema() {
        let mut table = example();
        table.append(&example()).unwrap();
        assert_eq!(table.len(), 6);

        let other = SampleTable::from_columns(vec![Column::float("sample_index", vec![1.0])]).unwrap();
        assert!(table.append(&other).is_err());
    }

    #[test]
    fn test_sort_desc_puts_missing_last() {
        let mut table = example();
        table.sort_by_float_desc("total").unwrap();
        assert_eq!(table.ints("sample_index").unwrap(), &[2, 0, 1]);
    }

    #[test]
    fn test_retain_rows() {
        let mut table = example();
        table.retain_rows(|row| row != 1);
        assert_eq!(table.ints("sample_index").unwrap(), &[0, 2]);
        assert_eq!(table.floats("x").unwrap(), vec![0.5, 0.9]);
    }
}
