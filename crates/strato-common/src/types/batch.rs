//! Columnar batches for vectorized execution.
//!
//! A [`Batch`] is an ordered sequence of equal-length typed columns. The
//! batch row count is uniform across columns and checked at construction.
//! Zero-row batches are legal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{StratoError, StratoResult};

use super::schema::{ColumnType, DataType, Schema};
use super::value::Value;

/// A typed column of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    column_type: ColumnType,
    values: Vec<Value>,
}

impl Column {
    /// Creates a new column with the given type and values.
    #[must_use]
    pub fn new(column_type: impl Into<ColumnType>, values: Vec<Value>) -> Self {
        Self {
            column_type: column_type.into(),
            values,
        }
    }

    /// Creates an empty column with the given type.
    #[must_use]
    pub fn empty(column_type: impl Into<ColumnType>) -> Self {
        Self::new(column_type, Vec::new())
    }

    /// Creates a column of 64-bit integers.
    #[must_use]
    pub fn int64(values: Vec<i64>) -> Self {
        Self::new(
            DataType::Int64,
            values.into_iter().map(Value::Int64).collect(),
        )
    }

    /// Creates a column of 64-bit floats.
    #[must_use]
    pub fn float64(values: Vec<f64>) -> Self {
        Self::new(
            DataType::Float64,
            values.into_iter().map(Value::Float64).collect(),
        )
    }

    /// Returns the column type.
    #[must_use]
    pub fn column_type(&self) -> &ColumnType {
        &self.column_type
    }

    /// Returns the logical data type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.column_type.data_type
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the column is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the value at the given index.
    #[must_use]
    pub fn get(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Null)
    }

    /// Returns the values as a slice.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Appends a value.
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Number of null entries, the population count of the inverse
    /// validity bitmap.
    #[must_use]
    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// Gathers the values at the given row indices into a new column.
    #[must_use]
    pub fn take(&self, indices: &[usize]) -> Column {
        let values = indices.iter().map(|&i| self.get(i).clone()).collect();
        Column::new(self.column_type, values)
    }
}

/// An ordered sequence of equal-length typed columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    schema: Arc<Schema>,
    columns: Vec<Column>,
    num_rows: usize,
}

impl Batch {
    /// Creates a new batch with the given schema and columns.
    ///
    /// Fails if column lengths differ or the column count does not match
    /// the schema.
    pub fn new(schema: Arc<Schema>, columns: Vec<Column>) -> StratoResult<Self> {
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);

        for (i, col) in columns.iter().enumerate() {
            if col.len() != num_rows {
                return Err(StratoError::execution(format!(
                    "column {} has {} rows, expected {}",
                    i,
                    col.len(),
                    num_rows
                )));
            }
        }

        if columns.len() != schema.len() {
            return Err(StratoError::execution(format!(
                "column count {} does not match schema field count {}",
                columns.len(),
                schema.len()
            )));
        }

        Ok(Self {
            schema,
            columns,
            num_rows,
        })
    }

    /// Creates an empty batch with the given schema.
    #[must_use]
    pub fn empty(schema: Arc<Schema>) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Column::empty(f.column_type))
            .collect();
        Self {
            schema,
            columns,
            num_rows: 0,
        }
    }

    /// Returns the schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Returns the column at the given index.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Returns the column with the given name.
    #[must_use]
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.schema.index_of(name).and_then(|i| self.columns.get(i))
    }

    /// Returns all columns.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Materializes the row at the given index.
    #[must_use]
    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.get(index).clone()).collect()
    }

    /// Projects the batch to the given column indices.
    pub fn project(&self, indices: &[usize]) -> StratoResult<Batch> {
        for &i in indices {
            if i >= self.columns.len() {
                return Err(StratoError::execution(format!(
                    "invalid column index {} in projection",
                    i
                )));
            }
        }
        let schema = Arc::new(self.schema.project(indices));
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        Batch::new(schema, columns)
    }

    /// Slices the batch to `length` rows starting at `offset`.
    pub fn slice(&self, offset: usize, length: usize) -> StratoResult<Batch> {
        if offset > self.num_rows {
            return Err(StratoError::execution(format!(
                "slice offset {} exceeds row count {}",
                offset, self.num_rows
            )));
        }
        let end = (offset + length).min(self.num_rows);
        let indices: Vec<usize> = (offset..end).collect();
        Ok(self.take(&indices))
    }

    /// Gathers the given row indices into a new batch.
    #[must_use]
    pub fn take(&self, indices: &[usize]) -> Batch {
        let columns: Vec<Column> = self.columns.iter().map(|c| c.take(indices)).collect();
        Batch {
            schema: self.schema.clone(),
            columns,
            num_rows: indices.len(),
        }
    }

    /// Concatenates batches that share a schema.
    pub fn concat(batches: &[Batch]) -> StratoResult<Batch> {
        let first = batches
            .first()
            .ok_or_else(|| StratoError::execution("cannot concat an empty batch list"))?;
        let schema = first.schema.clone();

        for batch in batches.iter().skip(1) {
            if batch.num_columns() != first.num_columns() {
                return Err(StratoError::execution("schema mismatch in concat"));
            }
        }

        let mut columns: Vec<Column> = first
            .columns
            .iter()
            .map(|c| Column::empty(*c.column_type()))
            .collect();
        let mut num_rows = 0;
        for batch in batches {
            num_rows += batch.num_rows;
            for (i, col) in batch.columns.iter().enumerate() {
                for v in col.values() {
                    columns[i].push(v.clone());
                }
            }
        }

        Ok(Batch {
            schema,
            columns,
            num_rows,
        })
    }

    /// Approximate in-memory size of the batch in bytes.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.values().iter().map(Value::approx_bytes).sum::<usize>())
            .sum()
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batch ({} rows x {} cols)",
            self.num_rows,
            self.num_columns()
        )?;
        let display_rows = self.num_rows.min(10);
        for i in 0..display_rows {
            for (j, col) in self.columns.iter().enumerate() {
                if j > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{}", col.get(i))?;
            }
            writeln!(f)?;
        }
        if self.num_rows > 10 {
            writeln!(f, "... ({} more rows)", self.num_rows - 10)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::schema::Field;

    fn test_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::not_null("a", DataType::Int64),
            Field::nullable("b", DataType::Float64),
        ]))
    }

    #[test]
    fn test_batch_new() {
        let batch = Batch::new(
            test_schema(),
            vec![
                Column::int64(vec![1, 2, 3]),
                Column::float64(vec![1.0, 2.0, 3.0]),
            ],
        )
        .unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 2);
    }

    #[test]
    fn test_batch_uneven_columns() {
        let result = Batch::new(
            test_schema(),
            vec![Column::int64(vec![1, 2, 3]), Column::float64(vec![1.0])],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_schema_mismatch() {
        let result = Batch::new(test_schema(), vec![Column::int64(vec![1])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_row_batch_is_legal() {
        let batch = Batch::empty(test_schema());
        assert!(batch.is_empty());
        assert_eq!(batch.num_columns(), 2);
    }

    #[test]
    fn test_take() {
        let batch = Batch::new(
            test_schema(),
            vec![
                Column::int64(vec![10, 20, 30]),
                Column::float64(vec![1.0, 2.0, 3.0]),
            ],
        )
        .unwrap();
        let taken = batch.take(&[2, 0]);
        assert_eq!(taken.num_rows(), 2);
        assert_eq!(taken.column(0).unwrap().get(0), &Value::Int64(30));
        assert_eq!(taken.column(0).unwrap().get(1), &Value::Int64(10));
    }

    #[test]
    fn test_slice() {
        let batch = Batch::new(
            test_schema(),
            vec![
                Column::int64(vec![1, 2, 3, 4]),
                Column::float64(vec![1.0, 2.0, 3.0, 4.0]),
            ],
        )
        .unwrap();
        let sliced = batch.slice(1, 2).unwrap();
        assert_eq!(sliced.num_rows(), 2);
        assert_eq!(sliced.column(0).unwrap().get(0), &Value::Int64(2));

        // Slicing past the end clamps.
        let sliced = batch.slice(3, 10).unwrap();
        assert_eq!(sliced.num_rows(), 1);

        assert!(batch.slice(5, 1).is_err());
    }

    #[test]
    fn test_concat() {
        let a = Batch::new(
            test_schema(),
            vec![Column::int64(vec![1]), Column::float64(vec![1.0])],
        )
        .unwrap();
        let b = Batch::new(
            test_schema(),
            vec![Column::int64(vec![2, 3]), Column::float64(vec![2.0, 3.0])],
        )
        .unwrap();
        let merged = Batch::concat(&[a, b]).unwrap();
        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.column(0).unwrap().get(2), &Value::Int64(3));
    }

    #[test]
    fn test_null_count() {
        let col = Column::new(
            DataType::Int64,
            vec![Value::Int64(1), Value::Null, Value::Int64(3)],
        );
        assert_eq!(col.null_count(), 1);
    }

    #[test]
    fn test_column_by_name() {
        let batch = Batch::new(
            test_schema(),
            vec![Column::int64(vec![7]), Column::float64(vec![0.5])],
        )
        .unwrap();
        assert_eq!(batch.column_by_name("a").unwrap().get(0), &Value::Int64(7));
        assert!(batch.column_by_name("missing").is_none());
    }
}
