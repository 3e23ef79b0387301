//! The aggregation plug-in surface.
//!
//! An aggregator is cloned per group. [`Aggregate::fill`] accumulates
//! raw input, either densely or over a selection index list, honoring
//! nulls. The partial state travels between the per-shard and merge
//! phases as plain columns; [`Aggregate::merge`] combines partials and
//! is commutative and associative by construction.

use strato_common::{Column, DataType, Field, StratoError, StratoResult, Value};

use crate::instruction::{AggFunc, AggSpec};
use crate::process::Proc;

/// A single aggregation function instance.
pub trait Aggregate: Send {
    /// Clears accumulated state.
    fn reset(&mut self);

    /// The type of the final value.
    fn output_type(&self) -> DataType;

    /// Clones a fresh instance with empty state.
    fn dup(&self) -> Box<dyn Aggregate>;

    /// Accumulates raw input values. With a selection, only the indexed
    /// rows are visited; nulls never contribute.
    fn fill(&mut self, sels: Option<&[usize]>, col: &Column) -> StratoResult<()>;

    /// Fields describing the partial state columns, named after the
    /// output column.
    fn partial_fields(&self, output: &str) -> Vec<Field>;

    /// Current partial state, matching `partial_fields` positionally.
    fn partial_values(&self) -> Vec<Value>;

    /// Combines one partial state produced by another instance.
    fn merge(&mut self, partial: &[Value]) -> StratoResult<()>;

    /// The final value; null when no non-null input was seen (counts
    /// yield zero instead).
    fn eval(&self) -> Value;

    /// Materializes the final value as a one-element column, accounting
    /// the allocation against the process memory budget.
    fn eval_copy(&self, proc: &Proc) -> StratoResult<Column> {
        let value = self.eval();
        proc.mem.try_reserve(value.approx_bytes() as u64)?;
        Ok(Column::new(self.output_type(), vec![value]))
    }
}

/// Instantiates the aggregate for a spec.
pub fn new_aggregate(spec: &AggSpec, input_type: DataType) -> Box<dyn Aggregate> {
    match spec.func {
        AggFunc::Count => Box::new(CountAgg {
            count_star: spec.input.is_none(),
            count: 0,
        }),
        AggFunc::Sum => Box::new(SumAgg {
            float_input: input_type.is_float(),
            int_sum: 0,
            float_sum: 0.0,
            non_null: 0,
        }),
        AggFunc::Min => Box::new(ExtremeAgg {
            max: false,
            output_type: input_type,
            best: None,
        }),
        AggFunc::Max => Box::new(ExtremeAgg {
            max: true,
            output_type: input_type,
            best: None,
        }),
        AggFunc::Avg => Box::new(AvgAgg { sum: 0.0, count: 0 }),
    }
}

fn visit<'a>(
    sels: Option<&'a [usize]>,
    col: &'a Column,
) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
    match sels {
        Some(sels) => Box::new(sels.iter().map(move |&i| col.get(i))),
        None => Box::new(col.values().iter()),
    }
}

fn arity_error(name: &str, got: usize, want: usize) -> StratoError {
    StratoError::execution(format!(
        "{} partial state has {} values, expected {}",
        name, got, want
    ))
}

struct CountAgg {
    count_star: bool,
    count: i64,
}

impl Aggregate for CountAgg {
    fn reset(&mut self) {
        self.count = 0;
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn dup(&self) -> Box<dyn Aggregate> {
        Box::new(CountAgg {
            count_star: self.count_star,
            count: 0,
        })
    }

    fn fill(&mut self, sels: Option<&[usize]>, col: &Column) -> StratoResult<()> {
        if self.count_star {
            self.count += sels.map(|s| s.len()).unwrap_or_else(|| col.len()) as i64;
        } else {
            self.count += visit(sels, col).filter(|v| !v.is_null()).count() as i64;
        }
        Ok(())
    }

    fn partial_fields(&self, output: &str) -> Vec<Field> {
        vec![Field::not_null(output, DataType::Int64)]
    }

    fn partial_values(&self) -> Vec<Value> {
        vec![Value::Int64(self.count)]
    }

    fn merge(&mut self, partial: &[Value]) -> StratoResult<()> {
        let [count] = partial else {
            return Err(arity_error("count", partial.len(), 1));
        };
        self.count += count.to_i64().unwrap_or(0);
        Ok(())
    }

    fn eval(&self) -> Value {
        Value::Int64(self.count)
    }
}

struct SumAgg {
    float_input: bool,
    int_sum: i64,
    float_sum: f64,
    non_null: u64,
}

impl Aggregate for SumAgg {
    fn reset(&mut self) {
        self.int_sum = 0;
        self.float_sum = 0.0;
        self.non_null = 0;
    }

    fn output_type(&self) -> DataType {
        if self.float_input {
            DataType::Float64
        } else {
            DataType::Int64
        }
    }

    fn dup(&self) -> Box<dyn Aggregate> {
        Box::new(SumAgg {
            float_input: self.float_input,
            int_sum: 0,
            float_sum: 0.0,
            non_null: 0,
        })
    }

    fn fill(&mut self, sels: Option<&[usize]>, col: &Column) -> StratoResult<()> {
        for value in visit(sels, col) {
            if value.is_null() {
                continue;
            }
            self.non_null += 1;
            if self.float_input {
                self.float_sum += value.to_f64().unwrap_or(0.0);
            } else {
                self.int_sum += value.to_i64().unwrap_or(0);
            }
        }
        Ok(())
    }

    fn partial_fields(&self, output: &str) -> Vec<Field> {
        vec![Field::nullable(output, self.output_type())]
    }

    fn partial_values(&self) -> Vec<Value> {
        vec![self.eval()]
    }

    fn merge(&mut self, partial: &[Value]) -> StratoResult<()> {
        let [sum] = partial else {
            return Err(arity_error("sum", partial.len(), 1));
        };
        if sum.is_null() {
            return Ok(());
        }
        self.non_null += 1;
        if self.float_input {
            self.float_sum += sum.to_f64().unwrap_or(0.0);
        } else {
            self.int_sum += sum.to_i64().unwrap_or(0);
        }
        Ok(())
    }

    fn eval(&self) -> Value {
        if self.non_null == 0 {
            Value::Null
        } else if self.float_input {
            Value::Float64(self.float_sum)
        } else {
            Value::Int64(self.int_sum)
        }
    }
}

/// Min and max share one accumulator; `max` flips the comparison.
struct ExtremeAgg {
    max: bool,
    output_type: DataType,
    best: Option<Value>,
}

impl ExtremeAgg {
    fn consider(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        let better = match &self.best {
            None => true,
            Some(best) => {
                if self.max {
                    value > best
                } else {
                    value < best
                }
            }
        };
        if better {
            self.best = Some(value.clone());
        }
    }
}

impl Aggregate for ExtremeAgg {
    fn reset(&mut self) {
        self.best = None;
    }

    fn output_type(&self) -> DataType {
        self.output_type
    }

    fn dup(&self) -> Box<dyn Aggregate> {
        Box::new(ExtremeAgg {
            max: self.max,
            output_type: self.output_type,
            best: None,
        })
    }

    fn fill(&mut self, sels: Option<&[usize]>, col: &Column) -> StratoResult<()> {
        match sels {
            Some(sels) => {
                for &i in sels {
                    self.consider(&col.get(i).clone());
                }
            }
            None => {
                for i in 0..col.len() {
                    self.consider(&col.get(i).clone());
                }
            }
        }
        Ok(())
    }

    fn partial_fields(&self, output: &str) -> Vec<Field> {
        vec![Field::nullable(output, self.output_type)]
    }

    fn partial_values(&self) -> Vec<Value> {
        vec![self.eval()]
    }

    fn merge(&mut self, partial: &[Value]) -> StratoResult<()> {
        let [value] = partial else {
            return Err(arity_error("min/max", partial.len(), 1));
        };
        self.consider(value);
        Ok(())
    }

    fn eval(&self) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }
}

struct AvgAgg {
    sum: f64,
    count: i64,
}

impl Aggregate for AvgAgg {
    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn dup(&self) -> Box<dyn Aggregate> {
        Box::new(AvgAgg { sum: 0.0, count: 0 })
    }

    fn fill(&mut self, sels: Option<&[usize]>, col: &Column) -> StratoResult<()> {
        for value in visit(sels, col) {
            if let Some(v) = value.to_f64() {
                self.sum += v;
                self.count += 1;
            }
        }
        Ok(())
    }

    fn partial_fields(&self, output: &str) -> Vec<Field> {
        vec![
            Field::not_null(format!("{}_sum", output), DataType::Float64),
            Field::not_null(format!("{}_count", output), DataType::Int64),
        ]
    }

    fn partial_values(&self) -> Vec<Value> {
        vec![Value::Float64(self.sum), Value::Int64(self.count)]
    }

    fn merge(&mut self, partial: &[Value]) -> StratoResult<()> {
        let [sum, count] = partial else {
            return Err(arity_error("avg", partial.len(), 2));
        };
        self.sum += sum.to_f64().unwrap_or(0.0);
        self.count += count.to_i64().unwrap_or(0);
        Ok(())
    }

    fn eval(&self) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            Value::Float64(self.sum / self.count as f64)
        }
    }
}
