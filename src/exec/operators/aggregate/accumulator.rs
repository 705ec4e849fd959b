// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Per-group accumulator states for the aggregate node.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};

use super::{CountMode, is_numeric_input};
use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AggKind {
    Sum,
    Count(CountMode),
    CountAll,
    Min,
    Max,
    Mean,
}

enum AccState {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Count(Vec<i64>),
    Mean(Vec<(f64, i64)>),
}

pub(crate) struct Accumulator {
    kind: AggKind,
    target: Option<usize>,
    state: AccState,
}

impl Accumulator {
    /// `target` is the input column index and type; `None` only for `count_all`.
    pub(crate) fn try_new(kind: AggKind, target: Option<(usize, DataType)>) -> ExecResult<Self> {
        let (target, input_type) = match target {
            Some((idx, data_type)) => (Some(idx), Some(data_type)),
            None => (None, None),
        };
        let state = match kind {
            AggKind::Count(_) | AggKind::CountAll => AccState::Count(Vec::new()),
            AggKind::Mean => {
                check_numeric(kind, input_type.as_ref())?;
                AccState::Mean(Vec::new())
            }
            AggKind::Sum | AggKind::Min | AggKind::Max => {
                match check_numeric(kind, input_type.as_ref())? {
                    dt if dt.is_floating() => AccState::Float(Vec::new()),
                    _ => AccState::Int(Vec::new()),
                }
            }
        };
        Ok(Self {
            kind,
            target,
            state,
        })
    }

    pub(crate) fn output_type(&self) -> DataType {
        match self.state {
            AccState::Int(_) | AccState::Count(_) => DataType::Int64,
            AccState::Float(_) | AccState::Mean(_) => DataType::Float64,
        }
    }

    pub(crate) fn resize(&mut self, num_groups: usize) {
        match &mut self.state {
            AccState::Int(v) => v.resize(num_groups, None),
            AccState::Float(v) => v.resize(num_groups, None),
            AccState::Count(v) => v.resize(num_groups, 0),
            AccState::Mean(v) => v.resize(num_groups, (0.0, 0)),
        }
    }

    fn input(&self, chunk: &Chunk) -> ExecResult<ArrayRef> {
        let idx = self.target.ok_or_else(|| {
            ExecError::invalid_options(format!("{:?} requires a target column", self.kind))
        })?;
        Ok(Arc::clone(chunk.batch.column(idx)))
    }

    pub(crate) fn update(&mut self, chunk: &Chunk, group_ids: &[usize]) -> ExecResult<()> {
        if let AggKind::CountAll = self.kind {
            if let AccState::Count(counts) = &mut self.state {
                for &g in group_ids {
                    counts[g] += 1;
                }
            }
            return Ok(());
        }
        let values = self.input(chunk)?;
        let kind = self.kind;
        match &mut self.state {
            AccState::Count(counts) => {
                let mode = match kind {
                    AggKind::Count(mode) => mode,
                    _ => CountMode::All,
                };
                for (row, &g) in group_ids.iter().enumerate() {
                    let counted = match mode {
                        CountMode::OnlyValid => values.is_valid(row),
                        CountMode::OnlyNull => values.is_null(row),
                        CountMode::All => true,
                    };
                    if counted {
                        counts[g] += 1;
                    }
                }
            }
            AccState::Int(slots) => {
                let values = cast(&values, &DataType::Int64)?;
                let values = values.as_primitive::<Int64Type>();
                for (row, &g) in group_ids.iter().enumerate() {
                    if values.is_null(row) {
                        continue;
                    }
                    let v = values.value(row);
                    slots[g] = Some(match (kind, slots[g]) {
                        (_, None) => v,
                        (AggKind::Sum, Some(acc)) => acc
                            .checked_add(v)
                            .ok_or_else(|| ExecError::operator("integer overflow in sum"))?,
                        (AggKind::Min, Some(acc)) => acc.min(v),
                        (_, Some(acc)) => acc.max(v),
                    });
                }
            }
            AccState::Float(slots) => {
                let values = cast(&values, &DataType::Float64)?;
                let values = values.as_primitive::<Float64Type>();
                for (row, &g) in group_ids.iter().enumerate() {
                    if values.is_null(row) {
                        continue;
                    }
                    let v = values.value(row);
                    slots[g] = Some(match (kind, slots[g]) {
                        (_, None) => v,
                        (AggKind::Sum, Some(acc)) => acc + v,
                        (AggKind::Min, Some(acc)) => acc.min(v),
                        (_, Some(acc)) => acc.max(v),
                    });
                }
            }
            AccState::Mean(slots) => {
                let values = cast(&values, &DataType::Float64)?;
                let values = values.as_primitive::<Float64Type>();
                for (row, &g) in group_ids.iter().enumerate() {
                    if values.is_valid(row) {
                        slots[g].0 += values.value(row);
                        slots[g].1 += 1;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> ArrayRef {
        match self.state {
            AccState::Int(v) => Arc::new(Int64Array::from(v)),
            AccState::Float(v) => Arc::new(Float64Array::from(v)),
            AccState::Count(v) => Arc::new(Int64Array::from(v)),
            AccState::Mean(v) => Arc::new(
                v.into_iter()
                    .map(|(sum, count)| (count > 0).then(|| sum / count as f64))
                    .collect::<Float64Array>(),
            ),
        }
    }
}

fn check_numeric(kind: AggKind, input_type: Option<&DataType>) -> ExecResult<DataType> {
    match input_type {
        Some(dt) if is_numeric_input(dt) => Ok(dt.clone()),
        Some(dt) => Err(ExecError::invalid_options(format!(
            "{:?} is not defined for input type {}",
            kind, dt
        ))),
        None => Err(ExecError::invalid_options(format!(
            "{:?} requires a target column",
            kind
        ))),
    }
}
