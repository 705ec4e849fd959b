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
//! Equi hash-join node.
//!
//! Responsibilities:
//! - Collects the left (probe, input 0) and right (build, input 1) inputs.
//! - Once both inputs finished, builds a hash table over the right keys,
//!   probes it with every left row and emits the joined rows.
//!
//! Key exported interfaces:
//! - Types: `HashJoinNodeOptions`, `JoinType`.
//! - Functions: `make_hashjoin_node`.
//!
//! Output columns are the left columns followed by the right columns; semi
//! and anti joins emit one side only. Column names present on both sides get
//! the configured suffixes.

mod join_hash_table;

use std::fmt;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::row::{RowConverter, SortField};

use crate::exec::chunk::{Chunk, MAX_BATCH_SIZE, concat_chunks};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;
use crate::novaflow_logging::debug;

use join_hash_table::{JoinHashTable, row_has_null_key};

const LEFT: usize = 0;
const RIGHT: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinType {
    fn emits_left(self) -> bool {
        !matches!(self, JoinType::RightSemi | JoinType::RightAnti)
    }

    fn emits_right(self) -> bool {
        !matches!(self, JoinType::LeftSemi | JoinType::LeftAnti)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinType::LeftSemi => "LEFT_SEMI",
            JoinType::RightSemi => "RIGHT_SEMI",
            JoinType::LeftAnti => "LEFT_ANTI",
            JoinType::RightAnti => "RIGHT_ANTI",
            JoinType::Inner => "INNER",
            JoinType::LeftOuter => "LEFT_OUTER",
            JoinType::RightOuter => "RIGHT_OUTER",
            JoinType::FullOuter => "FULL_OUTER",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct HashJoinNodeOptions {
    pub join_type: JoinType,
    pub left_keys: Vec<String>,
    pub right_keys: Vec<String>,
    pub output_suffix_for_left: String,
    pub output_suffix_for_right: String,
}

impl HashJoinNodeOptions {
    pub fn new(join_type: JoinType, left_keys: Vec<String>, right_keys: Vec<String>) -> Self {
        Self {
            join_type,
            left_keys,
            right_keys,
            output_suffix_for_left: String::new(),
            output_suffix_for_right: String::new(),
        }
    }

    pub fn with_suffixes(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.output_suffix_for_left = left.into();
        self.output_suffix_for_right = right.into();
        self
    }
}

/// Row index pairs of the join result; `None` stands for the null-extended side.
#[derive(Debug, Default, PartialEq, Eq)]
struct JoinIndices {
    left: Vec<Option<u32>>,
    right: Vec<Option<u32>>,
}

impl JoinIndices {
    fn push(&mut self, left: Option<u32>, right: Option<u32>) {
        self.left.push(left);
        self.right.push(right);
    }
}

fn key_columns(batch: &RecordBatch, indices: &[usize]) -> Vec<ArrayRef> {
    indices
        .iter()
        .map(|&idx| Arc::clone(batch.column(idx)))
        .collect()
}

fn join_indices(
    join_type: JoinType,
    converter: &RowConverter,
    left_keys: &[ArrayRef],
    right_keys: &[ArrayRef],
) -> ExecResult<JoinIndices> {
    let table = JoinHashTable::build(converter, right_keys)?;
    let probe_rows = converter.convert_columns(left_keys)?;
    let mut right_matched = vec![false; table.num_build_rows()];
    let mut out = JoinIndices::default();

    for left_row in 0..probe_rows.num_rows() {
        let matches = if row_has_null_key(left_keys, left_row) {
            &[][..]
        } else {
            table.probe(&probe_rows, left_row)
        };
        let left_idx = Some(left_row as u32);
        match join_type {
            JoinType::LeftSemi => {
                if !matches.is_empty() {
                    out.push(left_idx, None);
                }
            }
            JoinType::LeftAnti => {
                if matches.is_empty() {
                    out.push(left_idx, None);
                }
            }
            _ => {
                for &right_row in matches {
                    right_matched[right_row as usize] = true;
                    if matches!(
                        join_type,
                        JoinType::Inner
                            | JoinType::LeftOuter
                            | JoinType::RightOuter
                            | JoinType::FullOuter
                    ) {
                        out.push(left_idx, Some(right_row));
                    }
                }
                if matches.is_empty()
                    && matches!(join_type, JoinType::LeftOuter | JoinType::FullOuter)
                {
                    out.push(left_idx, None);
                }
            }
        }
    }

    for (right_row, matched) in right_matched.into_iter().enumerate() {
        let right_idx = Some(right_row as u32);
        match join_type {
            JoinType::RightSemi if matched => out.push(None, right_idx),
            JoinType::RightAnti if !matched => out.push(None, right_idx),
            JoinType::RightOuter | JoinType::FullOuter if !matched => out.push(None, right_idx),
            _ => {}
        }
    }
    Ok(out)
}

fn take_columns(batch: &RecordBatch, indices: &[Option<u32>]) -> ExecResult<Vec<ArrayRef>> {
    let indices = UInt32Array::from(indices.to_vec());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for column in batch.columns() {
        columns.push(take(column.as_ref(), &indices, None)?);
    }
    Ok(columns)
}

#[derive(Default)]
struct JoinInputs {
    left: Vec<Chunk>,
    right: Vec<Chunk>,
}

struct HashJoinOperator {
    options: HashJoinNodeOptions,
    left_schema: SchemaRef,
    right_schema: SchemaRef,
    schema: SchemaRef,
    left_key_indices: Vec<usize>,
    right_key_indices: Vec<usize>,
    converter: RowConverter,
    inputs: Mutex<Option<JoinInputs>>,
    counters: [BatchCounter; 2],
    sides_done: Mutex<usize>,
}

impl HashJoinOperator {
    fn joined(&self) -> ExecResult<Vec<Chunk>> {
        let inputs = self
            .inputs
            .lock()
            .expect("hash join inputs lock")
            .take()
            .ok_or_else(|| ExecError::already_finished("hash join already produced its output"))?;
        let left = concat_chunks(&self.left_schema, &inputs.left)?;
        let right = concat_chunks(&self.right_schema, &inputs.right)?;
        let indices = join_indices(
            self.options.join_type,
            &self.converter,
            &key_columns(&left, &self.left_key_indices),
            &key_columns(&right, &self.right_key_indices),
        )?;
        let num_rows = indices.left.len();
        let join_type = self.options.join_type;
        let mut columns = Vec::with_capacity(self.schema.fields().len());
        if join_type.emits_left() {
            columns.extend(take_columns(&left, &indices.left)?);
        }
        if join_type.emits_right() {
            columns.extend(take_columns(&right, &indices.right)?);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        let batch = RecordBatch::try_new_with_options(Arc::clone(&self.schema), columns, &options)?;
        Ok(Chunk::new(batch).split(MAX_BATCH_SIZE))
    }

    fn side_done(&self, node: &Arc<ExecNode>) {
        let done = {
            let mut done = self.sides_done.lock().expect("hash join sides lock");
            *done += 1;
            *done
        };
        if done < 2 {
            return;
        }
        match self.joined() {
            Ok(chunks) => {
                let total = chunks.len();
                debug!("HashJoinNode {} produced {} batches", node.label(), total);
                for chunk in chunks {
                    node.emit(chunk);
                }
                node.emit_finished(total);
                node.mark_finished(Ok(()));
            }
            Err(err) => node.fail(err),
        }
    }
}

impl NodeOperator for HashJoinOperator {
    fn kind_name(&self) -> &'static str {
        "HashJoinNode"
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn describe(&self) -> String {
        let quote = |keys: &[String]| {
            keys.iter()
                .map(|k| format!("\"{}\"", k))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "type={}, left_keys=[{}], right_keys=[{}]",
            self.options.join_type,
            quote(&self.options.left_keys),
            quote(&self.options.right_keys)
        )
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        Ok(())
    }

    fn input_received(&self, node: &Arc<ExecNode>, input_index: usize, chunk: Chunk) {
        {
            let mut guard = self.inputs.lock().expect("hash join inputs lock");
            let Some(inputs) = guard.as_mut() else {
                return;
            };
            if input_index == LEFT {
                inputs.left.push(chunk);
            } else {
                inputs.right.push(chunk);
            }
        }
        if self.counters[input_index].increment() {
            self.side_done(node);
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, input_index: usize, total_batches: usize) {
        if self.counters[input_index].set_total(total_batches) {
            self.side_done(node);
        }
    }
}

fn resolve_keys(schema: &Schema, keys: &[String], side: &str) -> ExecResult<Vec<usize>> {
    keys.iter()
        .map(|key| {
            schema.index_of(key).map_err(|_| {
                ExecError::invalid_options(format!(
                    "HashJoinNode {} key {} is not a column of the {} input",
                    side, key, side
                ))
            })
        })
        .collect()
}

fn output_fields(
    options: &HashJoinNodeOptions,
    left: &Schema,
    right: &Schema,
) -> Vec<Field> {
    let join_type = options.join_type;
    let left_nullable = matches!(join_type, JoinType::RightOuter | JoinType::FullOuter);
    let right_nullable = matches!(join_type, JoinType::LeftOuter | JoinType::FullOuter);
    let collides = |name: &str, other: &Schema| {
        join_type.emits_left() && join_type.emits_right() && other.index_of(name).is_ok()
    };
    let mut fields = Vec::new();
    if join_type.emits_left() {
        for field in left.fields() {
            let mut out = field.as_ref().clone();
            if collides(field.name(), right) {
                out = out.with_name(format!("{}{}", field.name(), options.output_suffix_for_left));
            }
            if left_nullable {
                out = out.with_nullable(true);
            }
            fields.push(out);
        }
    }
    if join_type.emits_right() {
        for field in right.fields() {
            let mut out = field.as_ref().clone();
            if collides(field.name(), left) {
                out = out.with_name(format!("{}{}", field.name(), options.output_suffix_for_right));
            }
            if right_nullable {
                out = out.with_nullable(true);
            }
            fields.push(out);
        }
    }
    fields
}

pub fn make_hashjoin_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count("HashJoinNode", &inputs, 2)?;
    let options = options_as::<HashJoinNodeOptions>("HashJoinNode", options)?;
    if options.left_keys.len() != options.right_keys.len() || options.left_keys.is_empty() {
        return Err(ExecError::invalid_options(format!(
            "HashJoinNode requires the same non-zero number of left and right keys, got {} and {}",
            options.left_keys.len(),
            options.right_keys.len()
        )));
    }
    let left_schema = inputs[LEFT].output_schema();
    let right_schema = inputs[RIGHT].output_schema();
    let left_key_indices = resolve_keys(&left_schema, &options.left_keys, "left")?;
    let right_key_indices = resolve_keys(&right_schema, &options.right_keys, "right")?;

    let mut sort_fields = Vec::with_capacity(left_key_indices.len());
    for (&l, &r) in left_key_indices.iter().zip(&right_key_indices) {
        let left_type = left_schema.field(l).data_type();
        let right_type = right_schema.field(r).data_type();
        if left_type != right_type {
            return Err(ExecError::invalid_options(format!(
                "HashJoinNode key types differ: {} is {} but {} is {}",
                left_schema.field(l).name(),
                left_type,
                right_schema.field(r).name(),
                right_type
            )));
        }
        sort_fields.push(SortField::new(left_type.clone()));
    }
    let converter = RowConverter::new(sort_fields)?;
    let schema = Arc::new(Schema::new(output_fields(
        options,
        &left_schema,
        &right_schema,
    )));

    plan.add_node(
        label,
        inputs,
        1,
        Box::new(HashJoinOperator {
            options: options.clone(),
            left_schema,
            right_schema,
            schema,
            left_key_indices,
            right_key_indices,
            converter,
            inputs: Mutex::new(Some(JoinInputs::default())),
            counters: [BatchCounter::new(), BatchCounter::new()],
            sides_done: Mutex::new(0),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, StringArray};
    use arrow::datatypes::DataType;

    fn keys(values: Vec<Option<&str>>) -> Vec<ArrayRef> {
        vec![Arc::new(StringArray::from(values))]
    }

    fn converter() -> RowConverter {
        RowConverter::new(vec![SortField::new(DataType::Utf8)]).expect("rows")
    }

    #[test]
    fn inner_join_pairs_every_match() {
        let left = keys(vec![Some("alfa"), Some("beta"), None, Some("alfa")]);
        let right = keys(vec![Some("alfa"), Some("alfa"), None]);
        let out = join_indices(JoinType::Inner, &converter(), &left, &right).expect("join");
        assert_eq!(out.left, vec![Some(0), Some(0), Some(3), Some(3)]);
        assert_eq!(out.right, vec![Some(0), Some(1), Some(0), Some(1)]);
    }

    #[test]
    fn full_outer_join_null_extends_both_sides() {
        let left = keys(vec![Some("alfa"), Some("beta")]);
        let right = keys(vec![Some("gama"), Some("alfa")]);
        let out = join_indices(JoinType::FullOuter, &converter(), &left, &right).expect("join");
        assert_eq!(out.left, vec![Some(0), Some(1), None]);
        assert_eq!(out.right, vec![Some(1), None, Some(0)]);
    }

    #[test]
    fn semi_and_anti_joins_emit_each_row_once() {
        let left = keys(vec![Some("alfa"), Some("beta"), None]);
        let right = keys(vec![Some("alfa"), Some("alfa"), None]);
        let semi = join_indices(JoinType::LeftSemi, &converter(), &left, &right).expect("semi");
        assert_eq!(semi.left, vec![Some(0)]);
        let anti = join_indices(JoinType::LeftAnti, &converter(), &left, &right).expect("anti");
        assert_eq!(anti.left, vec![Some(1), Some(2)]);
        let right_anti =
            join_indices(JoinType::RightAnti, &converter(), &left, &right).expect("right anti");
        assert_eq!(right_anti.right, vec![Some(2)]);
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let left = Schema::new(vec![
            Field::new("i32", DataType::Int32, false),
            Field::new("str", DataType::Utf8, false),
        ]);
        let right = left.clone();
        let options = HashJoinNodeOptions::new(
            JoinType::LeftOuter,
            vec!["str".to_string()],
            vec!["str".to_string()],
        )
        .with_suffixes("_l", "_r");
        let fields = output_fields(&options, &left, &right);
        let names: Vec<&str> = fields.iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["i32_l", "str_l", "i32_r", "str_r"]);
        assert!(!fields[0].is_nullable());
        assert!(fields[2].is_nullable());
    }

    #[test]
    fn take_columns_fills_nulls_for_missing_side() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, true)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(vec![7, 8]))]).expect("batch");
        let columns = take_columns(&batch, &[Some(1), None]).expect("take");
        assert_eq!(columns[0].len(), 2);
        assert_eq!(columns[0].null_count(), 1);
    }
}
