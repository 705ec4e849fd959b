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
//! Hash aggregation node for grouped and global aggregate execution.
//!
//! Responsibilities:
//! - Updates a group-key hash table and per-group accumulators for every
//!   input batch as it arrives.
//! - Finalizes accumulators once the last input batch was counted and emits
//!   the result split to the batch-size ceiling.
//!
//! Key exported interfaces:
//! - Types: `AggregateNodeOptions`, `Aggregate`, `CountMode`.
//! - Functions: `make_aggregate_node`.
//!
//! With keys the node is a `GroupByNode` and emits one row per distinct key;
//! without keys it is a `ScalarAggregateNode` and always emits exactly one row.
//! Output columns are the aggregates in declaration order followed by the keys.

mod accumulator;

use std::fmt;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::row::{OwnedRow, RowConverter, SortField};
use hashbrown::HashMap;

use crate::exec::chunk::{Chunk, MAX_BATCH_SIZE};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;
use crate::novaflow_logging::debug;

use accumulator::{AggKind, Accumulator};

/// Which rows `count` counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CountMode {
    #[default]
    OnlyValid,
    OnlyNull,
    All,
}

impl fmt::Display for CountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CountMode::OnlyValid => "NON_NULL",
            CountMode::OnlyNull => "ONLY_NULL",
            CountMode::All => "ALL",
        };
        f.write_str(name)
    }
}

/// One aggregate call: `function` over column `target`, output as `name`.
///
/// `function` is one of `sum`, `count`, `count_all`, `min`, `max`, `mean`,
/// optionally prefixed with `hash_` when the node has keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
    pub function: String,
    pub target: Option<String>,
    pub name: String,
    pub count_mode: Option<CountMode>,
}

impl Aggregate {
    pub fn new(
        function: impl Into<String>,
        target: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            function: function.into(),
            target: Some(target.into()),
            name: name.into(),
            count_mode: None,
        }
    }

    /// Aggregate without an input column, e.g. `count_all`.
    pub fn nullary(function: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            target: None,
            name: name.into(),
            count_mode: None,
        }
    }

    pub fn with_count_mode(mut self, mode: CountMode) -> Self {
        self.count_mode = Some(mode);
        self
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function)?;
        if let Some(target) = &self.target {
            f.write_str(target)?;
        }
        if let Some(mode) = self.count_mode {
            if self.target.is_some() {
                f.write_str(", ")?;
            }
            write!(f, "{{mode={}}}", mode)?;
        }
        f.write_str(")")
    }
}

#[derive(Clone, Debug, Default)]
pub struct AggregateNodeOptions {
    pub aggregates: Vec<Aggregate>,
    pub keys: Vec<String>,
}

impl AggregateNodeOptions {
    pub fn new(aggregates: Vec<Aggregate>, keys: Vec<String>) -> Self {
        Self { aggregates, keys }
    }
}

/// Group-key table plus accumulators, updated batch by batch.
struct GroupState {
    converter: Option<RowConverter>,
    groups: HashMap<OwnedRow, usize>,
    key_rows: Vec<OwnedRow>,
    num_groups: usize,
    accumulators: Vec<Accumulator>,
}

impl GroupState {
    fn group_ids(&mut self, key_columns: &[ArrayRef], num_rows: usize) -> ExecResult<Vec<usize>> {
        let Some(converter) = &self.converter else {
            return Ok(vec![0; num_rows]);
        };
        let rows = converter.convert_columns(key_columns)?;
        let mut ids = Vec::with_capacity(num_rows);
        for row in rows.iter() {
            let next_id = self.num_groups;
            let id = *self.groups.entry(row.owned()).or_insert_with(|| {
                self.key_rows.push(row.owned());
                next_id
            });
            if id == next_id {
                self.num_groups += 1;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn update(&mut self, chunk: &Chunk, key_indices: &[usize]) -> ExecResult<()> {
        let key_columns: Vec<ArrayRef> = key_indices
            .iter()
            .map(|&idx| Arc::clone(chunk.batch.column(idx)))
            .collect();
        let ids = self.group_ids(&key_columns, chunk.len())?;
        for acc in &mut self.accumulators {
            acc.resize(self.num_groups);
            acc.update(chunk, &ids)?;
        }
        Ok(())
    }

    fn finish(self, schema: &SchemaRef) -> ExecResult<RecordBatch> {
        let num_groups = self.num_groups;
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for mut acc in self.accumulators {
            acc.resize(num_groups);
            columns.push(acc.finish());
        }
        if let Some(converter) = &self.converter {
            columns.extend(converter.convert_rows(self.key_rows.iter().map(|r| r.row()))?);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(num_groups));
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(schema),
            columns,
            &options,
        )?)
    }
}

struct AggregateOperator {
    kind: &'static str,
    schema: SchemaRef,
    aggregates: Vec<Aggregate>,
    keys: Vec<String>,
    key_indices: Vec<usize>,
    state: Mutex<Option<GroupState>>,
    counter: BatchCounter,
}

impl AggregateOperator {
    fn output(&self) -> ExecResult<Vec<Chunk>> {
        let state = self
            .state
            .lock()
            .expect("aggregate state lock")
            .take()
            .ok_or_else(|| ExecError::already_finished("aggregate state was already finalized"))?;
        let batch = state.finish(&self.schema)?;
        Ok(Chunk::new(batch).split(MAX_BATCH_SIZE))
    }

    fn finish(&self, node: &Arc<ExecNode>) {
        match self.output() {
            Ok(chunks) => {
                let total = chunks.len();
                debug!(
                    "{} {} finalized into {} batches",
                    self.kind,
                    node.label(),
                    total
                );
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

impl NodeOperator for AggregateOperator {
    fn kind_name(&self) -> &'static str {
        self.kind
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        if !self.keys.is_empty() {
            let keys: Vec<String> = self.keys.iter().map(|k| format!("\"{}\"", k)).collect();
            out.push_str(&format!("keys=[{}], ", keys.join(", ")));
        }
        out.push_str("aggregates=[\n");
        for aggregate in &self.aggregates {
            out.push_str(&format!("\t{},\n", aggregate));
        }
        out.push(']');
        out
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        Ok(())
    }

    fn input_received(&self, node: &Arc<ExecNode>, _input_index: usize, chunk: Chunk) {
        let updated = {
            let mut guard = self.state.lock().expect("aggregate state lock");
            match guard.as_mut() {
                Some(state) => state.update(&chunk, &self.key_indices),
                None => return,
            }
        };
        if let Err(err) = updated {
            node.fail(err);
            return;
        }
        if self.counter.increment() {
            self.finish(node);
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, _input_index: usize, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish(node);
        }
    }
}

fn resolve_kind(aggregate: &Aggregate, grouped: bool) -> ExecResult<AggKind> {
    let (hashed, base) = match aggregate.function.strip_prefix("hash_") {
        Some(base) => (true, base),
        None => (false, aggregate.function.as_str()),
    };
    if hashed && !grouped {
        return Err(ExecError::invalid_options(format!(
            "hash aggregate function {} requires grouping keys",
            aggregate.function
        )));
    }
    let kind = match base {
        "sum" => AggKind::Sum,
        "count" => AggKind::Count(aggregate.count_mode.unwrap_or_default()),
        "count_all" => AggKind::CountAll,
        "min" => AggKind::Min,
        "max" => AggKind::Max,
        "mean" => AggKind::Mean,
        _ => {
            return Err(ExecError::invalid_options(format!(
                "unsupported aggregate function {}",
                aggregate.function
            )));
        }
    };
    Ok(kind)
}

fn column_index(schema: &Schema, kind: &str, name: &str) -> ExecResult<usize> {
    schema.index_of(name).map_err(|_| {
        ExecError::invalid_options(format!("{} refers to unknown column {}", kind, name))
    })
}

pub fn make_aggregate_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    let options = options_as::<AggregateNodeOptions>("AggregateNode", options)?;
    let grouped = !options.keys.is_empty();
    let kind = if grouped {
        "GroupByNode"
    } else {
        "ScalarAggregateNode"
    };
    validate_input_count(kind, &inputs, 1)?;
    let input_schema = inputs[0].output_schema();

    let mut fields = Vec::with_capacity(options.aggregates.len() + options.keys.len());
    let mut accumulators = Vec::with_capacity(options.aggregates.len());
    for aggregate in &options.aggregates {
        let agg_kind = resolve_kind(aggregate, grouped)?;
        let target = match (&aggregate.target, agg_kind) {
            (_, AggKind::CountAll) => None,
            (Some(target), _) => {
                let idx = column_index(&input_schema, kind, target)?;
                Some((idx, input_schema.field(idx).data_type().clone()))
            }
            (None, _) => {
                return Err(ExecError::invalid_options(format!(
                    "aggregate {} requires a target column",
                    aggregate.function
                )));
            }
        };
        let acc = Accumulator::try_new(agg_kind, target)?;
        fields.push(Field::new(&aggregate.name, acc.output_type(), true));
        accumulators.push(acc);
    }

    let mut key_indices = Vec::with_capacity(options.keys.len());
    let mut sort_fields = Vec::with_capacity(options.keys.len());
    for key in &options.keys {
        let idx = column_index(&input_schema, kind, key)?;
        let field = input_schema.field(idx);
        sort_fields.push(SortField::new(field.data_type().clone()));
        fields.push(field.clone().with_nullable(true));
        key_indices.push(idx);
    }
    let converter = if grouped {
        Some(RowConverter::new(sort_fields)?)
    } else {
        None
    };
    let num_groups = usize::from(!grouped);

    plan.add_node(
        label,
        inputs,
        1,
        Box::new(AggregateOperator {
            kind,
            schema: Arc::new(Schema::new(fields)),
            aggregates: options.aggregates.clone(),
            keys: options.keys.clone(),
            key_indices,
            state: Mutex::new(Some(GroupState {
                converter,
                groups: HashMap::new(),
                key_rows: Vec::new(),
                num_groups,
                accumulators,
            })),
            counter: BatchCounter::new(),
        }),
    )
}

/// Data types a numeric aggregate accepts.
pub(crate) fn is_numeric_input(data_type: &DataType) -> bool {
    data_type.is_integer() || data_type.is_floating() || *data_type == DataType::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray, Float64Array, Int32Array, Int64Array, StringArray};
    use arrow::datatypes::Int64Type;

    fn input() -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int32, true),
        ]));
        Chunk::try_from_arrays(
            schema,
            vec![
                Arc::new(StringArray::from(vec![
                    Some("a"),
                    Some("b"),
                    Some("a"),
                    None,
                ])),
                Arc::new(Int32Array::from(vec![Some(1), Some(2), None, Some(4)])),
            ],
        )
        .expect("chunk")
    }

    fn state(kinds: Vec<(AggKind, Option<usize>)>, grouped: bool) -> GroupState {
        let chunk = input();
        let schema = chunk.schema();
        let accumulators = kinds
            .into_iter()
            .map(|(kind, idx)| {
                let target = idx.map(|i| (i, schema.field(i).data_type().clone()));
                Accumulator::try_new(kind, target).expect("accumulator")
            })
            .collect();
        GroupState {
            converter: grouped
                .then(|| RowConverter::new(vec![SortField::new(DataType::Utf8)]).expect("rows")),
            groups: HashMap::new(),
            key_rows: Vec::new(),
            num_groups: usize::from(!grouped),
            accumulators,
        }
    }

    #[test]
    fn grouped_sum_and_count_follow_key_order_of_first_appearance() {
        let mut st = state(
            vec![
                (AggKind::Sum, Some(1)),
                (AggKind::Count(CountMode::OnlyValid), Some(1)),
                (AggKind::CountAll, None),
            ],
            true,
        );
        st.update(&input(), &[0]).expect("update");
        let schema = Arc::new(Schema::new(vec![
            Field::new("sum", DataType::Int64, true),
            Field::new("count", DataType::Int64, true),
            Field::new("count_all", DataType::Int64, true),
            Field::new("k", DataType::Utf8, true),
        ]));
        let batch = st.finish(&schema).expect("finish");
        assert_eq!(batch.num_rows(), 3);
        let sums = batch.column(0).as_primitive::<Int64Type>();
        assert_eq!(sums.value(0), 1);
        assert_eq!(sums.value(1), 2);
        assert_eq!(sums.value(2), 4);
        let counts = batch.column(1).as_primitive::<Int64Type>();
        assert_eq!(counts.values().to_vec(), vec![1, 1, 1]);
        let all = batch.column(2).as_primitive::<Int64Type>();
        assert_eq!(all.values().to_vec(), vec![2, 1, 1]);
        let keys = batch.column(3).as_string::<i32>();
        assert_eq!(keys.value(0), "a");
        assert_eq!(keys.value(1), "b");
        assert!(keys.is_null(2));
    }

    #[test]
    fn scalar_aggregate_emits_one_row_even_without_input() {
        let st = state(vec![(AggKind::Sum, Some(1)), (AggKind::CountAll, None)], false);
        let schema = Arc::new(Schema::new(vec![
            Field::new("sum", DataType::Int64, true),
            Field::new("count_all", DataType::Int64, true),
        ]));
        let batch = st.finish(&schema).expect("finish");
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column(0).is_null(0));
        let counts = Array::as_any(batch.column(1).as_ref()).downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(counts.value(0), 0);
    }

    #[test]
    fn mean_min_max_skip_nulls() {
        let mut st = state(
            vec![
                (AggKind::Mean, Some(1)),
                (AggKind::Min, Some(1)),
                (AggKind::Max, Some(1)),
            ],
            false,
        );
        st.update(&input(), &[]).expect("update");
        let schema = Arc::new(Schema::new(vec![
            Field::new("mean", DataType::Float64, true),
            Field::new("min", DataType::Int64, true),
            Field::new("max", DataType::Int64, true),
        ]));
        let batch = st.finish(&schema).expect("finish");
        let mean = Array::as_any(batch.column(0).as_ref())
            .downcast_ref::<Float64Array>()
            .expect("f64");
        assert!((mean.value(0) - 7.0 / 3.0).abs() < 1e-9);
        assert_eq!(batch.column(1).as_primitive::<Int64Type>().value(0), 1);
        assert_eq!(batch.column(2).as_primitive::<Int64Type>().value(0), 4);
    }

    #[test]
    fn function_names_resolve_with_optional_hash_prefix() {
        let agg = Aggregate::new("hash_sum", "v", "s");
        assert_eq!(resolve_kind(&agg, true), Ok(AggKind::Sum));
        assert!(matches!(
            resolve_kind(&agg, false),
            Err(ExecError::InvalidOptions(_))
        ));
        let unknown = Aggregate::new("tdigest", "v", "t");
        assert!(resolve_kind(&unknown, true).is_err());
    }

    #[test]
    fn aggregate_display_includes_count_mode() {
        let agg = Aggregate::new("hash_count", "multiply(i32, 2)", "c")
            .with_count_mode(CountMode::OnlyValid);
        assert_eq!(
            agg.to_string(),
            "hash_count(multiply(i32, 2), {mode=NON_NULL})"
        );
        assert_eq!(Aggregate::nullary("count_all", "n").to_string(), "count_all()");
    }
}
