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
//! Ordering pull sinks.
//!
//! Responsibilities:
//! - `OrderBySinkNode` accumulates all input, sorts it by `SortOptions` once
//!   the last batch arrived and hands the sorted rows to a `BatchReceiver`.
//! - `SelectKSinkNode` does the same but keeps only the first `k` rows of
//!   the ordering.
//!
//! Key exported interfaces:
//! - Types: `SortOptions`, `SortKey`, `SortOrder`, `NullPlacement`,
//!   `OrderBySinkNodeOptions`, `SelectKSinkNodeOptions`.

use std::fmt;
use std::sync::{Arc, Mutex};

use arrow::compute::{self, SortColumn, lexsort_to_indices, take_record_batch};
use arrow::datatypes::SchemaRef;

use crate::exec::chunk::{Chunk, MAX_BATCH_SIZE, concat_chunks};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::operators::sink::{BatchReceiver, SinkQueue};
use crate::exec::pipeline::backpressure::{
    BackpressureMonitor, BackpressureOptions, UpstreamBackpressure,
};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;
use crate::novaflow_logging::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NullPlacement {
    AtStart,
    #[default]
    AtEnd,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub name: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(name: impl Into<String>, order: SortOrder) -> Self {
        Self {
            name: name.into(),
            order,
        }
    }

    pub fn ascending(name: impl Into<String>) -> Self {
        Self::new(name, SortOrder::Ascending)
    }

    pub fn descending(name: impl Into<String>) -> Self {
        Self::new(name, SortOrder::Descending)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortOptions {
    pub sort_keys: Vec<SortKey>,
    pub null_placement: NullPlacement,
}

impl SortOptions {
    pub fn new(sort_keys: Vec<SortKey>) -> Self {
        Self {
            sort_keys,
            null_placement: NullPlacement::AtEnd,
        }
    }

    pub fn with_null_placement(mut self, null_placement: NullPlacement) -> Self {
        self.null_placement = null_placement;
        self
    }
}

impl fmt::Display for SortOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .sort_keys
            .iter()
            .map(|key| {
                let order = match key.order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                format!("FieldRef.Name({}) {}", key.name, order)
            })
            .collect();
        let nulls = match self.null_placement {
            NullPlacement::AtStart => "AtStart",
            NullPlacement::AtEnd => "AtEnd",
        };
        write!(f, "sort_keys=[{}], null_placement={}", keys.join(", "), nulls)
    }
}

pub struct OrderBySinkNodeOptions {
    pub sort_options: SortOptions,
    pub backpressure: BackpressureOptions,
    receiver: BatchReceiver,
}

impl OrderBySinkNodeOptions {
    pub fn new(sort_options: SortOptions) -> Self {
        Self {
            sort_options,
            backpressure: BackpressureOptions::default_backpressure(),
            receiver: BatchReceiver::new(),
        }
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureOptions) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn receiver(&self) -> BatchReceiver {
        self.receiver.clone()
    }
}

pub struct SelectKSinkNodeOptions {
    pub sort_options: SortOptions,
    pub k: usize,
    pub backpressure: BackpressureOptions,
    receiver: BatchReceiver,
}

impl SelectKSinkNodeOptions {
    pub fn new(sort_options: SortOptions, k: usize) -> Self {
        Self {
            sort_options,
            k,
            backpressure: BackpressureOptions::default_backpressure(),
            receiver: BatchReceiver::new(),
        }
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureOptions) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn receiver(&self) -> BatchReceiver {
        self.receiver.clone()
    }
}

struct OrderByOperator {
    kind: &'static str,
    schema: SchemaRef,
    sort_options: SortOptions,
    key_indices: Vec<usize>,
    limit: Option<usize>,
    queue: Arc<SinkQueue>,
    counter: BatchCounter,
    accumulated: Mutex<Vec<Chunk>>,
}

impl OrderByOperator {
    fn sorted_output(&self) -> ExecResult<Vec<Chunk>> {
        let chunks = std::mem::take(&mut *self.accumulated.lock().expect("order by input lock"));
        let table = concat_chunks(&self.schema, &chunks)?;
        if table.num_rows() == 0 {
            return Ok(Vec::new());
        }
        let nulls_first = self.sort_options.null_placement == NullPlacement::AtStart;
        let columns: Vec<SortColumn> = self
            .sort_options
            .sort_keys
            .iter()
            .zip(&self.key_indices)
            .map(|(key, &idx)| SortColumn {
                values: Arc::clone(table.column(idx)),
                options: Some(compute::SortOptions {
                    descending: key.order == SortOrder::Descending,
                    nulls_first,
                }),
            })
            .collect();
        let indices = lexsort_to_indices(&columns, self.limit)?;
        let sorted = take_record_batch(&table, &indices)?;
        Ok(Chunk::new(sorted).split(MAX_BATCH_SIZE))
    }

    fn finish(&self, node: &Arc<ExecNode>) {
        match self.sorted_output() {
            Ok(chunks) => {
                debug!(
                    "{} {} sorted {} output batches",
                    self.kind,
                    node.label(),
                    chunks.len()
                );
                for chunk in chunks {
                    self.queue.push(chunk);
                }
                self.queue.close(Ok(()));
                node.mark_finished(Ok(()));
            }
            Err(err) => {
                self.queue.close(Err(err.clone()));
                node.fail(err);
            }
        }
    }
}

impl NodeOperator for OrderByOperator {
    fn kind_name(&self) -> &'static str {
        self.kind
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn describe(&self) -> String {
        match self.limit {
            Some(k) => format!("k={}, by={{{}}}", k, self.sort_options),
            None => format!("by={{{}}}", self.sort_options),
        }
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        Ok(())
    }

    fn stop_producing(&self, node: &Arc<ExecNode>) {
        node.stop_inputs();
        self.queue.close(Ok(()));
        node.mark_finished(Ok(()));
    }

    fn input_received(&self, node: &Arc<ExecNode>, _input_index: usize, chunk: Chunk) {
        self.accumulated
            .lock()
            .expect("order by input lock")
            .push(chunk);
        if self.counter.increment() {
            self.finish(node);
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, _input_index: usize, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish(node);
        }
    }

    fn error_received(&self, node: &Arc<ExecNode>, _input_index: usize, error: ExecError) {
        self.queue.close(Err(error.clone()));
        node.fail(error);
    }

    fn backpressure_monitor(&self) -> Option<Arc<BackpressureMonitor>> {
        self.queue.monitor()
    }
}

fn add_order_by_sink(
    plan: &Arc<ExecPlan>,
    kind: &'static str,
    inputs: Vec<Arc<ExecNode>>,
    sort_options: &SortOptions,
    limit: Option<usize>,
    backpressure: BackpressureOptions,
    receiver: BatchReceiver,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count(kind, &inputs, 1)?;
    if sort_options.sort_keys.is_empty() {
        return Err(ExecError::invalid_options(format!(
            "{} requires at least one sort key",
            kind
        )));
    }
    let schema = inputs[0].output_schema();
    let mut key_indices = Vec::with_capacity(sort_options.sort_keys.len());
    for key in &sort_options.sort_keys {
        let idx = schema.index_of(&key.name).map_err(|_| {
            ExecError::invalid_options(format!(
                "{} sort key {} is not a column of the input",
                kind, key.name
            ))
        })?;
        key_indices.push(idx);
    }
    let sort_options = sort_options.clone();
    plan.add_node_with(label, inputs, 0, move |node| {
        let handler = UpstreamBackpressure::from_weak(node.clone());
        let monitor = Arc::new(BackpressureMonitor::new(backpressure, handler));
        let queue = Arc::new(SinkQueue::new(Some(monitor)));
        receiver.bind(&queue);
        Box::new(OrderByOperator {
            kind,
            schema,
            sort_options,
            key_indices,
            limit,
            queue,
            counter: BatchCounter::new(),
            accumulated: Mutex::new(Vec::new()),
        })
    })
}

pub fn make_order_by_sink_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    let options = options_as::<OrderBySinkNodeOptions>("OrderBySinkNode", options)?;
    add_order_by_sink(
        plan,
        "OrderBySinkNode",
        inputs,
        &options.sort_options,
        None,
        options.backpressure,
        options.receiver(),
        label,
    )
}

pub fn make_select_k_sink_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    let options = options_as::<SelectKSinkNodeOptions>("SelectKSinkNode", options)?;
    add_order_by_sink(
        plan,
        "SelectKSinkNode",
        inputs,
        &options.sort_options,
        Some(options.k),
        options.backpressure,
        options.receiver(),
        label,
    )
}
