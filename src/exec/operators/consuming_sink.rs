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
//! Push sink that hands every batch to an external consumer.
//!
//! Responsibilities:
//! - Calls `SinkNodeConsumer::init` at start, `consume` per batch and
//!   `finish` once after the last batch; the node completes when the
//!   consumer's finish completion does.
//! - Optionally renames output columns before the consumer sees them.
//! - Provides `table_sink`, a consumer that collects everything into one
//!   `RecordBatch`.
//!
//! Key exported interfaces:
//! - Types: `SinkNodeConsumer`, `ConsumingSinkNodeOptions`,
//!   `TableSinkNodeOptions`, `TableSlot`.

use std::sync::{Arc, Mutex, Weak};

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::exec::chunk::{Chunk, concat_chunks, rename_schema};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::backpressure::{BackpressureControl, UpstreamBackpressure};
use crate::exec::pipeline::completion::Completion;
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::{ExecPlan, PlanHandle};
use crate::exec::pipeline::registry::validate_input_count;
use crate::novaflow_logging::warn;

/// External receiver of a plan's output.
///
/// `consume` may be called concurrently when the plan runs on the exec pool.
pub trait SinkNodeConsumer: Send + Sync {
    fn init(
        &self,
        schema: &SchemaRef,
        backpressure: Arc<dyn BackpressureControl>,
        plan: &PlanHandle,
    ) -> ExecResult<()>;

    fn consume(&self, chunk: Chunk) -> ExecResult<()>;

    /// Called once after the last batch; gates the node's completion.
    fn finish(&self) -> Completion<()>;
}

pub struct ConsumingSinkNodeOptions {
    pub consumer: Arc<dyn SinkNodeConsumer>,
    pub names: Option<Vec<String>>,
}

impl ConsumingSinkNodeOptions {
    pub fn new(consumer: Arc<dyn SinkNodeConsumer>) -> Self {
        Self {
            consumer,
            names: None,
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }
}

struct ConsumingSinkOperator {
    kind: &'static str,
    input_schema: SchemaRef,
    consumer: Arc<dyn SinkNodeConsumer>,
    names: Option<Vec<String>>,
    control: Arc<UpstreamBackpressure>,
    counter: BatchCounter,
    state: Mutex<ConsumeState>,
}

/// `finish` is called only once no `consume` call is running, and no
/// `consume` call starts after it.
#[derive(Default)]
struct ConsumeState {
    in_flight: usize,
    failed: bool,
    finishing: bool,
    deferred: Option<ExecResult<()>>,
}

impl ConsumingSinkOperator {
    fn finish_with(&self, node: &Arc<ExecNode>, status: ExecResult<()>) {
        {
            let mut st = self.state.lock().expect("consuming sink state lock");
            if st.finishing {
                if status.is_err() && matches!(st.deferred, Some(Ok(()))) {
                    st.deferred = Some(status);
                }
                return;
            }
            st.finishing = true;
            if st.in_flight > 0 {
                st.deferred = Some(status);
                return;
            }
        }
        self.call_finish(node, status);
    }

    fn call_finish(&self, node: &Arc<ExecNode>, status: ExecResult<()>) {
        let weak: Weak<ExecNode> = Arc::downgrade(node);
        self.consumer.finish().on_complete(move |finish_result| {
            if let Some(node) = weak.upgrade() {
                node.mark_finished(status.and(finish_result.clone()));
            }
        });
    }

    fn fail(&self, node: &Arc<ExecNode>, error: ExecError) {
        {
            let mut st = self.state.lock().expect("consuming sink state lock");
            if st.failed {
                return;
            }
            st.failed = true;
        }
        warn!("consuming sink {} failed: {}", node.label(), error);
        node.stop_inputs();
        self.finish_with(node, Err(error));
    }
}

impl NodeOperator for ConsumingSinkOperator {
    fn kind_name(&self) -> &'static str {
        self.kind
    }

    fn output_schema(&self) -> SchemaRef {
        match &self.names {
            Some(names) => {
                rename_schema(&self.input_schema, names).unwrap_or_else(|_| self.input_schema.clone())
            }
            None => Arc::clone(&self.input_schema),
        }
    }

    fn start_producing(&self, node: &Arc<ExecNode>) -> ExecResult<()> {
        let schema = match &self.names {
            Some(names) => rename_schema(&self.input_schema, names)?,
            None => Arc::clone(&self.input_schema),
        };
        let control: Arc<dyn BackpressureControl> = self.control.clone();
        self.consumer.init(&schema, control, &node.plan_handle())
    }

    fn stop_producing(&self, node: &Arc<ExecNode>) {
        node.stop_inputs();
        self.finish_with(node, Ok(()));
    }

    fn input_received(&self, node: &Arc<ExecNode>, _input_index: usize, chunk: Chunk) {
        {
            let mut st = self.state.lock().expect("consuming sink state lock");
            if st.failed || st.finishing {
                return;
            }
            st.in_flight += 1;
        }
        let chunk = match &self.names {
            Some(names) => chunk.with_field_names(names),
            None => Ok(chunk),
        };
        let consumed = chunk.and_then(|c| self.consumer.consume(c));
        let deferred = {
            let mut st = self.state.lock().expect("consuming sink state lock");
            st.in_flight -= 1;
            if let Err(err) = &consumed
                && matches!(st.deferred, Some(Ok(())))
            {
                st.deferred = Some(Err(err.clone()));
            }
            if st.in_flight == 0 {
                st.deferred.take()
            } else {
                None
            }
        };
        if let Some(status) = deferred {
            self.call_finish(node, status);
        }
        if let Err(err) = consumed {
            self.fail(node, err);
            return;
        }
        if self.counter.increment() {
            self.finish_with(node, Ok(()));
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, _input_index: usize, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish_with(node, Ok(()));
        }
    }

    fn error_received(&self, node: &Arc<ExecNode>, _input_index: usize, error: ExecError) {
        self.fail(node, error);
    }
}

fn add_consuming_sink(
    plan: &Arc<ExecPlan>,
    kind: &'static str,
    inputs: Vec<Arc<ExecNode>>,
    consumer: Arc<dyn SinkNodeConsumer>,
    names: Option<Vec<String>>,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count(kind, &inputs, 1)?;
    let input_schema = inputs[0].output_schema();
    plan.add_node_with(label, inputs, 0, move |node| {
        Box::new(ConsumingSinkOperator {
            kind,
            input_schema,
            consumer,
            names,
            control: UpstreamBackpressure::from_weak(node.clone()),
            counter: BatchCounter::new(),
            state: Mutex::new(ConsumeState::default()),
        })
    })
}

pub fn make_consuming_sink_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    let options = options_as::<ConsumingSinkNodeOptions>("ConsumingSinkNode", options)?;
    add_consuming_sink(
        plan,
        "ConsumingSinkNode",
        inputs,
        Arc::clone(&options.consumer),
        options.names.clone(),
        label,
    )
}

/// Destination of a `table_sink`; holds the collected table once the plan finished.
pub type TableSlot = Arc<Mutex<Option<RecordBatch>>>;

pub struct TableSinkNodeOptions {
    pub output_table: TableSlot,
    pub names: Option<Vec<String>>,
}

impl TableSinkNodeOptions {
    pub fn new(output_table: TableSlot) -> Self {
        Self {
            output_table,
            names: None,
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }
}

struct TableSinkConsumer {
    output_table: TableSlot,
    schema: Mutex<Option<SchemaRef>>,
    chunks: Mutex<Vec<Chunk>>,
}

impl SinkNodeConsumer for TableSinkConsumer {
    fn init(
        &self,
        schema: &SchemaRef,
        _backpressure: Arc<dyn BackpressureControl>,
        _plan: &PlanHandle,
    ) -> ExecResult<()> {
        *self.schema.lock().expect("table sink schema lock") = Some(Arc::clone(schema));
        Ok(())
    }

    fn consume(&self, chunk: Chunk) -> ExecResult<()> {
        self.chunks.lock().expect("table sink chunks lock").push(chunk);
        Ok(())
    }

    fn finish(&self) -> Completion<()> {
        let schema = self.schema.lock().expect("table sink schema lock").clone();
        let Some(schema) = schema else {
            return Completion::finished(Err(ExecError::invalid_graph(
                "table sink finished before it was started",
            )));
        };
        let chunks = std::mem::take(&mut *self.chunks.lock().expect("table sink chunks lock"));
        let result = concat_chunks(&schema, &chunks).map(|table| {
            *self.output_table.lock().expect("table slot lock") = Some(table);
        });
        Completion::finished(result)
    }
}

pub fn make_table_sink_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    let options = options_as::<TableSinkNodeOptions>("TableSinkNode", options)?;
    let consumer = Arc::new(TableSinkConsumer {
        output_table: Arc::clone(&options.output_table),
        schema: Mutex::new(None),
        chunks: Mutex::new(Vec::new()),
    });
    add_consuming_sink(
        plan,
        "TableSinkNode",
        inputs,
        consumer,
        options.names.clone(),
        label,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    struct NoopControl;

    impl BackpressureControl for NoopControl {
        fn pause(&self) {}
        fn resume(&self) {}
    }

    #[test]
    fn table_consumer_concatenates_on_finish() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let slot: TableSlot = Arc::new(Mutex::new(None));
        let consumer = TableSinkConsumer {
            output_table: Arc::clone(&slot),
            schema: Mutex::new(None),
            chunks: Mutex::new(Vec::new()),
        };
        consumer
            .init(&schema, Arc::new(NoopControl), &PlanHandle::new(Weak::new()))
            .expect("init");
        for values in [vec![1i64, 2], vec![3]] {
            let chunk = Chunk::try_from_arrays(
                Arc::clone(&schema),
                vec![Arc::new(Int64Array::from(values))],
            )
            .expect("chunk");
            consumer.consume(chunk).expect("consume");
        }
        assert_eq!(consumer.finish().result(), Some(Ok(())));
        let table = slot.lock().expect("slot").clone().expect("table published");
        assert_eq!(table.num_rows(), 3);
    }

    #[test]
    fn table_consumer_requires_init() {
        let consumer = TableSinkConsumer {
            output_table: Arc::new(Mutex::new(None)),
            schema: Mutex::new(None),
            chunks: Mutex::new(Vec::new()),
        };
        assert!(matches!(
            consumer.finish().result(),
            Some(Err(ExecError::InvalidGraph(_)))
        ));
    }
}
