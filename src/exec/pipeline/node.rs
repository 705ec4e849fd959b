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
//! Generic graph vertex and the per-kind operator contract.
//!
//! Responsibilities:
//! - `ExecNode` owns identity (label, inputs, output edges), lifecycle flags
//!   and the completion of one vertex; kind-specific behaviour lives in a
//!   boxed `NodeOperator`.
//! - Provides emission helpers so operators push batches, end-of-input counts
//!   and errors to every bound output edge.
//!
//! Key exported interfaces:
//! - Types: `ExecNode`, `NodeOperator`, `BatchCounter`, `OutputEdge`.
//!
//! Data flows by direct calls: an upstream node invokes the input entry points
//! of each downstream node on its own thread. In a parallel context batches of
//! one edge may arrive out of order, so end of input is signalled with the
//! number of batches sent rather than by arrival order.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::backpressure::BackpressureMonitor;
use crate::exec::pipeline::completion::Completion;
use crate::exec::pipeline::context::ExecContext;
use crate::exec::pipeline::plan::{ExecPlan, PlanHandle};
use crate::novaflow_logging::debug;

/// Kind-specific behaviour of a node.
///
/// Every entry point receives the owning node so an operator can emit, finish
/// or reach its inputs without holding a back reference.
pub trait NodeOperator: Send + Sync {
    /// Kind name used in diagnostics, e.g. `SourceNode`.
    fn kind_name(&self) -> &'static str;

    fn output_schema(&self) -> SchemaRef;

    /// Parameter summary rendered between the braces of `label:Kind{...}`.
    fn describe(&self) -> String {
        String::new()
    }

    fn start_producing(&self, node: &Arc<ExecNode>) -> ExecResult<()>;

    fn stop_producing(&self, node: &Arc<ExecNode>) {
        node.stop_inputs();
        node.mark_finished(Ok(()));
    }

    fn input_received(&self, node: &Arc<ExecNode>, input_index: usize, chunk: Chunk);

    fn input_finished(&self, node: &Arc<ExecNode>, input_index: usize, total_batches: usize);

    fn error_received(&self, node: &Arc<ExecNode>, input_index: usize, error: ExecError) {
        let _ = input_index;
        node.fail(error);
    }

    fn pause_producing(&self, node: &Arc<ExecNode>, counter: u64) {
        for input in node.inputs() {
            input.pause_producing(counter);
        }
    }

    fn resume_producing(&self, node: &Arc<ExecNode>, counter: u64) {
        for input in node.inputs() {
            input.resume_producing(counter);
        }
    }

    fn backpressure_monitor(&self) -> Option<Arc<BackpressureMonitor>> {
        None
    }
}

/// Binding of this node as input `input_index` of `node`.
#[derive(Clone, Debug)]
pub struct OutputEdge {
    pub node: Weak<ExecNode>,
    pub input_index: usize,
}

/// Counts batches of one edge until the announced total has arrived.
///
/// `increment` and `set_total` return true exactly once, for the call that
/// completes the count.
#[derive(Debug, Default)]
pub struct BatchCounter {
    state: Mutex<BatchCounterState>,
}

#[derive(Debug, Default)]
struct BatchCounterState {
    count: usize,
    total: Option<usize>,
    fired: bool,
}

impl BatchCounterState {
    fn check_complete(&mut self) -> bool {
        if !self.fired && self.total == Some(self.count) {
            self.fired = true;
            return true;
        }
        false
    }
}

impl BatchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) -> bool {
        let mut st = self.state.lock().expect("batch counter lock");
        st.count += 1;
        st.check_complete()
    }

    pub fn set_total(&self, total: usize) -> bool {
        let mut st = self.state.lock().expect("batch counter lock");
        st.total = Some(total);
        st.check_complete()
    }

    pub fn count(&self) -> usize {
        self.state.lock().expect("batch counter lock").count
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("batch counter lock").fired
    }
}

pub struct ExecNode {
    label: String,
    inputs: Vec<Arc<ExecNode>>,
    num_outputs: usize,
    outputs: RwLock<Vec<OutputEdge>>,
    ctx: ExecContext,
    plan: Weak<ExecPlan>,
    finished: Completion<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    batches_emitted: AtomicUsize,
    operator: Box<dyn NodeOperator>,
}

impl fmt::Debug for ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecNode")
            .field("label", &self.label)
            .field("kind", &self.operator.kind_name())
            .field("num_inputs", &self.inputs.len())
            .field("num_outputs", &self.num_outputs)
            .finish()
    }
}

impl fmt::Display for ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{{{}}}",
            self.label,
            self.operator.kind_name(),
            self.operator.describe()
        )
    }
}

impl ExecNode {
    /// Builds the node and registers it as an output of each input.
    ///
    /// Nodes are created through `ExecPlan::add_node*`, which assigns the
    /// label and takes ownership.
    pub(crate) fn new_cyclic<F>(
        plan: &Arc<ExecPlan>,
        label: String,
        inputs: Vec<Arc<ExecNode>>,
        num_outputs: usize,
        make_operator: F,
    ) -> Arc<ExecNode>
    where
        F: FnOnce(&Weak<ExecNode>) -> Box<dyn NodeOperator>,
    {
        let node = Arc::new_cyclic(|weak| ExecNode {
            label,
            inputs,
            num_outputs,
            outputs: RwLock::new(Vec::new()),
            ctx: plan.exec_context().clone(),
            plan: Arc::downgrade(plan),
            finished: Completion::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            batches_emitted: AtomicUsize::new(0),
            operator: make_operator(weak),
        });
        for (input_index, input) in node.inputs.iter().enumerate() {
            input
                .outputs
                .write()
                .expect("node outputs lock")
                .push(OutputEdge {
                    node: Arc::downgrade(&node),
                    input_index,
                });
        }
        node
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind_name(&self) -> &'static str {
        self.operator.kind_name()
    }

    pub fn inputs(&self) -> &[Arc<ExecNode>] {
        &self.inputs
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Declared number of consumers.
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Number of edges that bind this node as an input so far.
    pub fn num_bound_outputs(&self) -> usize {
        self.outputs.read().expect("node outputs lock").len()
    }

    pub fn outputs(&self) -> Vec<OutputEdge> {
        self.outputs.read().expect("node outputs lock").clone()
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.operator.output_schema()
    }

    pub fn exec_context(&self) -> &ExecContext {
        &self.ctx
    }

    pub fn plan_handle(&self) -> PlanHandle {
        PlanHandle::new(self.plan.clone())
    }

    pub fn operator(&self) -> &dyn NodeOperator {
        self.operator.as_ref()
    }

    pub fn backpressure_monitor(&self) -> Option<Arc<BackpressureMonitor>> {
        self.operator.backpressure_monitor()
    }

    pub fn finished(&self) -> Completion<()> {
        self.finished.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_finished()
    }

    pub fn batches_emitted(&self) -> usize {
        self.batches_emitted.load(Ordering::Acquire)
    }

    pub fn start_producing(self: &Arc<Self>) -> ExecResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ExecError::invalid_graph(format!(
                "node {} was already started",
                self
            )));
        }
        debug!("start node {}", self);
        self.operator.start_producing(self)
    }

    /// Stops the node once; later calls are no-ops.
    pub fn stop_producing(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stop node {}", self);
        if !self.is_started() {
            self.mark_finished(Ok(()));
            return;
        }
        if self.is_finished() {
            return;
        }
        self.operator.stop_producing(self);
    }

    pub fn input_received(self: &Arc<Self>, input_index: usize, chunk: Chunk) {
        if self.is_finished() {
            return;
        }
        self.operator.input_received(self, input_index, chunk);
    }

    pub fn input_finished(self: &Arc<Self>, input_index: usize, total_batches: usize) {
        if self.is_finished() {
            return;
        }
        self.operator
            .input_finished(self, input_index, total_batches);
    }

    pub fn error_received(self: &Arc<Self>, input_index: usize, error: ExecError) {
        if self.is_finished() {
            return;
        }
        self.operator.error_received(self, input_index, error);
    }

    pub fn pause_producing(self: &Arc<Self>, counter: u64) {
        self.operator.pause_producing(self, counter);
    }

    pub fn resume_producing(self: &Arc<Self>, counter: u64) {
        self.operator.resume_producing(self, counter);
    }

    /// Delivers `chunk` to every output edge.
    pub fn emit(&self, chunk: Chunk) {
        self.batches_emitted.fetch_add(1, Ordering::AcqRel);
        for edge in self.outputs() {
            if let Some(out) = edge.node.upgrade() {
                out.input_received(edge.input_index, chunk.clone());
            }
        }
    }

    /// Announces that `total_batches` batches were emitted on every edge.
    pub fn emit_finished(&self, total_batches: usize) {
        for edge in self.outputs() {
            if let Some(out) = edge.node.upgrade() {
                out.input_finished(edge.input_index, total_batches);
            }
        }
    }

    pub fn emit_error(&self, error: ExecError) {
        for edge in self.outputs() {
            if let Some(out) = edge.node.upgrade() {
                out.error_received(edge.input_index, error.clone());
            }
        }
    }

    pub fn stop_inputs(&self) {
        for input in &self.inputs {
            input.stop_producing();
        }
    }

    pub fn mark_finished(&self, result: ExecResult<()>) -> bool {
        if let Err(err) = &result {
            debug!("node {} finished with error: {}", self, err);
        } else {
            debug!("node {} finished", self);
        }
        self.finished.mark_finished(result)
    }

    /// Terminal failure: error goes downstream, inputs are stopped.
    pub fn fail(&self, error: ExecError) {
        if self.is_finished() {
            return;
        }
        self.emit_error(error.clone());
        self.stop_inputs();
        self.mark_finished(Err(error));
    }
}
