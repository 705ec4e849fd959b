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
//! Exec plan: node ownership, validation and the start/stop protocol.
//!
//! Responsibilities:
//! - Owns every node of one dataflow graph and assigns auto labels.
//! - Validates output bindings, computes a topological order, starts nodes
//!   sinks-first and stops them sources-first.
//! - Aggregates node completions into the plan completion.
//!
//! Key exported interfaces:
//! - Types: `ExecPlan`, `PlanHandle`.
//!
//! A plan runs once. A failed start unwinds the nodes started so far in
//! reverse order; nodes that were never started get no stop call.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::exec::chunk::MAX_BATCH_SIZE;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::backpressure::BackpressureMonitor;
use crate::exec::pipeline::completion::Completion;
use crate::exec::pipeline::context::ExecContext;
use crate::exec::pipeline::node::{ExecNode, NodeOperator};
use crate::exec::pipeline::registry::{ExecFactoryRegistry, default_registry};
use crate::novaflow_logging::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlanState {
    Unstarted,
    Started,
    Stopped,
}

pub struct ExecPlan {
    ctx: ExecContext,
    registry: Arc<ExecFactoryRegistry>,
    nodes: RwLock<Vec<Arc<ExecNode>>>,
    state: Mutex<PlanState>,
    finished: Completion<()>,
}

impl fmt::Debug for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecPlan")
            .field("num_nodes", &self.num_nodes())
            .field("ctx", &self.ctx)
            .field("finished", &self.finished.is_finished())
            .finish()
    }
}

impl ExecPlan {
    /// Row ceiling applied by every source.
    pub const MAX_BATCH_SIZE: usize = MAX_BATCH_SIZE;

    pub fn make(ctx: ExecContext) -> Arc<ExecPlan> {
        Self::make_with_registry(ctx, default_registry())
    }

    pub fn make_with_registry(
        ctx: ExecContext,
        registry: Arc<ExecFactoryRegistry>,
    ) -> Arc<ExecPlan> {
        Arc::new(ExecPlan {
            ctx,
            registry,
            nodes: RwLock::new(Vec::new()),
            state: Mutex::new(PlanState::Unstarted),
            finished: Completion::new(),
        })
    }

    pub fn exec_context(&self) -> &ExecContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<ExecFactoryRegistry> {
        &self.registry
    }

    pub fn add_node(
        self: &Arc<Self>,
        label: Option<String>,
        inputs: Vec<Arc<ExecNode>>,
        num_outputs: usize,
        operator: Box<dyn NodeOperator>,
    ) -> ExecResult<Arc<ExecNode>> {
        self.add_node_with(label, inputs, num_outputs, |_| operator)
    }

    /// Like `add_node`, for operators that need a handle to their own node.
    pub fn add_node_with<F>(
        self: &Arc<Self>,
        label: Option<String>,
        inputs: Vec<Arc<ExecNode>>,
        num_outputs: usize,
        make_operator: F,
    ) -> ExecResult<Arc<ExecNode>>
    where
        F: FnOnce(&Weak<ExecNode>) -> Box<dyn NodeOperator>,
    {
        if *self.state.lock().expect("plan state lock") != PlanState::Unstarted {
            return Err(ExecError::invalid_graph(
                "cannot add nodes to a plan that was started or stopped",
            ));
        }
        let mut nodes = self.nodes.write().expect("plan nodes lock");
        for input in &inputs {
            if !nodes.iter().any(|n| Arc::ptr_eq(n, input)) {
                return Err(ExecError::invalid_graph(format!(
                    "input {} does not belong to this plan",
                    input
                )));
            }
        }
        let label = match label {
            Some(label) if !label.is_empty() => label,
            _ => nodes.len().to_string(),
        };
        let node = ExecNode::new_cyclic(self, label, inputs, num_outputs, make_operator);
        nodes.push(Arc::clone(&node));
        Ok(node)
    }

    pub fn nodes(&self) -> Vec<Arc<ExecNode>> {
        self.nodes.read().expect("plan nodes lock").clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.read().expect("plan nodes lock").len()
    }

    /// Nodes without inputs, in insertion order.
    pub fn sources(&self) -> Vec<Arc<ExecNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.num_inputs() == 0)
            .collect()
    }

    /// Nodes declaring no outputs, in insertion order.
    pub fn sinks(&self) -> Vec<Arc<ExecNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.num_outputs() == 0)
            .collect()
    }

    pub fn validate(&self) -> ExecResult<()> {
        let nodes = self.nodes();
        if nodes.is_empty() {
            return Err(ExecError::invalid_graph("ExecPlan has no nodes"));
        }
        for node in &nodes {
            let bound = node.num_bound_outputs();
            if bound != node.num_outputs() {
                return Err(ExecError::invalid_graph(format!(
                    "node {} declared {} outputs but {} are bound",
                    node,
                    node.num_outputs(),
                    bound
                )));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over input edges; sources come first.
    fn topological_order(&self) -> ExecResult<Vec<Arc<ExecNode>>> {
        let nodes = self.nodes();
        let index: HashMap<*const ExecNode, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (Arc::as_ptr(n), i))
            .collect();
        let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.num_inputs()).collect();
        let mut ready: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = ready.pop_front() {
            for edge in nodes[i].outputs() {
                let Some(out) = edge.node.upgrade() else {
                    continue;
                };
                if let Some(&j) = index.get(&Arc::as_ptr(&out)) {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        ready.push_back(j);
                    }
                }
            }
            order.push(Arc::clone(&nodes[i]));
        }
        if order.len() != nodes.len() {
            return Err(ExecError::invalid_graph("ExecPlan contains a cycle"));
        }
        Ok(order)
    }

    pub fn start_producing(&self) -> ExecResult<()> {
        {
            let mut state = self.state.lock().expect("plan state lock");
            if *state != PlanState::Unstarted {
                return Err(ExecError::invalid_graph("ExecPlan cannot be restarted"));
            }
            *state = PlanState::Started;
        }
        let order = match self.validate().and_then(|_| self.topological_order()) {
            Ok(order) => order,
            Err(err) => {
                warn!("exec plan rejected at start: {}", err);
                self.finished.mark_finished(Err(err.clone()));
                return Err(err);
            }
        };
        info!(
            "start exec plan: nodes={} use_threads={}",
            order.len(),
            self.ctx.use_threads()
        );

        let mut started: Vec<Arc<ExecNode>> = Vec::with_capacity(order.len());
        for (pos, node) in order.iter().enumerate().rev() {
            if let Err(err) = node.start_producing() {
                warn!("exec plan start failed at node {}: {}", node, err);
                node.mark_finished(Err(err.clone()));
                for never_started in &order[..pos] {
                    never_started.mark_finished(Ok(()));
                }
                for prev in started.iter().rev() {
                    prev.stop_producing();
                }
                // Resolves only after the stopped nodes have wound down.
                let all = Completion::all(order.iter().map(|n| n.finished()).collect());
                let finished = self.finished.clone();
                let start_error = err.clone();
                all.on_complete(move |_| {
                    finished.mark_finished(Err(start_error));
                });
                return Err(err);
            }
            started.push(Arc::clone(node));
        }

        let all = Completion::all(order.iter().map(|n| n.finished()).collect());
        let finished = self.finished.clone();
        all.on_complete(move |result| {
            match result {
                Ok(()) => info!("exec plan finished"),
                Err(err) => warn!("exec plan finished with error: {}", err),
            }
            finished.mark_finished(result.clone());
        });
        Ok(())
    }

    /// Requests every node to stop, sources first. Idempotent.
    pub fn stop_producing(&self) {
        let prev = {
            let mut state = self.state.lock().expect("plan state lock");
            let prev = *state;
            *state = PlanState::Stopped;
            prev
        };
        match prev {
            PlanState::Stopped => {}
            PlanState::Unstarted => {
                debug!("stop exec plan before start");
                for node in self.nodes() {
                    node.stop_producing();
                }
                self.finished.mark_finished(Ok(()));
            }
            PlanState::Started => {
                info!("stop exec plan");
                self.stop_nodes();
            }
        }
    }

    fn stop_nodes(&self) {
        let order = self.topological_order().unwrap_or_else(|_| self.nodes());
        for node in order {
            node.stop_producing();
        }
    }

    pub fn finished(&self) -> Completion<()> {
        self.finished.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.lock().expect("plan state lock") == PlanState::Stopped
    }

    /// Backpressure monitors of the plan's pull sinks, keyed by sink label.
    pub fn backpressure_monitors(&self) -> Vec<(String, Arc<BackpressureMonitor>)> {
        self.nodes()
            .into_iter()
            .filter_map(|n| {
                n.backpressure_monitor()
                    .map(|monitor| (n.label().to_string(), monitor))
            })
            .collect()
    }
}

fn write_tree(f: &mut fmt::Formatter<'_>, node: &ExecNode, depth: usize) -> fmt::Result {
    writeln!(f, "{:indent$}{}", "", node, indent = depth * 2)?;
    for input in node.inputs() {
        write_tree(f, input, depth + 1)?;
    }
    Ok(())
}

impl fmt::Display for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ExecPlan with {} nodes:", self.num_nodes())?;
        for sink in self.sinks() {
            write_tree(f, &sink, 0)?;
        }
        Ok(())
    }
}

impl Drop for ExecPlan {
    fn drop(&mut self) {
        let started = *self.state.lock().expect("plan state lock") == PlanState::Started;
        if started && !self.finished.is_finished() {
            warn!("exec plan dropped before finishing, stopping nodes");
            self.stop_nodes();
        }
    }
}

/// Non-owning reference to a plan, handed to sink consumers.
#[derive(Clone, Debug)]
pub struct PlanHandle {
    plan: Weak<ExecPlan>,
}

impl PlanHandle {
    pub(crate) fn new(plan: Weak<ExecPlan>) -> Self {
        Self { plan }
    }

    pub fn upgrade(&self) -> Option<Arc<ExecPlan>> {
        self.plan.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.plan.strong_count() > 0
    }

    /// Stops the plan if it is still alive.
    pub fn stop_producing(&self) {
        if let Some(plan) = self.upgrade() {
            plan.stop_producing();
        }
    }
}
