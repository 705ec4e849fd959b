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
//! Union node: forwards batches of every input unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::declaration::ExecNodeOptions;
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;

#[derive(Clone, Copy, Debug, Default)]
pub struct UnionNodeOptions;

struct UnionOperator {
    schema: SchemaRef,
    counters: Vec<BatchCounter>,
    inputs_done: AtomicUsize,
}

impl UnionOperator {
    fn input_done(&self, node: &Arc<ExecNode>) {
        let done = self.inputs_done.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.counters.len() {
            node.emit_finished(node.batches_emitted());
            node.mark_finished(Ok(()));
        }
    }
}

impl NodeOperator for UnionOperator {
    fn kind_name(&self) -> &'static str {
        "UnionNode"
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        Ok(())
    }

    fn input_received(&self, node: &Arc<ExecNode>, input_index: usize, chunk: Chunk) {
        node.emit(chunk);
        if self.counters[input_index].increment() {
            self.input_done(node);
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, input_index: usize, total_batches: usize) {
        if self.counters[input_index].set_total(total_batches) {
            self.input_done(node);
        }
    }
}

pub fn make_union_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    _options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    let Some(first) = inputs.first() else {
        return Err(ExecError::invalid_graph(
            "UnionNode requires at least one input",
        ));
    };
    let schema = first.output_schema();
    for input in &inputs[1..] {
        let other = input.output_schema();
        let compatible = other.fields().len() == schema.fields().len()
            && other
                .fields()
                .iter()
                .zip(schema.fields())
                .all(|(a, b)| a.data_type() == b.data_type());
        if !compatible {
            return Err(ExecError::invalid_options(format!(
                "UnionNode inputs must share a schema, but {} produces {:?}",
                input.label(),
                other.fields()
            )));
        }
    }
    let counters = inputs.iter().map(|_| BatchCounter::new()).collect();
    plan.add_node(
        label,
        inputs,
        1,
        Box::new(UnionOperator {
            schema,
            counters,
            inputs_done: AtomicUsize::new(0),
        }),
    )
}
