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
//! Shared shape of single-input nodes that map each batch to one output batch.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::ExecResult;
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;

pub(crate) trait ChunkMapper: Send + Sync {
    fn kind_name(&self) -> &'static str;

    fn describe(&self) -> String;

    fn output_schema(&self) -> SchemaRef;

    fn map(&self, chunk: Chunk) -> ExecResult<Chunk>;
}

struct MapOperator<M> {
    mapper: M,
    counter: BatchCounter,
}

impl<M> MapOperator<M> {
    fn finish(&self, node: &Arc<ExecNode>, total_batches: usize) {
        node.emit_finished(total_batches);
        node.mark_finished(Ok(()));
    }
}

impl<M: ChunkMapper> NodeOperator for MapOperator<M> {
    fn kind_name(&self) -> &'static str {
        self.mapper.kind_name()
    }

    fn output_schema(&self) -> SchemaRef {
        self.mapper.output_schema()
    }

    fn describe(&self) -> String {
        self.mapper.describe()
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        Ok(())
    }

    fn input_received(&self, node: &Arc<ExecNode>, _input_index: usize, chunk: Chunk) {
        match self.mapper.map(chunk) {
            Ok(out) => node.emit(out),
            Err(err) => {
                node.fail(err);
                return;
            }
        }
        if self.counter.increment() {
            self.finish(node, self.counter.count());
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, _input_index: usize, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish(node, total_batches);
        }
    }
}

pub(crate) fn add_map_node<M: ChunkMapper + 'static>(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    label: Option<String>,
    mapper: M,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count(mapper.kind_name(), &inputs, 1)?;
    plan.add_node(
        label,
        inputs,
        1,
        Box::new(MapOperator {
            mapper,
            counter: BatchCounter::new(),
        }),
    )
}
