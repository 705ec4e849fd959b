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
//! One-call runners that turn a declaration into results.
//!
//! Each runner builds a fresh plan from the declaration, appends a sink,
//! starts the plan and blocks until it finished. The first error from start
//! or from completion is returned.

use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::operators::consuming_sink::{
    ConsumingSinkNodeOptions, SinkNodeConsumer, TableSinkNodeOptions, TableSlot,
};
use crate::exec::operators::sink::SinkNodeOptions;
use crate::exec::pipeline::backpressure::{BackpressureControl, BackpressureOptions};
use crate::exec::pipeline::completion::Completion;
use crate::exec::pipeline::context::ExecContext;
use crate::exec::pipeline::declaration::Declaration;
use crate::exec::pipeline::plan::{ExecPlan, PlanHandle};
use crate::novaflow_logging::debug;

/// Output batches of a plan together with their schema.
#[derive(Clone, Debug)]
pub struct ChunksWithSchema {
    pub schema: SchemaRef,
    pub chunks: Vec<Chunk>,
}

impl ChunksWithSchema {
    pub fn num_rows(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }
}

fn new_plan(use_threads: bool) -> Arc<ExecPlan> {
    ExecPlan::make(ExecContext::new(use_threads))
}

pub fn declaration_to_chunks(
    declaration: Declaration,
    use_threads: bool,
) -> ExecResult<ChunksWithSchema> {
    let plan = new_plan(use_threads);
    let last = declaration.add_to_plan(&plan)?;
    let schema = last.output_schema();
    let sink_options =
        SinkNodeOptions::new().with_backpressure(BackpressureOptions::no_backpressure());
    let mut receiver = sink_options.receiver();
    Declaration::new("sink", sink_options)
        .with_input(last)
        .add_to_plan(&plan)?;

    plan.start_producing()?;
    let collected = receiver.collect_blocking();
    plan.finished().wait()?;
    let chunks = collected?;
    debug!("plan produced {} batches", chunks.len());
    Ok(ChunksWithSchema { schema, chunks })
}

/// Runs the declaration and concatenates its output into one batch.
pub fn declaration_to_table(declaration: Declaration, use_threads: bool) -> ExecResult<RecordBatch> {
    let plan = new_plan(use_threads);
    let last = declaration.add_to_plan(&plan)?;
    let slot: TableSlot = Arc::new(Mutex::new(None));
    Declaration::new("table_sink", TableSinkNodeOptions::new(Arc::clone(&slot)))
        .with_input(last)
        .add_to_plan(&plan)?;

    plan.start_producing()?;
    plan.finished().wait()?;
    let table = slot.lock().expect("table slot lock").take();
    table.ok_or_else(|| ExecError::already_finished("plan finished without producing a table"))
}

struct DiscardConsumer;

impl SinkNodeConsumer for DiscardConsumer {
    fn init(
        &self,
        _schema: &SchemaRef,
        _backpressure: Arc<dyn BackpressureControl>,
        _plan: &PlanHandle,
    ) -> ExecResult<()> {
        Ok(())
    }

    fn consume(&self, _chunk: Chunk) -> ExecResult<()> {
        Ok(())
    }

    fn finish(&self) -> Completion<()> {
        Completion::ok()
    }
}

/// Runs the declaration for its side effects and discards the output.
pub fn declaration_to_status(declaration: Declaration, use_threads: bool) -> ExecResult<()> {
    let plan = new_plan(use_threads);
    let last = declaration.add_to_plan(&plan)?;
    Declaration::new(
        "consuming_sink",
        ConsumingSinkNodeOptions::new(Arc::new(DiscardConsumer)),
    )
    .with_input(last)
    .add_to_plan(&plan)?;

    plan.start_producing()?;
    plan.finished().wait()
}
