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
//! Expression filter node for row-level predicate evaluation.
//!
//! Responsibilities:
//! - Evaluates a boolean predicate per batch and keeps rows where it is true;
//!   null predicate results drop the row.
//! - Emits exactly one output batch per input batch, possibly empty.

use std::sync::Arc;

use arrow::compute::filter_record_batch;
use arrow::datatypes::{DataType, SchemaRef};

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::expr::Expr;
use crate::exec::operators::map_node::{ChunkMapper, add_map_node};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::ExecNode;
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;

#[derive(Clone, Debug)]
pub struct FilterNodeOptions {
    pub filter_expression: Expr,
}

impl FilterNodeOptions {
    pub fn new(filter_expression: Expr) -> Self {
        Self { filter_expression }
    }
}

struct FilterMapper {
    schema: SchemaRef,
    predicate: Expr,
}

impl ChunkMapper for FilterMapper {
    fn kind_name(&self) -> &'static str {
        "FilterNode"
    }

    fn describe(&self) -> String {
        format!("filter={}", self.predicate)
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn map(&self, chunk: Chunk) -> ExecResult<Chunk> {
        let mask = self.predicate.evaluate_predicate(&chunk)?;
        let filtered = filter_record_batch(&chunk.batch, &mask)?;
        Ok(Chunk::new(filtered))
    }
}

pub fn make_filter_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count("FilterNode", &inputs, 1)?;
    let options = options_as::<FilterNodeOptions>("FilterNode", options)?;
    let schema = inputs[0].output_schema();
    let predicate_type = options.filter_expression.data_type(&schema)?;
    if !matches!(predicate_type, DataType::Boolean | DataType::Null) {
        return Err(ExecError::invalid_options(format!(
            "filter expression must evaluate to bool, but {} evaluates to {}",
            options.filter_expression, predicate_type
        )));
    }
    add_map_node(
        plan,
        inputs,
        label,
        FilterMapper {
            schema,
            predicate: options.filter_expression.clone(),
        },
    )
}
