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
//! Projection node: evaluates a list of expressions per batch.
//!
//! Output columns are named by `names` when given, otherwise by the
//! expression text (`multiply(i32, 2)`).

use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::compute::cast;
use arrow::datatypes::{Field, Schema, SchemaRef};

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::expr::Expr;
use crate::exec::operators::map_node::{ChunkMapper, add_map_node};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::ExecNode;
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;

#[derive(Clone, Debug)]
pub struct ProjectNodeOptions {
    pub expressions: Vec<Expr>,
    pub names: Option<Vec<String>>,
}

impl ProjectNodeOptions {
    pub fn new(expressions: Vec<Expr>) -> Self {
        Self {
            expressions,
            names: None,
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }
}

struct ProjectMapper {
    schema: SchemaRef,
    expressions: Vec<Expr>,
}

impl ChunkMapper for ProjectMapper {
    fn kind_name(&self) -> &'static str {
        "ProjectNode"
    }

    fn describe(&self) -> String {
        let exprs: Vec<String> = self.expressions.iter().map(|e| e.to_string()).collect();
        format!("projection=[{}]", exprs.join(", "))
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn map(&self, chunk: Chunk) -> ExecResult<Chunk> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.expressions.len());
        for (expr, field) in self.expressions.iter().zip(self.schema.fields()) {
            let array = expr.evaluate(&chunk)?;
            let array = if array.data_type() == field.data_type() {
                array
            } else {
                cast(&array, field.data_type())?
            };
            columns.push(array);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(chunk.len()));
        let batch = RecordBatch::try_new_with_options(Arc::clone(&self.schema), columns, &options)?;
        Ok(Chunk::new(batch))
    }
}

pub fn make_project_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count("ProjectNode", &inputs, 1)?;
    let options = options_as::<ProjectNodeOptions>("ProjectNode", options)?;
    let names: Vec<String> = match &options.names {
        Some(names) => {
            if names.len() != options.expressions.len() {
                return Err(ExecError::invalid_options(format!(
                    "ProjectNode got {} names for {} expressions",
                    names.len(),
                    options.expressions.len()
                )));
            }
            names.clone()
        }
        None => options.expressions.iter().map(|e| e.to_string()).collect(),
    };
    let input_schema = inputs[0].output_schema();
    let mut fields = Vec::with_capacity(names.len());
    for (expr, name) in options.expressions.iter().zip(names) {
        fields.push(Field::new(name, expr.data_type(&input_schema)?, true));
    }
    add_map_node(
        plan,
        inputs,
        label,
        ProjectMapper {
            schema: Arc::new(Schema::new(fields)),
            expressions: options.expressions.clone(),
        },
    )
}
