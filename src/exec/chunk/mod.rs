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
use std::sync::Arc;

use arrow::array::{ArrayData, ArrayRef, RecordBatch};
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema, SchemaRef};
use hashbrown::HashSet;

use crate::exec::error::{ExecError, ExecResult};

/// Upper bound on the number of rows a single chunk may carry through a plan.
pub const MAX_BATCH_SIZE: usize = 1 << 15;

/// A chunk of data, consisting of multiple rows.
/// Wrapper around Arrow RecordBatch; clones share the column buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            batch: RecordBatch::new_empty(schema),
        }
    }

    pub fn try_from_arrays(schema: SchemaRef, columns: Vec<ArrayRef>) -> ExecResult<Self> {
        let batch = RecordBatch::try_new(schema, columns)?;
        Ok(Self { batch })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    /// Bytes this chunk accounts for in sink queues, see [`batch_buffer_bytes`].
    pub fn logical_bytes(&self) -> usize {
        batch_buffer_bytes(&self.batch)
    }

    /// Splits into zero-copy slices of at most `max_rows` rows each.
    /// An empty chunk is returned as-is so row-less batches still travel.
    pub fn split(&self, max_rows: usize) -> Vec<Chunk> {
        let max_rows = max_rows.max(1);
        let len = self.len();
        if len <= max_rows {
            return vec![self.clone()];
        }
        let mut out = Vec::with_capacity(len.div_ceil(max_rows));
        let mut offset = 0;
        while offset < len {
            let length = max_rows.min(len - offset);
            out.push(self.slice(offset, length));
            offset += length;
        }
        out
    }

    /// Returns the same columns under new field names.
    pub fn with_field_names(&self, names: &[String]) -> ExecResult<Chunk> {
        let schema = rename_schema(&self.schema(), names)?;
        let batch = RecordBatch::try_new(schema, self.batch.columns().to_vec())?;
        Ok(Chunk { batch })
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }
}

impl From<RecordBatch> for Chunk {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

pub fn rename_schema(schema: &SchemaRef, names: &[String]) -> ExecResult<SchemaRef> {
    if names.len() != schema.fields().len() {
        return Err(ExecError::invalid_options(format!(
            "names list of size {} does not match the number of columns ({})",
            names.len(),
            schema.fields().len()
        )));
    }
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .zip(names)
        .map(|(field, name)| field.as_ref().clone().with_name(name.clone()))
        .collect();
    Ok(Arc::new(Schema::new_with_metadata(
        fields,
        schema.metadata().clone(),
    )))
}

/// Concatenates chunks into one batch; an empty input gives an empty batch.
pub fn concat_chunks(schema: &SchemaRef, chunks: &[Chunk]) -> ExecResult<RecordBatch> {
    let batches = chunks.iter().map(|c| &c.batch);
    Ok(concat_batches(schema, batches)?)
}

/// Sums the distinct buffers reachable from `batch`, nested children and
/// validity bitmaps included.
///
/// A buffer referenced by several columns of the batch counts once. Nothing
/// is shared between calls, so two slices of one array each pay for the
/// whole buffer.
pub fn batch_buffer_bytes(batch: &RecordBatch) -> usize {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut pending: Vec<ArrayData> = batch.columns().iter().map(|c| c.to_data()).collect();
    let mut total = 0usize;
    while let Some(data) = pending.pop() {
        let validity = data.nulls().map(|n| n.buffer());
        for buffer in data.buffers().iter().chain(validity) {
            if seen.insert(buffer.as_ptr() as usize) {
                total = total.saturating_add(buffer.capacity().max(buffer.len()));
            }
        }
        pending.extend(data.child_data().iter().cloned());
    }
    total
}
