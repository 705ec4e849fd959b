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
//! Hash-table primitives for join key indexing.
//!
//! Responsibilities:
//! - Encodes build-side key columns with the Arrow row format and indexes
//!   build rows by encoded key.
//! - Resolves probe rows to the list of matching build rows.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`.
//! - Functions: `row_has_null_key`.
//!
//! Keys compare with `=` semantics: a row with a null in any key column
//! never matches.

use arrow::array::{Array, ArrayRef};
use arrow::row::{RowConverter, Rows};
use hashbrown::HashMap;

use crate::exec::error::ExecResult;

/// Check whether the row has a null in any key column.
pub(crate) fn row_has_null_key(key_columns: &[ArrayRef], row: usize) -> bool {
    key_columns.iter().any(|column| column.is_null(row))
}

/// Build rows grouped by encoded key, in build order.
pub(crate) struct JoinHashTable {
    buckets: HashMap<Vec<u8>, Vec<u32>>,
    num_build_rows: usize,
}

impl JoinHashTable {
    pub(crate) fn build(converter: &RowConverter, key_columns: &[ArrayRef]) -> ExecResult<Self> {
        let rows = converter.convert_columns(key_columns)?;
        let mut buckets: HashMap<Vec<u8>, Vec<u32>> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            if row_has_null_key(key_columns, idx) {
                continue;
            }
            buckets
                .entry(row.as_ref().to_vec())
                .or_default()
                .push(idx as u32);
        }
        Ok(Self {
            buckets,
            num_build_rows: rows.num_rows(),
        })
    }

    pub(crate) fn num_build_rows(&self) -> usize {
        self.num_build_rows
    }

    pub(crate) fn num_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Matching build rows for probe row `idx` of `probe_rows`.
    pub(crate) fn probe<'a>(&'a self, probe_rows: &Rows, idx: usize) -> &'a [u32] {
        self.buckets
            .get(probe_rows.row(idx).as_ref())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
