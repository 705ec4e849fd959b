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
//! Built-in node kinds.
//!
//! Responsibilities:
//! - Sources that turn generators, tables, iterators and readers into batches.
//! - Transform nodes (filter, project, aggregate, hash join, union).
//! - Pull sinks, ordering sinks and consumer-driven push sinks.
//!
//! Every kind exposes an options type and a factory registered under its
//! kind name in `crate::exec::pipeline::registry`.

pub mod aggregate;
pub mod consuming_sink;
pub mod filter;
pub mod hashjoin;
mod map_node;
pub mod order_by_sink;
pub mod project;
pub mod sink;
pub mod source;
pub mod union;

pub use aggregate::{Aggregate, AggregateNodeOptions, CountMode};
pub use consuming_sink::{
    ConsumingSinkNodeOptions, SinkNodeConsumer, TableSinkNodeOptions, TableSlot,
};
pub use filter::FilterNodeOptions;
pub use hashjoin::{HashJoinNodeOptions, JoinType};
pub use order_by_sink::{
    NullPlacement, OrderBySinkNodeOptions, SelectKSinkNodeOptions, SortKey, SortOptions,
    SortOrder,
};
pub use project::ProjectNodeOptions;
pub use sink::{BatchReceiver, SinkNodeOptions};
pub use source::{
    ArrayVectorSourceNodeOptions, BatchStream, ExecBatchSourceNodeOptions, PushProducer,
    RecordBatchReaderSourceNodeOptions, RecordBatchSourceNodeOptions, SchemaSourceNodeOptions,
    SourceNodeOptions, TableSourceNodeOptions, push_generator,
};
pub use union::UnionNodeOptions;
