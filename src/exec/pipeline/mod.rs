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
//! Plan runtime: graph, lifecycle, completion signalling and backpressure.
//!
//! Responsibilities:
//! - `ExecPlan` owns the node graph and drives start and stop in dependency order.
//! - `ExecNode` wraps one kind-specific `NodeOperator` with lifecycle state.
//! - `Declaration` and the factory registry build graphs from kind names.
//! - Runners execute a declaration and collect its output.

pub mod backpressure;
pub mod completion;
pub mod context;
pub mod declaration;
pub mod node;
pub mod plan;
pub mod registry;
pub mod runner;

pub use backpressure::{
    BackpressureControl, BackpressureHandler, BackpressureMonitor, BackpressureOptions,
};
pub use completion::Completion;
pub use context::ExecContext;
pub use declaration::{Declaration, DeclarationInput, ExecNodeOptions};
pub use node::{ExecNode, NodeOperator};
pub use plan::{ExecPlan, PlanHandle};
pub use registry::{ExecFactory, ExecFactoryRegistry, default_registry, make_exec_node};
pub use runner::{
    ChunksWithSchema, declaration_to_chunks, declaration_to_status, declaration_to_table,
};
