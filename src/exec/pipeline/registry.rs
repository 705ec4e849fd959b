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
//! Name-keyed node factory registry.
//!
//! Responsibilities:
//! - Maps kind names (`"source"`, `"filter"`, `"sink"`, ...) to factories that
//!   validate options and add the concrete node to a plan.
//! - Provides the process-wide default registry with every built-in kind.
//!
//! Key exported interfaces:
//! - Types: `ExecFactoryRegistry`, `ExecFactory`.
//! - Functions: `default_registry`, `make_exec_node`, `validate_input_count`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::exec::error::{ExecError, ExecResult};
use crate::exec::operators::{
    aggregate, consuming_sink, filter, hashjoin, order_by_sink, project, sink, source, union,
};
use crate::exec::pipeline::declaration::ExecNodeOptions;
use crate::exec::pipeline::node::ExecNode;
use crate::exec::pipeline::plan::ExecPlan;

pub type ExecFactory = Arc<
    dyn Fn(
            &Arc<ExecPlan>,
            Vec<Arc<ExecNode>>,
            &dyn ExecNodeOptions,
            Option<String>,
        ) -> ExecResult<Arc<ExecNode>>
        + Send
        + Sync,
>;

type FactoryFn = fn(
    &Arc<ExecPlan>,
    Vec<Arc<ExecNode>>,
    &dyn ExecNodeOptions,
    Option<String>,
) -> ExecResult<Arc<ExecNode>>;

const BUILTIN_KINDS: &[(&str, FactoryFn)] = &[
    ("source", source::make_source_node),
    ("table_source", source::make_table_source_node),
    ("record_batch_source", source::make_record_batch_source_node),
    ("exec_batch_source", source::make_exec_batch_source_node),
    ("array_vector_source", source::make_array_vector_source_node),
    (
        "record_batch_reader_source",
        source::make_record_batch_reader_source_node,
    ),
    ("filter", filter::make_filter_node),
    ("project", project::make_project_node),
    ("aggregate", aggregate::make_aggregate_node),
    ("hashjoin", hashjoin::make_hashjoin_node),
    ("union", union::make_union_node),
    ("sink", sink::make_sink_node),
    ("order_by_sink", order_by_sink::make_order_by_sink_node),
    ("select_k_sink", order_by_sink::make_select_k_sink_node),
    ("consuming_sink", consuming_sink::make_consuming_sink_node),
    ("table_sink", consuming_sink::make_table_sink_node),
];

#[derive(Default)]
pub struct ExecFactoryRegistry {
    factories: RwLock<HashMap<String, ExecFactory>>,
}

impl fmt::Debug for ExecFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecFactoryRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ExecFactoryRegistry {
    /// Registry without any kinds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_kinds() -> Self {
        let registry = Self::new();
        {
            let mut factories = registry.factories.write().expect("registry lock");
            for (name, factory) in BUILTIN_KINDS {
                let factory: ExecFactory = Arc::new(*factory);
                factories.insert((*name).to_string(), factory);
            }
        }
        registry
    }

    pub fn register(&self, name: impl Into<String>, factory: ExecFactory) -> ExecResult<()> {
        let name = name.into();
        let mut factories = self.factories.write().expect("registry lock");
        if factories.contains_key(&name) {
            return Err(ExecError::invalid_graph(format!(
                "exec node kind {} is already registered",
                name
            )));
        }
        factories.insert(name, factory);
        Ok(())
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, factory: F) -> ExecResult<()>
    where
        F: Fn(
                &Arc<ExecPlan>,
                Vec<Arc<ExecNode>>,
                &dyn ExecNodeOptions,
                Option<String>,
            ) -> ExecResult<Arc<ExecNode>>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(factory))
    }

    pub fn get(&self, name: &str) -> ExecResult<ExecFactory> {
        self.factories
            .read()
            .expect("registry lock")
            .get(name)
            .cloned()
            .ok_or_else(|| ExecError::invalid_graph(format!("unknown exec node kind {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .expect("registry lock")
            .contains_key(name)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn make_exec_node(
        &self,
        kind: &str,
        plan: &Arc<ExecPlan>,
        inputs: Vec<Arc<ExecNode>>,
        options: &dyn ExecNodeOptions,
        label: Option<String>,
    ) -> ExecResult<Arc<ExecNode>> {
        let factory = self.get(kind)?;
        factory(plan, inputs, options, label)
    }
}

static DEFAULT_REGISTRY: OnceLock<Arc<ExecFactoryRegistry>> = OnceLock::new();

/// Process-wide registry holding every built-in kind.
pub fn default_registry() -> Arc<ExecFactoryRegistry> {
    Arc::clone(DEFAULT_REGISTRY.get_or_init(|| Arc::new(ExecFactoryRegistry::with_builtin_kinds())))
}

/// Builds a node of `kind` through the plan's registry.
pub fn make_exec_node(
    kind: &str,
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    plan.registry()
        .make_exec_node(kind, plan, inputs, options, label)
}

pub fn validate_input_count(
    kind: &str,
    inputs: &[Arc<ExecNode>],
    expected: usize,
) -> ExecResult<()> {
    if inputs.len() != expected {
        return Err(ExecError::invalid_graph(format!(
            "{} requires {} inputs but got {}",
            kind,
            expected,
            inputs.len()
        )));
    }
    Ok(())
}
