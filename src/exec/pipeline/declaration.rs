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
//! Declarative description of a node tree.
//!
//! A `Declaration` names a factory kind, carries its options and lists its
//! inputs, which are either nested declarations or nodes that already exist in
//! the target plan. `add_to_plan` builds inputs first (post-order) and stops at
//! the first failure; nodes added before the failure stay in the plan.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::node::ExecNode;
use crate::exec::pipeline::plan::ExecPlan;

/// Options value of one node kind; factories downcast it to their own type.
pub trait ExecNodeOptions: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> ExecNodeOptions for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Downcasts `options` to the type expected by `kind`.
pub fn options_as<'a, T: Any>(kind: &str, options: &'a dyn ExecNodeOptions) -> ExecResult<&'a T> {
    options.as_any().downcast_ref::<T>().ok_or_else(|| {
        ExecError::invalid_options(format!(
            "{} node expects options of type {}",
            kind,
            std::any::type_name::<T>()
        ))
    })
}

#[derive(Clone)]
pub enum DeclarationInput {
    Node(Arc<ExecNode>),
    Declaration(Declaration),
}

impl From<Declaration> for DeclarationInput {
    fn from(decl: Declaration) -> Self {
        DeclarationInput::Declaration(decl)
    }
}

impl From<Arc<ExecNode>> for DeclarationInput {
    fn from(node: Arc<ExecNode>) -> Self {
        DeclarationInput::Node(node)
    }
}

impl fmt::Debug for DeclarationInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclarationInput::Node(node) => write!(f, "Node({})", node.label()),
            DeclarationInput::Declaration(decl) => decl.fmt(f),
        }
    }
}

#[derive(Clone)]
pub struct Declaration {
    pub factory_name: String,
    pub options: Arc<dyn ExecNodeOptions>,
    pub inputs: Vec<DeclarationInput>,
    pub label: Option<String>,
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("factory_name", &self.factory_name)
            .field("label", &self.label)
            .field("inputs", &self.inputs)
            .finish()
    }
}

impl Declaration {
    pub fn new<O: ExecNodeOptions>(factory_name: impl Into<String>, options: O) -> Self {
        Self {
            factory_name: factory_name.into(),
            options: Arc::new(options),
            inputs: Vec::new(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<DeclarationInput>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<DeclarationInput>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Chains `decls` so each step takes the previous step as its last input.
    pub fn sequence(decls: Vec<Declaration>) -> ExecResult<Declaration> {
        let mut iter = decls.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| ExecError::invalid_graph("cannot sequence an empty declaration list"))?;
        Ok(iter.fold(first, |prev, mut next| {
            next.inputs.push(DeclarationInput::Declaration(prev));
            next
        }))
    }

    /// Builds this declaration and all nested inputs into `plan`.
    pub fn add_to_plan(&self, plan: &Arc<ExecPlan>) -> ExecResult<Arc<ExecNode>> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            match input {
                DeclarationInput::Node(node) => inputs.push(Arc::clone(node)),
                DeclarationInput::Declaration(decl) => inputs.push(decl.add_to_plan(plan)?),
            }
        }
        plan.registry().make_exec_node(
            &self.factory_name,
            plan,
            inputs,
            self.options.as_ref(),
            self.label.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Opts(u32);

    fn step(name: &str) -> Declaration {
        Declaration::new(name, Opts(1))
    }

    #[test]
    fn sequence_nests_previous_step_as_input() {
        let seq = Declaration::sequence(vec![step("a"), step("b"), step("c")]).expect("sequence");
        assert_eq!(seq.factory_name, "c");
        let DeclarationInput::Declaration(b) = &seq.inputs[0] else {
            panic!("expected nested declaration");
        };
        assert_eq!(b.factory_name, "b");
        let DeclarationInput::Declaration(a) = &b.inputs[0] else {
            panic!("expected nested declaration");
        };
        assert_eq!(a.factory_name, "a");
        assert!(a.inputs.is_empty());
    }

    #[test]
    fn sequence_of_nothing_is_rejected() {
        let err = Declaration::sequence(Vec::new()).expect_err("empty sequence");
        assert!(matches!(err, ExecError::InvalidGraph(_)));
    }

    #[test]
    fn options_downcast_reports_expected_type() {
        let decl = step("x");
        assert_eq!(options_as::<Opts>("x", decl.options.as_ref()), Ok(&Opts(1)));
        let err = options_as::<String>("x", decl.options.as_ref()).expect_err("wrong type");
        assert!(matches!(err, ExecError::InvalidOptions(_)));
    }
}
