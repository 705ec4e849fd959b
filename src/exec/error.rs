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
//! Execution error taxonomy.

use arrow::error::ArrowError;
use thiserror::Error;

/// Errors raised while building or running an exec plan.
///
/// Errors are cloned when one terminal failure has to reach several
/// observers (downstream nodes, node completion, plan completion).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Structural problem with the graph or its lifecycle.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A node's options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// A node's processing logic failed.
    #[error("Operator failure: {0}")]
    OperatorFailure(String),

    /// The plan or sink is already past its terminal state.
    #[error("Already finished: {0}")]
    AlreadyFinished(String),
}

impl ExecError {
    pub fn invalid_graph(msg: impl Into<String>) -> Self {
        Self::InvalidGraph(msg.into())
    }

    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Self::InvalidOptions(msg.into())
    }

    pub fn operator(msg: impl Into<String>) -> Self {
        Self::OperatorFailure(msg.into())
    }

    pub fn already_finished(msg: impl Into<String>) -> Self {
        Self::AlreadyFinished(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidGraph(m)
            | Self::InvalidOptions(m)
            | Self::OperatorFailure(m)
            | Self::AlreadyFinished(m) => m,
        }
    }
}

impl From<ArrowError> for ExecError {
    fn from(err: ArrowError) -> Self {
        Self::OperatorFailure(err.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
