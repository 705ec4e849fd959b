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
//! Execution mode shared by every node of one plan.
//!
//! A serial context runs every task inline on the calling thread. A parallel
//! context hands tasks to a shared thread pool, sized from
//! `runtime.exec_threads`.

use std::fmt;
use std::sync::{Arc, OnceLock};

use threadpool::ThreadPool;

use crate::common::config::{exec_threads, use_threads};
use crate::novaflow_logging::debug;

static GLOBAL_EXEC_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

fn global_exec_pool() -> Arc<ThreadPool> {
    Arc::clone(GLOBAL_EXEC_POOL.get_or_init(|| {
        let threads = exec_threads().max(1);
        debug!("creating exec thread pool: threads={}", threads);
        Arc::new(ThreadPool::with_name("novaflow_exec".to_string(), threads))
    }))
}

/// Execution mode and executor handle for one plan.
#[derive(Clone, Default)]
pub struct ExecContext {
    executor: Option<Arc<ThreadPool>>,
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("use_threads", &self.use_threads())
            .finish()
    }
}

impl ExecContext {
    pub fn new(use_threads: bool) -> Self {
        if use_threads {
            Self::parallel()
        } else {
            Self::serial()
        }
    }

    pub fn serial() -> Self {
        Self { executor: None }
    }

    /// Parallel context backed by the process-wide exec pool.
    pub fn parallel() -> Self {
        Self {
            executor: Some(global_exec_pool()),
        }
    }

    pub fn with_pool(pool: ThreadPool) -> Self {
        Self {
            executor: Some(Arc::new(pool)),
        }
    }

    /// Mode chosen by `runtime.use_threads`.
    pub fn from_config() -> Self {
        Self::new(use_threads())
    }

    pub fn use_threads(&self) -> bool {
        self.executor.is_some()
    }

    /// Runs `task` on the pool, or inline for a serial context.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.executor.as_ref() {
            Some(pool) => pool.execute(task),
            None => task(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn serial_context_runs_inline() {
        let ctx = ExecContext::serial();
        assert!(!ctx.use_threads());
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        ctx.spawn(move || {
            tx.send(std::thread::current().id()).expect("send thread id");
        });
        assert_eq!(rx.try_recv().expect("task ran inline"), caller);
    }

    #[test]
    fn pool_context_runs_on_worker() {
        let ctx = ExecContext::with_pool(ThreadPool::new(2));
        assert!(ctx.use_threads());
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        ctx.spawn(move || {
            tx.send(std::thread::current().id()).expect("send thread id");
        });
        let worker = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task ran on pool");
        assert_ne!(worker, caller);
    }
}
