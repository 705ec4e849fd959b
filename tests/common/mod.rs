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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tempfile::TempDir;

use arrow::array::{Array, ArrayRef, BooleanArray, Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::util::display::array_value_to_string;

use novaflow::exec::chunk::Chunk;
use novaflow::exec::error::{ExecError, ExecResult};
use novaflow::exec::operators::SinkNodeConsumer;
use novaflow::exec::pipeline::{
    BackpressureControl, Completion, ExecNode, ExecPlan, NodeOperator, PlanHandle,
};
use novaflow::novaflow_config;
use novaflow::novaflow_logging;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("novaflow.toml");

        let config_content = r#"
log_level = "debug"

[runtime]
exec_threads = 4
use_threads = true
sink_pause_if_above_bytes = 1073741824
sink_resume_if_below_bytes = 268435456
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novaflow_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static novaflow_config::NovaFlowConfig> {
        novaflow_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Schema `{i32: int32, bool: boolean}`.
pub fn basic_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("i32", DataType::Int32, true),
        Field::new("bool", DataType::Boolean, true),
    ]))
}

/// Two batches: `[[null, true], [4, false]]` and `[[5, null], [6, false], [7, false]]`.
pub fn basic_batches() -> Vec<Chunk> {
    vec![
        basic_chunk(vec![None, Some(4)], vec![Some(true), Some(false)]),
        basic_chunk(
            vec![Some(5), Some(6), Some(7)],
            vec![None, Some(false), Some(false)],
        ),
    ]
}

pub fn basic_chunk(i32s: Vec<Option<i32>>, bools: Vec<Option<bool>>) -> Chunk {
    Chunk::try_from_arrays(
        basic_schema(),
        vec![
            Arc::new(Int32Array::from(i32s)),
            Arc::new(BooleanArray::from(bools)),
        ],
    )
    .expect("basic chunk")
}

/// Schema `{i32: int32, str: utf8}`.
pub fn groupable_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("i32", DataType::Int32, true),
        Field::new("str", DataType::Utf8, true),
    ]))
}

pub fn groupable_chunk(rows: &[(i32, &str)]) -> Chunk {
    let i32s: Vec<i32> = rows.iter().map(|(v, _)| *v).collect();
    let strs: Vec<&str> = rows.iter().map(|(_, s)| *s).collect();
    Chunk::try_from_arrays(
        groupable_schema(),
        vec![
            Arc::new(Int32Array::from(i32s)),
            Arc::new(StringArray::from(strs)),
        ],
    )
    .expect("groupable chunk")
}

/// Three batches over the keys `alfa`, `beta`, `gama`.
///
/// Sums per key: alfa=8, beta=10, gama=4. Non-negative sums: alfa=18, beta=10, gama=5.
pub fn groupable_batches() -> Vec<Chunk> {
    vec![
        groupable_chunk(&[(12, "alfa"), (7, "beta"), (3, "alfa")]),
        groupable_chunk(&[(-2, "alfa"), (-1, "gama"), (3, "alfa")]),
        groupable_chunk(&[(5, "gama"), (3, "beta"), (-8, "alfa")]),
    ]
}

pub fn single_table(chunks: &[Chunk]) -> RecordBatch {
    novaflow::exec::chunk::concat_chunks(&chunks[0].schema(), chunks).expect("concat chunks")
}

fn cell(column: &ArrayRef, row: usize) -> String {
    if column.is_null(row) {
        return "null".to_string();
    }
    array_value_to_string(column.as_ref(), row).expect("format cell")
}

/// Rows of a batch rendered as strings, in batch order.
pub fn batch_rows(batch: &RecordBatch) -> Vec<Vec<String>> {
    (0..batch.num_rows())
        .map(|row| batch.columns().iter().map(|c| cell(c, row)).collect())
        .collect()
}

/// Rows of all chunks rendered as strings, in arrival order.
pub fn chunk_rows(chunks: &[Chunk]) -> Vec<Vec<String>> {
    chunks.iter().flat_map(|c| batch_rows(&c.batch)).collect()
}

/// Like `chunk_rows`, sorted so parallel delivery order does not matter.
pub fn sorted_rows(chunks: &[Chunk]) -> Vec<Vec<String>> {
    let mut rows = chunk_rows(chunks);
    rows.sort();
    rows
}

pub fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

pub type Tracker = Arc<Mutex<Vec<String>>>;

pub fn tracker() -> Tracker {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn tracked(tracker: &Tracker) -> Vec<String> {
    tracker.lock().expect("tracker lock").clone()
}

/// Node that only records lifecycle calls; it never emits and never finishes
/// on its own.
pub struct DummyNode {
    schema: SchemaRef,
    started: Option<Tracker>,
    stopped: Option<Tracker>,
    start_error: Option<ExecError>,
}

impl DummyNode {
    pub fn new(started: Option<Tracker>, stopped: Option<Tracker>) -> Self {
        Self {
            schema: basic_schema(),
            started,
            stopped,
            start_error: None,
        }
    }

    pub fn failing_start(mut self, error: ExecError) -> Self {
        self.start_error = Some(error);
        self
    }
}

impl NodeOperator for DummyNode {
    fn kind_name(&self) -> &'static str {
        "DummyNode"
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn start_producing(&self, node: &Arc<ExecNode>) -> ExecResult<()> {
        if let Some(started) = &self.started {
            started
                .lock()
                .expect("tracker lock")
                .push(node.label().to_string());
        }
        match &self.start_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn stop_producing(&self, node: &Arc<ExecNode>) {
        if let Some(stopped) = &self.stopped {
            stopped
                .lock()
                .expect("tracker lock")
                .push(node.label().to_string());
        }
        node.mark_finished(Ok(()));
    }

    fn input_received(&self, _node: &Arc<ExecNode>, _input_index: usize, _chunk: Chunk) {}

    fn input_finished(&self, _node: &Arc<ExecNode>, _input_index: usize, _total_batches: usize) {}
}

pub fn add_dummy(
    plan: &Arc<ExecPlan>,
    label: &str,
    inputs: Vec<Arc<ExecNode>>,
    num_outputs: usize,
    dummy: DummyNode,
) -> Arc<ExecNode> {
    plan.add_node(Some(label.to_string()), inputs, num_outputs, Box::new(dummy))
        .expect("add dummy node")
}

/// Consumer whose `finish` completion resolves only when the test releases it.
///
/// Counts `consume` calls that start after `finish` was called.
pub struct GatedConsumer {
    consume_delay: Duration,
    finish: Completion<()>,
    finish_called: AtomicBool,
    consumed: AtomicUsize,
    consumed_after_finish: AtomicUsize,
}

impl GatedConsumer {
    pub fn new(consume_delay: Duration) -> Self {
        Self {
            consume_delay,
            finish: Completion::new(),
            finish_called: AtomicBool::new(false),
            consumed: AtomicUsize::new(0),
            consumed_after_finish: AtomicUsize::new(0),
        }
    }

    pub fn release(&self, result: ExecResult<()>) {
        self.finish.mark_finished(result);
    }

    pub fn finish_called(&self) -> bool {
        self.finish_called.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn consumed_after_finish(&self) -> usize {
        self.consumed_after_finish.load(Ordering::SeqCst)
    }
}

impl SinkNodeConsumer for GatedConsumer {
    fn init(
        &self,
        _schema: &SchemaRef,
        _backpressure: Arc<dyn BackpressureControl>,
        _plan: &PlanHandle,
    ) -> ExecResult<()> {
        Ok(())
    }

    fn consume(&self, _chunk: Chunk) -> ExecResult<()> {
        if self.finish_called() {
            self.consumed_after_finish.fetch_add(1, Ordering::SeqCst);
        }
        if !self.consume_delay.is_zero() {
            std::thread::sleep(self.consume_delay);
        }
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&self) -> Completion<()> {
        self.finish_called.store(true, Ordering::SeqCst);
        self.finish.clone()
    }
}

/// Generator that answers every batch with `Poll::Pending` first and wakes
/// itself from another thread after `delay`.
pub struct DelayedStream {
    items: VecDeque<Chunk>,
    delay: Duration,
    ready: Arc<AtomicBool>,
    waiting: bool,
}

impl DelayedStream {
    pub fn new(items: Vec<Chunk>, delay: Duration) -> Self {
        Self {
            items: items.into(),
            delay,
            ready: Arc::new(AtomicBool::new(false)),
            waiting: false,
        }
    }
}

impl Stream for DelayedStream {
    type Item = ExecResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.items.is_empty() {
            return Poll::Ready(None);
        }
        if !this.waiting {
            this.waiting = true;
            this.ready.store(false, Ordering::SeqCst);
            let ready = Arc::clone(&this.ready);
            let waker = cx.waker().clone();
            let delay = this.delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                ready.store(true, Ordering::SeqCst);
                waker.wake();
            });
            return Poll::Pending;
        }
        if !this.ready.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        this.waiting = false;
        Poll::Ready(this.items.pop_front().map(Ok))
    }
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
}
