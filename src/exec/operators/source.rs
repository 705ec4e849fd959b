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
//! Source nodes driven by an async batch stream.
//!
//! Responsibilities:
//! - Polls a `BatchStream` and emits each batch, split to `MAX_BATCH_SIZE`
//!   rows, to the node's outputs.
//! - Honors pause/resume counters from downstream backpressure and stops
//!   cooperatively.
//! - Adapts tables, batch iterators and record batch readers to streams.
//!
//! Key exported interfaces:
//! - Types: `BatchStream`, `SourceNodeOptions`, `TableSourceNodeOptions`,
//!   `SchemaSourceNodeOptions`, `RecordBatchReaderSourceNodeOptions`,
//!   `PushProducer`.
//! - Functions: `push_generator`, `make_*_source_node` factories.
//!
//! A pending stream resumes when its waker fires: inline on the waking thread
//! for a serial plan, on the exec pool for a parallel one. Only one thread
//! polls a stream at a time; wakeups that arrive while polling re-run the
//! poll loop instead of polling concurrently.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use arrow::array::{ArrayRef, RecordBatch, RecordBatchReader};
use arrow::datatypes::SchemaRef;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::task::{ArcWake, waker_ref};

use crate::exec::chunk::{Chunk, MAX_BATCH_SIZE};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::{ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;
use crate::novaflow_logging::{debug, warn};

pub type BatchStream = BoxStream<'static, ExecResult<Chunk>>;

pub struct SourceNodeOptions {
    pub schema: SchemaRef,
    generator: Mutex<Option<BatchStream>>,
}

impl fmt::Debug for SourceNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceNodeOptions")
            .field("schema", &self.schema)
            .finish()
    }
}

impl SourceNodeOptions {
    pub fn new(schema: SchemaRef, generator: BatchStream) -> Self {
        Self {
            schema,
            generator: Mutex::new(Some(generator)),
        }
    }

    pub fn from_stream<S>(schema: SchemaRef, generator: S) -> Self
    where
        S: Stream<Item = ExecResult<Chunk>> + Send + 'static,
    {
        Self::new(schema, generator.boxed())
    }

    /// The generator can drive exactly one node.
    fn take_generator(&self) -> ExecResult<BatchStream> {
        self.generator
            .lock()
            .expect("source options lock")
            .take()
            .ok_or_else(|| {
                ExecError::invalid_options("SourceNode generator was already used by another node")
            })
    }
}

pub struct TableSourceNodeOptions {
    pub table: Option<RecordBatch>,
    pub batch_size: i64,
}

impl TableSourceNodeOptions {
    pub fn new(table: Option<RecordBatch>, batch_size: i64) -> Self {
        Self { table, batch_size }
    }
}

pub type IteratorMaker<T> = Arc<dyn Fn() -> Box<dyn Iterator<Item = T> + Send> + Send + Sync>;

/// Options of the schema plus iterator sources.
pub struct SchemaSourceNodeOptions<T> {
    pub schema: Option<SchemaRef>,
    pub it_maker: Option<IteratorMaker<T>>,
}

impl<T> SchemaSourceNodeOptions<T> {
    pub fn new<F, I>(schema: Option<SchemaRef>, it_maker: F) -> Self
    where
        T: 'static,
        F: Fn() -> I + Send + Sync + 'static,
        I: Iterator<Item = T> + Send + 'static,
    {
        Self {
            schema,
            it_maker: Some(Arc::new(move || {
                Box::new(it_maker()) as Box<dyn Iterator<Item = T> + Send>
            })),
        }
    }

    /// Options from a fixed set of items.
    pub fn from_items(schema: Option<SchemaRef>, items: Vec<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::new(schema, move || items.clone().into_iter())
    }
}

pub type RecordBatchSourceNodeOptions = SchemaSourceNodeOptions<RecordBatch>;
pub type ExecBatchSourceNodeOptions = SchemaSourceNodeOptions<Chunk>;
pub type ArrayVectorSourceNodeOptions = SchemaSourceNodeOptions<Vec<ArrayRef>>;

pub struct RecordBatchReaderSourceNodeOptions {
    reader: Mutex<Option<Box<dyn RecordBatchReader + Send>>>,
}

impl RecordBatchReaderSourceNodeOptions {
    pub fn new(reader: Option<Box<dyn RecordBatchReader + Send>>) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }
}

/// Sending half of a channel-backed generator.
#[derive(Clone)]
pub struct PushProducer {
    tx: mpsc::UnboundedSender<ExecResult<Chunk>>,
}

impl PushProducer {
    /// Returns false once the consuming stream is gone.
    pub fn push(&self, chunk: Chunk) -> bool {
        self.tx.unbounded_send(Ok(chunk)).is_ok()
    }

    pub fn push_error(&self, error: ExecError) -> bool {
        self.tx.unbounded_send(Err(error)).is_ok()
    }

    /// Ends the stream for every clone; later pushes fail.
    pub fn close(&self) {
        self.tx.close_channel();
    }
}

pub fn push_generator() -> (PushProducer, BatchStream) {
    let (tx, rx) = mpsc::unbounded();
    (PushProducer { tx }, rx.boxed())
}

#[derive(Debug, Default)]
struct DriverState {
    batches: usize,
    paused: bool,
    last_counter: u64,
    stop_requested: bool,
    finished: bool,
}

struct SourceDriver {
    node: Weak<ExecNode>,
    stream: Mutex<Option<BatchStream>>,
    state: Mutex<DriverState>,
    pending: AtomicUsize,
}

impl ArcWake for SourceDriver {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

impl SourceDriver {
    fn new(node: Weak<ExecNode>, stream: BatchStream) -> Arc<Self> {
        Arc::new(Self {
            node,
            stream: Mutex::new(Some(stream)),
            state: Mutex::new(DriverState::default()),
            pending: AtomicUsize::new(0),
        })
    }

    fn schedule(self: &Arc<Self>) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let ctx = node.exec_context();
        if ctx.use_threads() {
            let driver = Arc::clone(self);
            ctx.spawn(move || driver.drive());
        } else {
            self.drive();
        }
    }

    fn drive(self: &Arc<Self>) {
        if self.pending.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            self.poll_until_blocked();
            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn poll_until_blocked(self: &Arc<Self>) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        loop {
            {
                let st = self.state.lock().expect("source state lock");
                if st.finished {
                    return;
                }
                if st.stop_requested {
                    drop(st);
                    self.finish(&node, Ok(()));
                    return;
                }
                if st.paused {
                    return;
                }
            }
            let polled = {
                let mut guard = self.stream.lock().expect("source stream lock");
                let Some(stream) = guard.as_mut() else {
                    return;
                };
                let waker = waker_ref(self);
                let mut cx = Context::from_waker(&waker);
                stream.poll_next_unpin(&mut cx)
            };
            match polled {
                Poll::Pending => return,
                Poll::Ready(Some(Ok(chunk))) => self.deliver(&node, chunk),
                Poll::Ready(Some(Err(err))) => {
                    self.finish(&node, Err(err));
                    return;
                }
                Poll::Ready(None) => {
                    self.finish(&node, Ok(()));
                    return;
                }
            }
        }
    }

    fn deliver(self: &Arc<Self>, node: &Arc<ExecNode>, chunk: Chunk) {
        let ctx = node.exec_context();
        for piece in chunk.split(MAX_BATCH_SIZE) {
            self.state.lock().expect("source state lock").batches += 1;
            if ctx.use_threads() {
                let node = Arc::clone(node);
                let driver = Arc::clone(self);
                ctx.spawn(move || {
                    // Batches still queued on the pool are dropped after a stop.
                    if !driver.stop_requested() {
                        node.emit(piece);
                    }
                });
            } else {
                node.emit(piece);
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.state.lock().expect("source state lock").stop_requested
    }

    fn finish(&self, node: &Arc<ExecNode>, result: ExecResult<()>) {
        let total = {
            let mut st = self.state.lock().expect("source state lock");
            if st.finished {
                return;
            }
            st.finished = true;
            st.batches
        };
        self.stream.lock().expect("source stream lock").take();
        match result {
            Ok(()) => {
                debug!("source {} finished: batches={}", node.label(), total);
                node.emit_finished(total);
                node.mark_finished(Ok(()));
            }
            Err(err) => {
                warn!("source {} failed: {}", node.label(), err);
                node.emit_error(err.clone());
                node.mark_finished(Err(err));
            }
        }
    }

    fn pause(&self, counter: u64) {
        let mut st = self.state.lock().expect("source state lock");
        if counter > st.last_counter {
            st.last_counter = counter;
            st.paused = true;
        }
    }

    fn resume(self: &Arc<Self>, counter: u64) {
        let resumed = {
            let mut st = self.state.lock().expect("source state lock");
            if counter > st.last_counter {
                st.last_counter = counter;
                st.paused = false;
                true
            } else {
                false
            }
        };
        if resumed {
            self.schedule();
        }
    }

    fn stop(self: &Arc<Self>) {
        self.state.lock().expect("source state lock").stop_requested = true;
        self.schedule();
    }

    fn is_paused(&self) -> bool {
        self.state.lock().expect("source state lock").paused
    }
}

struct SourceOperator {
    kind: &'static str,
    schema: SchemaRef,
    driver: Arc<SourceDriver>,
}

impl NodeOperator for SourceOperator {
    fn kind_name(&self) -> &'static str {
        self.kind
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        self.driver.schedule();
        Ok(())
    }

    fn stop_producing(&self, _node: &Arc<ExecNode>) {
        self.driver.stop();
    }

    fn input_received(&self, node: &Arc<ExecNode>, _input_index: usize, _chunk: Chunk) {
        warn!("source {} ignored an input batch", node.label());
    }

    fn input_finished(&self, _node: &Arc<ExecNode>, _input_index: usize, _total_batches: usize) {}

    fn pause_producing(&self, node: &Arc<ExecNode>, counter: u64) {
        self.driver.pause(counter);
        debug!(
            "source {} pause: counter={} paused={}",
            node.label(),
            counter,
            self.driver.is_paused()
        );
    }

    fn resume_producing(&self, node: &Arc<ExecNode>, counter: u64) {
        debug!("source {} resume: counter={}", node.label(), counter);
        self.driver.resume(counter);
    }
}

/// Adds a stream-driven source node of the given kind.
pub fn add_source_node(
    plan: &Arc<ExecPlan>,
    kind: &'static str,
    label: Option<String>,
    schema: SchemaRef,
    generator: BatchStream,
) -> ExecResult<Arc<ExecNode>> {
    plan.add_node_with(label, Vec::new(), 1, move |node| {
        Box::new(SourceOperator {
            kind,
            schema,
            driver: SourceDriver::new(node.clone(), generator),
        })
    })
}

pub fn make_source_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count("SourceNode", &inputs, 0)?;
    let options = options_as::<SourceNodeOptions>("SourceNode", options)?;
    let generator = options.take_generator()?;
    add_source_node(
        plan,
        "SourceNode",
        label,
        Arc::clone(&options.schema),
        generator,
    )
}

pub fn make_table_source_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count("TableSourceNode", &inputs, 0)?;
    let options = options_as::<TableSourceNodeOptions>("TableSourceNode", options)?;
    let Some(table) = options.table.as_ref() else {
        return Err(ExecError::invalid_options(
            "TableSourceNode requires table which is not null",
        ));
    };
    if options.batch_size <= 0 {
        return Err(ExecError::invalid_options(format!(
            "TableSourceNode node requires, batch_size > 0 , but got {}",
            options.batch_size
        )));
    }
    let chunks = Chunk::new(table.clone()).split(options.batch_size as usize);
    add_source_node(
        plan,
        "TableSourceNode",
        label,
        table.schema(),
        stream::iter(chunks.into_iter().map(Ok::<Chunk, ExecError>)).boxed(),
    )
}

fn schema_source_parts<T>(
    kind: &str,
    inputs: &[Arc<ExecNode>],
    options: &SchemaSourceNodeOptions<T>,
) -> ExecResult<(SchemaRef, Box<dyn Iterator<Item = T> + Send>)> {
    validate_input_count(kind, inputs, 0)?;
    let Some(schema) = options.schema.as_ref() else {
        return Err(ExecError::invalid_options(format!(
            "{} requires schema which is not null",
            kind
        )));
    };
    let Some(it_maker) = options.it_maker.as_ref() else {
        return Err(ExecError::invalid_options(format!(
            "{} requires it_maker which is not null",
            kind
        )));
    };
    Ok((Arc::clone(schema), it_maker()))
}

pub fn make_record_batch_source_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    const KIND: &str = "RecordBatchSourceNode";
    let options = options_as::<RecordBatchSourceNodeOptions>(KIND, options)?;
    let (schema, it) = schema_source_parts(KIND, &inputs, options)?;
    let generator = stream::iter(it.map(|batch| Ok::<Chunk, ExecError>(Chunk::new(batch)))).boxed();
    add_source_node(plan, KIND, label, schema, generator)
}

pub fn make_exec_batch_source_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    const KIND: &str = "ExecBatchSourceNode";
    let options = options_as::<ExecBatchSourceNodeOptions>(KIND, options)?;
    let (schema, it) = schema_source_parts(KIND, &inputs, options)?;
    let generator = stream::iter(it.map(Ok::<Chunk, ExecError>)).boxed();
    add_source_node(plan, KIND, label, schema, generator)
}

pub fn make_array_vector_source_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    const KIND: &str = "ArrayVectorSourceNode";
    let options = options_as::<ArrayVectorSourceNodeOptions>(KIND, options)?;
    let (schema, it) = schema_source_parts(KIND, &inputs, options)?;
    let batch_schema = Arc::clone(&schema);
    let generator = stream::iter(
        it.map(move |columns| Chunk::try_from_arrays(Arc::clone(&batch_schema), columns)),
    )
    .boxed();
    add_source_node(plan, KIND, label, schema, generator)
}

pub fn make_record_batch_reader_source_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    const KIND: &str = "RecordBatchReaderSourceNode";
    validate_input_count(KIND, &inputs, 0)?;
    let options = options_as::<RecordBatchReaderSourceNodeOptions>(KIND, options)?;
    let Some(reader) = options.reader.lock().expect("reader options lock").take() else {
        return Err(ExecError::invalid_options(format!(
            "{} requires reader which is not null",
            KIND
        )));
    };
    let schema = reader.schema();
    let generator = stream::iter(reader.map(|batch| -> ExecResult<Chunk> {
        Ok(Chunk::new(batch?))
    }))
    .boxed();
    add_source_node(plan, KIND, label, schema, generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use futures::executor::block_on;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)]))
    }

    fn chunk(values: Vec<i32>) -> Chunk {
        Chunk::try_from_arrays(schema(), vec![Arc::new(Int32Array::from(values))])
            .expect("chunk")
    }

    #[test]
    fn push_generator_yields_pushed_batches_until_closed() {
        let (producer, mut generator) = push_generator();
        assert!(producer.push(chunk(vec![1, 2])));
        assert!(producer.push_error(ExecError::operator("boom")));
        producer.close();
        let first = block_on(generator.next()).expect("first item").expect("ok batch");
        assert_eq!(first.len(), 2);
        let second = block_on(generator.next()).expect("second item");
        assert_eq!(second, Err(ExecError::operator("boom")));
        assert!(block_on(generator.next()).is_none());
    }

    #[test]
    fn generator_can_only_be_taken_once() {
        let options = SourceNodeOptions::new(schema(), stream::empty().boxed());
        assert!(options.take_generator().is_ok());
        let err = options.take_generator().err().expect("second take");
        assert!(matches!(err, ExecError::InvalidOptions(_)));
    }
}
