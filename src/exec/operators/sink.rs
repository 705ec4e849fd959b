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
//! Pull sink: a queue of output batches read through a `futures::Stream`.
//!
//! Responsibilities:
//! - Buffers batches arriving at the sink and hands them to a `BatchReceiver`.
//! - Feeds queued byte counts into the sink's `BackpressureMonitor`.
//! - Ends the stream once the announced number of batches has arrived, or
//!   yields the terminal error.
//!
//! Key exported interfaces:
//! - Types: `SinkNodeOptions`, `BatchReceiver`.
//!
//! The queue is owned by the sink node. A receiver only holds a weak reference,
//! so reading after the plan was dropped reports `AlreadyFinished`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use arrow::datatypes::SchemaRef;
use futures::executor::block_on;
use futures::stream::{Stream, StreamExt};

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::backpressure::{
    BackpressureMonitor, BackpressureOptions, UpstreamBackpressure,
};
use crate::exec::pipeline::declaration::{ExecNodeOptions, options_as};
use crate::exec::pipeline::node::{BatchCounter, ExecNode, NodeOperator};
use crate::exec::pipeline::plan::ExecPlan;
use crate::exec::pipeline::registry::validate_input_count;

#[derive(Default)]
struct QueueState {
    items: VecDeque<(Chunk, u64)>,
    end: Option<ExecResult<()>>,
    end_delivered: bool,
    wakers: Vec<Waker>,
}

pub(crate) struct SinkQueue {
    state: Mutex<QueueState>,
    monitor: Option<Arc<BackpressureMonitor>>,
}

impl SinkQueue {
    pub(crate) fn new(monitor: Option<Arc<BackpressureMonitor>>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            monitor,
        }
    }

    pub(crate) fn monitor(&self) -> Option<Arc<BackpressureMonitor>> {
        self.monitor.clone()
    }

    /// Returns false if the queue was already closed.
    pub(crate) fn push(&self, chunk: Chunk) -> bool {
        let bytes = chunk.logical_bytes() as u64;
        // Account before the batch becomes visible so a dequeue never
        // precedes its enqueue.
        if let Some(monitor) = &self.monitor {
            monitor.record_enqueued(bytes);
        }
        let wakers = {
            let mut st = self.state.lock().expect("sink queue lock");
            if st.end.is_some() {
                None
            } else {
                st.items.push_back((chunk, bytes));
                Some(std::mem::take(&mut st.wakers))
            }
        };
        match wakers {
            Some(wakers) => {
                wakers.into_iter().for_each(Waker::wake);
                true
            }
            None => {
                if let Some(monitor) = &self.monitor {
                    monitor.record_dequeued(bytes);
                }
                false
            }
        }
    }

    pub(crate) fn close(&self, result: ExecResult<()>) {
        let wakers = {
            let mut st = self.state.lock().expect("sink queue lock");
            if st.end.is_some() {
                return;
            }
            st.end = Some(result);
            std::mem::take(&mut st.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }

    fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<ExecResult<Chunk>>> {
        let mut st = self.state.lock().expect("sink queue lock");
        if let Some((chunk, bytes)) = st.items.pop_front() {
            drop(st);
            if let Some(monitor) = &self.monitor {
                monitor.record_dequeued(bytes);
            }
            return Poll::Ready(Some(Ok(chunk)));
        }
        if st.end_delivered {
            return Poll::Ready(Some(Err(ExecError::already_finished(
                "sink stream has already ended",
            ))));
        }
        match st.end.clone() {
            Some(Ok(())) => {
                st.end_delivered = true;
                Poll::Ready(None)
            }
            Some(Err(err)) => {
                st.end_delivered = true;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    st.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

type QueueBinding = Arc<Mutex<Option<Weak<SinkQueue>>>>;

/// Read side of a pull sink.
#[derive(Clone, Default)]
pub struct BatchReceiver {
    binding: QueueBinding,
}

impl BatchReceiver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&self, queue: &Arc<SinkQueue>) {
        *self.binding.lock().expect("receiver binding lock") = Some(Arc::downgrade(queue));
    }

    fn queue(&self) -> ExecResult<Arc<SinkQueue>> {
        let binding = self.binding.lock().expect("receiver binding lock");
        match binding.as_ref() {
            None => Err(ExecError::invalid_graph(
                "sink receiver is not attached to any plan",
            )),
            Some(queue) => queue.upgrade().ok_or_else(|| {
                ExecError::already_finished("sink was dropped together with its plan")
            }),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding
            .lock()
            .expect("receiver binding lock")
            .is_some()
    }

    pub fn backpressure_monitor(&self) -> Option<Arc<BackpressureMonitor>> {
        self.queue().ok().and_then(|q| q.monitor())
    }

    /// Blocks until the next batch, the end of the stream or an error.
    pub fn next_blocking(&mut self) -> Option<ExecResult<Chunk>> {
        block_on(self.next())
    }

    /// Reads every remaining batch; the first error aborts.
    pub fn collect_blocking(&mut self) -> ExecResult<Vec<Chunk>> {
        let mut out = Vec::new();
        while let Some(item) = self.next_blocking() {
            out.push(item?);
        }
        Ok(out)
    }
}

impl Stream for BatchReceiver {
    type Item = ExecResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.queue() {
            Ok(queue) => queue.poll_pop(cx),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}

pub struct SinkNodeOptions {
    pub backpressure: BackpressureOptions,
    receiver: BatchReceiver,
}

impl Default for SinkNodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkNodeOptions {
    pub fn new() -> Self {
        Self {
            backpressure: BackpressureOptions::default_backpressure(),
            receiver: BatchReceiver::new(),
        }
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureOptions) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Receiver bound to the sink built from these options.
    pub fn receiver(&self) -> BatchReceiver {
        self.receiver.clone()
    }
}

struct SinkOperator {
    schema: SchemaRef,
    queue: Arc<SinkQueue>,
    counter: BatchCounter,
}

impl SinkOperator {
    fn finish(&self, node: &Arc<ExecNode>) {
        self.queue.close(Ok(()));
        node.mark_finished(Ok(()));
    }
}

impl NodeOperator for SinkOperator {
    fn kind_name(&self) -> &'static str {
        "SinkNode"
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn start_producing(&self, _node: &Arc<ExecNode>) -> ExecResult<()> {
        Ok(())
    }

    fn stop_producing(&self, node: &Arc<ExecNode>) {
        node.stop_inputs();
        self.finish(node);
    }

    fn input_received(&self, node: &Arc<ExecNode>, _input_index: usize, chunk: Chunk) {
        self.queue.push(chunk);
        if self.counter.increment() {
            self.finish(node);
        }
    }

    fn input_finished(&self, node: &Arc<ExecNode>, _input_index: usize, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish(node);
        }
    }

    fn error_received(&self, node: &Arc<ExecNode>, _input_index: usize, error: ExecError) {
        self.queue.close(Err(error.clone()));
        node.fail(error);
    }

    fn backpressure_monitor(&self) -> Option<Arc<BackpressureMonitor>> {
        self.queue.monitor()
    }
}

pub fn make_sink_node(
    plan: &Arc<ExecPlan>,
    inputs: Vec<Arc<ExecNode>>,
    options: &dyn ExecNodeOptions,
    label: Option<String>,
) -> ExecResult<Arc<ExecNode>> {
    validate_input_count("SinkNode", &inputs, 1)?;
    let options = options_as::<SinkNodeOptions>("SinkNode", options)?;
    let schema = inputs[0].output_schema();
    let backpressure = options.backpressure;
    let receiver = options.receiver();
    plan.add_node_with(label, inputs, 0, move |node| {
        let handler = UpstreamBackpressure::from_weak(node.clone());
        let monitor = Arc::new(BackpressureMonitor::new(backpressure, handler));
        let queue = Arc::new(SinkQueue::new(Some(monitor)));
        receiver.bind(&queue);
        Box::new(SinkOperator {
            schema,
            queue,
            counter: BatchCounter::new(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn chunk(n: i32) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)]));
        Chunk::try_from_arrays(schema, vec![Arc::new(Int32Array::from(vec![n]))])
            .expect("chunk")
    }

    fn bound_receiver(queue: &Arc<SinkQueue>) -> BatchReceiver {
        let receiver = BatchReceiver::new();
        receiver.bind(queue);
        receiver
    }

    #[test]
    fn queued_batches_then_end_then_already_finished() {
        let queue = Arc::new(SinkQueue::new(None));
        let mut receiver = bound_receiver(&queue);
        assert!(queue.push(chunk(1)));
        queue.close(Ok(()));
        assert!(!queue.push(chunk(2)));

        assert_eq!(receiver.next_blocking(), Some(Ok(chunk(1))));
        assert_eq!(receiver.next_blocking(), None);
        assert!(matches!(
            receiver.next_blocking(),
            Some(Err(ExecError::AlreadyFinished(_)))
        ));
    }

    #[test]
    fn terminal_error_is_reported_once() {
        let queue = Arc::new(SinkQueue::new(None));
        let mut receiver = bound_receiver(&queue);
        queue.close(Err(ExecError::operator("bad batch")));
        assert_eq!(
            receiver.next_blocking(),
            Some(Err(ExecError::operator("bad batch")))
        );
        assert!(matches!(
            receiver.next_blocking(),
            Some(Err(ExecError::AlreadyFinished(_)))
        ));
    }

    #[test]
    fn dropped_queue_reports_already_finished() {
        let queue = Arc::new(SinkQueue::new(None));
        let mut receiver = bound_receiver(&queue);
        drop(queue);
        assert!(matches!(
            receiver.next_blocking(),
            Some(Err(ExecError::AlreadyFinished(_)))
        ));
    }

    #[test]
    fn unbound_receiver_is_rejected() {
        let mut receiver = SinkNodeOptions::new().receiver();
        assert!(!receiver.is_bound());
        assert!(matches!(
            receiver.next_blocking(),
            Some(Err(ExecError::InvalidGraph(_)))
        ));
    }
}
