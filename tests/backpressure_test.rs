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
//! Integration tests for sink backpressure.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::datatypes::SchemaRef;

use common::{basic_batches, basic_schema, chunk_rows};
use novaflow::exec::chunk::Chunk;
use novaflow::exec::error::ExecResult;
use novaflow::exec::operators::{
    ConsumingSinkNodeOptions, OrderBySinkNodeOptions, SinkNodeConsumer, SinkNodeOptions,
    SortKey, SortOptions, SourceNodeOptions, push_generator,
};
use novaflow::exec::pipeline::{
    BackpressureControl, BackpressureOptions, Completion, Declaration, ExecContext, ExecPlan,
    PlanHandle,
};

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn sink_pauses_above_and_resumes_below_thresholds() {
    let batch = basic_batches()[1].clone();
    let bytes = batch.logical_bytes() as u64;
    assert!(bytes > 0);

    let (producer, generator) = push_generator();
    let plan = ExecPlan::make(ExecContext::serial());
    let options = SinkNodeOptions::new().with_backpressure(
        BackpressureOptions::new(2 * bytes, 4 * bytes).expect("thresholds"),
    );
    let mut receiver = options.receiver();
    Declaration::sequence(vec![
        Declaration::new("source", SourceNodeOptions::new(basic_schema(), generator)),
        Declaration::new("sink", options).with_label("out"),
    ])
    .expect("sequence")
    .add_to_plan(&plan)
    .expect("add to plan");

    let monitors = plan.backpressure_monitors();
    assert_eq!(monitors.len(), 1);
    assert_eq!(monitors[0].0, "out");
    let monitor = receiver.backpressure_monitor().expect("sink monitor");
    assert!(Arc::ptr_eq(&monitor, &monitors[0].1));

    plan.start_producing().expect("start");
    for _ in 0..4 {
        assert!(producer.push(batch.clone()));
    }
    assert!(!monitor.is_paused());
    assert_eq!(monitor.bytes_queued(), 4 * bytes);

    assert!(producer.push(batch.clone()));
    assert!(monitor.is_paused());

    // the paused source leaves these in its generator
    assert!(producer.push(batch.clone()));
    assert!(producer.push(batch.clone()));
    assert_eq!(monitor.bytes_queued(), 5 * bytes);

    for _ in 0..3 {
        receiver.next_blocking().expect("open").expect("batch");
    }
    assert!(monitor.is_paused());
    assert_eq!(monitor.bytes_queued(), 2 * bytes);

    receiver.next_blocking().expect("open").expect("batch");
    assert!(!monitor.is_paused());
    // resuming drained the two held-back batches
    assert_eq!(monitor.bytes_queued(), 3 * bytes);
    assert_eq!(monitor.peak_bytes_queued(), 5 * bytes);

    producer.close();
    let rest = receiver.collect_blocking().expect("collect");
    assert_eq!(rest.len(), 3);
    assert_eq!(plan.finished().wait_timeout(WAIT), Some(Ok(())));
    assert_eq!(monitor.bytes_queued(), 0);
}

#[test]
fn disabled_backpressure_never_pauses() {
    let batch = basic_batches()[0].clone();
    let (producer, generator) = push_generator();
    let plan = ExecPlan::make(ExecContext::serial());
    let options =
        SinkNodeOptions::new().with_backpressure(BackpressureOptions::no_backpressure());
    let mut receiver = options.receiver();
    Declaration::sequence(vec![
        Declaration::new("source", SourceNodeOptions::new(basic_schema(), generator)),
        Declaration::new("sink", options),
    ])
    .expect("sequence")
    .add_to_plan(&plan)
    .expect("add to plan");

    plan.start_producing().expect("start");
    for _ in 0..32 {
        assert!(producer.push(batch.clone()));
    }
    let monitor = receiver.backpressure_monitor().expect("sink monitor");
    assert!(!monitor.is_paused());
    assert_eq!(monitor.bytes_queued(), 32 * batch.logical_bytes() as u64);

    producer.close();
    assert_eq!(receiver.collect_blocking().expect("collect").len(), 32);
    assert_eq!(plan.finished().wait_timeout(WAIT), Some(Ok(())));
}

#[test]
fn order_by_sink_queue_reports_to_its_monitor() {
    let (producer, generator) = push_generator();
    let plan = ExecPlan::make(ExecContext::serial());
    let options = OrderBySinkNodeOptions::new(SortOptions::new(vec![SortKey::ascending("i32")]))
        .with_backpressure(BackpressureOptions::new(1, 2).expect("thresholds"));
    let mut receiver = options.receiver();
    Declaration::sequence(vec![
        Declaration::new("source", SourceNodeOptions::new(basic_schema(), generator)),
        Declaration::new("order_by_sink", options).with_label("sorted"),
    ])
    .expect("sequence")
    .add_to_plan(&plan)
    .expect("add to plan");

    let monitors = plan.backpressure_monitors();
    assert_eq!(monitors.len(), 1);
    assert_eq!(monitors[0].0, "sorted");
    let monitor = receiver.backpressure_monitor().expect("order by monitor");
    assert!(Arc::ptr_eq(&monitor, &monitors[0].1));

    plan.start_producing().expect("start");
    for batch in basic_batches() {
        assert!(producer.push(batch));
    }
    assert_eq!(monitor.bytes_queued(), 0);
    producer.close();
    assert_eq!(plan.finished().wait_timeout(WAIT), Some(Ok(())));
    // the sorted output sits in the queue until it is read
    assert!(monitor.is_paused());
    assert!(monitor.bytes_queued() > 2);

    let sorted = receiver.collect_blocking().expect("collect");
    assert_eq!(chunk_rows(&sorted).len(), 5);
    assert!(!monitor.is_paused());
    assert_eq!(monitor.bytes_queued(), 0);
}

#[derive(Default)]
struct ControlledConsumer {
    control: Mutex<Option<Arc<dyn BackpressureControl>>>,
    consumed: Mutex<usize>,
}

impl ControlledConsumer {
    fn control(&self) -> Arc<dyn BackpressureControl> {
        self.control
            .lock()
            .expect("control lock")
            .clone()
            .expect("consumer initialized")
    }

    fn consumed(&self) -> usize {
        *self.consumed.lock().expect("consumed lock")
    }
}

impl SinkNodeConsumer for ControlledConsumer {
    fn init(
        &self,
        _schema: &SchemaRef,
        backpressure: Arc<dyn BackpressureControl>,
        _plan: &PlanHandle,
    ) -> ExecResult<()> {
        *self.control.lock().expect("control lock") = Some(backpressure);
        Ok(())
    }

    fn consume(&self, _chunk: Chunk) -> ExecResult<()> {
        *self.consumed.lock().expect("consumed lock") += 1;
        Ok(())
    }

    fn finish(&self) -> Completion<()> {
        Completion::ok()
    }
}

#[test]
fn consumer_can_pause_and_resume_its_source() {
    let batch = basic_batches()[0].clone();
    let (producer, generator) = push_generator();
    let consumer = Arc::new(ControlledConsumer::default());
    let plan = ExecPlan::make(ExecContext::serial());
    Declaration::sequence(vec![
        Declaration::new("source", SourceNodeOptions::new(basic_schema(), generator)),
        Declaration::new(
            "consuming_sink",
            ConsumingSinkNodeOptions::new(consumer.clone()),
        ),
    ])
    .expect("sequence")
    .add_to_plan(&plan)
    .expect("add to plan");
    assert!(plan.backpressure_monitors().is_empty());

    plan.start_producing().expect("start");
    assert!(producer.push(batch.clone()));
    assert_eq!(consumer.consumed(), 1);

    let control = consumer.control();
    control.pause();
    assert!(producer.push(batch.clone()));
    assert!(producer.push(batch.clone()));
    assert_eq!(consumer.consumed(), 1);

    control.resume();
    assert_eq!(consumer.consumed(), 3);

    producer.close();
    assert_eq!(plan.finished().wait_timeout(WAIT), Some(Ok(())));
}
