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
//! Sink-side backpressure controller.
//!
//! Responsibilities:
//! - Tracks bytes queued at a sink and flips a pause/resume signal with
//!   hysteresis (`pause_if_above` / `resume_if_below`).
//! - Forwards pause/resume to the nodes feeding the sink, once per transition.
//!
//! Key exported interfaces:
//! - Types: `BackpressureOptions`, `BackpressureMonitor`, `BackpressureHandler`,
//!   `BackpressureControl`, `UpstreamBackpressure`.
//!
//! Signals are raised after the monitor lock is released, so a resumed
//! producer may push straight back into the same sink. Each transition
//! carries a counter taken under the lock; receivers drop signals older than
//! the newest one they applied.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::config::{sink_pause_if_above_bytes, sink_resume_if_below_bytes};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::pipeline::node::ExecNode;
use crate::novaflow_logging::debug;

/// Byte thresholds for pausing and resuming the producers of one sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackpressureOptions {
    resume_if_below: u64,
    pause_if_above: u64,
}

impl BackpressureOptions {
    pub fn new(resume_if_below: u64, pause_if_above: u64) -> ExecResult<Self> {
        if pause_if_above > 0 && resume_if_below >= pause_if_above {
            return Err(ExecError::invalid_options(format!(
                "backpressure resume_if_below ({}) must be less than pause_if_above ({})",
                resume_if_below, pause_if_above
            )));
        }
        Ok(Self {
            resume_if_below,
            pause_if_above,
        })
    }

    /// Thresholds from `runtime.sink_*_bytes`.
    pub fn default_backpressure() -> Self {
        Self::new(sink_resume_if_below_bytes(), sink_pause_if_above_bytes())
            .unwrap_or_else(|_| Self::no_backpressure())
    }

    pub fn no_backpressure() -> Self {
        Self {
            resume_if_below: 0,
            pause_if_above: 0,
        }
    }

    pub fn should_apply(&self) -> bool {
        self.pause_if_above > 0
    }

    pub fn resume_if_below(&self) -> u64 {
        self.resume_if_below
    }

    pub fn pause_if_above(&self) -> u64 {
        self.pause_if_above
    }
}

impl Default for BackpressureOptions {
    fn default() -> Self {
        Self::default_backpressure()
    }
}

/// Receiver of sequenced pause/resume signals.
pub trait BackpressureHandler: Send + Sync {
    fn pause(&self, counter: u64);
    fn resume(&self, counter: u64);
}

/// Pause/resume handle given to sink consumers.
pub trait BackpressureControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Forwards pause/resume to every input of a node.
///
/// Use either as a monitor handler or as a consumer control, not both: the
/// two sources keep independent counters.
pub struct UpstreamBackpressure {
    node: Weak<ExecNode>,
    counter: AtomicU64,
}

impl UpstreamBackpressure {
    pub fn new(node: &Arc<ExecNode>) -> Arc<Self> {
        Self::from_weak(Arc::downgrade(node))
    }

    pub fn from_weak(node: Weak<ExecNode>) -> Arc<Self> {
        Arc::new(Self {
            node,
            counter: AtomicU64::new(0),
        })
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl BackpressureHandler for UpstreamBackpressure {
    fn pause(&self, counter: u64) {
        if let Some(node) = self.node.upgrade() {
            for input in node.inputs() {
                input.pause_producing(counter);
            }
        }
    }

    fn resume(&self, counter: u64) {
        if let Some(node) = self.node.upgrade() {
            for input in node.inputs() {
                input.resume_producing(counter);
            }
        }
    }
}

impl BackpressureControl for UpstreamBackpressure {
    fn pause(&self) {
        BackpressureHandler::pause(self, self.next_counter());
    }

    fn resume(&self) {
        BackpressureHandler::resume(self, self.next_counter());
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    bytes_queued: u64,
    peak_bytes_queued: u64,
    paused: bool,
    counter: u64,
}

enum Transition {
    Pause(u64),
    Resume(u64),
}

/// Queued-byte gate shared by one sink and its plan.
pub struct BackpressureMonitor {
    options: BackpressureOptions,
    handler: Arc<dyn BackpressureHandler>,
    state: Mutex<MonitorState>,
    paused: AtomicBool,
}

impl fmt::Debug for BackpressureMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureMonitor")
            .field("options", &self.options)
            .field("paused", &self.is_paused())
            .field("bytes_queued", &self.bytes_queued())
            .finish()
    }
}

impl BackpressureMonitor {
    pub fn new(options: BackpressureOptions, handler: Arc<dyn BackpressureHandler>) -> Self {
        Self {
            options,
            handler,
            state: Mutex::new(MonitorState::default()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> BackpressureOptions {
        self.options
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn bytes_queued(&self) -> u64 {
        self.state.lock().expect("backpressure lock").bytes_queued
    }

    pub fn peak_bytes_queued(&self) -> u64 {
        self.state.lock().expect("backpressure lock").peak_bytes_queued
    }

    pub fn record_enqueued(&self, bytes: u64) {
        let transition = {
            let mut st = self.state.lock().expect("backpressure lock");
            st.bytes_queued = st.bytes_queued.saturating_add(bytes);
            st.peak_bytes_queued = st.peak_bytes_queued.max(st.bytes_queued);
            if self.options.should_apply()
                && !st.paused
                && st.bytes_queued > self.options.pause_if_above
            {
                st.paused = true;
                st.counter += 1;
                self.paused.store(true, Ordering::Release);
                debug!(
                    "backpressure pause: bytes_queued={} pause_if_above={}",
                    st.bytes_queued, self.options.pause_if_above
                );
                Some(Transition::Pause(st.counter))
            } else {
                None
            }
        };
        self.signal(transition);
    }

    pub fn record_dequeued(&self, bytes: u64) {
        let transition = {
            let mut st = self.state.lock().expect("backpressure lock");
            st.bytes_queued = st.bytes_queued.saturating_sub(bytes);
            if st.paused && st.bytes_queued < self.options.resume_if_below {
                st.paused = false;
                st.counter += 1;
                self.paused.store(false, Ordering::Release);
                debug!(
                    "backpressure resume: bytes_queued={} resume_if_below={}",
                    st.bytes_queued, self.options.resume_if_below
                );
                Some(Transition::Resume(st.counter))
            } else {
                None
            }
        };
        self.signal(transition);
    }

    fn signal(&self, transition: Option<Transition>) {
        match transition {
            Some(Transition::Pause(counter)) => self.handler.pause(counter),
            Some(Transition::Resume(counter)) => self.handler.resume(counter),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        signals: Mutex<Vec<(bool, u64)>>,
    }

    impl BackpressureHandler for RecordingHandler {
        fn pause(&self, counter: u64) {
            self.signals.lock().expect("signals").push((true, counter));
        }

        fn resume(&self, counter: u64) {
            self.signals.lock().expect("signals").push((false, counter));
        }
    }

    fn monitor(resume: u64, pause: u64) -> (BackpressureMonitor, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let options = BackpressureOptions::new(resume, pause).expect("valid thresholds");
        (BackpressureMonitor::new(options, handler.clone()), handler)
    }

    #[test]
    fn options_require_ordered_thresholds() {
        assert!(BackpressureOptions::new(2, 4).is_ok());
        let err = BackpressureOptions::new(4, 4).expect_err("equal thresholds");
        assert!(matches!(err, ExecError::InvalidOptions(_)));
        assert!(!BackpressureOptions::no_backpressure().should_apply());
    }

    #[test]
    fn hysteresis_pauses_above_and_resumes_below() {
        let (monitor, handler) = monitor(20, 40);
        for _ in 0..4 {
            monitor.record_enqueued(10);
        }
        assert!(!monitor.is_paused());
        monitor.record_enqueued(10);
        assert!(monitor.is_paused());

        // 50 -> 20 stays paused, 20 is not below 20
        for _ in 0..3 {
            monitor.record_dequeued(10);
        }
        assert!(monitor.is_paused());
        monitor.record_dequeued(10);
        assert!(!monitor.is_paused());

        let signals = handler.signals.lock().expect("signals").clone();
        assert_eq!(signals, vec![(true, 1), (false, 2)]);
    }

    #[test]
    fn signals_fire_once_per_transition() {
        let (monitor, handler) = monitor(10, 20);
        for _ in 0..10 {
            monitor.record_enqueued(30);
        }
        assert_eq!(handler.signals.lock().expect("signals").len(), 1);
        assert_eq!(monitor.peak_bytes_queued(), 300);
    }

    #[test]
    fn disabled_monitor_never_pauses() {
        let handler = Arc::new(RecordingHandler::default());
        let monitor = BackpressureMonitor::new(BackpressureOptions::no_backpressure(), handler);
        monitor.record_enqueued(u64::MAX / 2);
        assert!(!monitor.is_paused());
    }
}
