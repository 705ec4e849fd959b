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
//! One-shot completion primitive.
//!
//! Responsibilities:
//! - Carries the terminal result of a node, a plan, or a sink consumer.
//! - Lets callers block (`wait`, `wait_timeout`), poll (`is_finished`), attach
//!   continuations (`on_complete`) or `.await` it as a `std::future::Future`.
//!
//! Key exported interfaces:
//! - Types: `Completion`.
//!
//! A completion is set at most once; later `mark_finished` calls are ignored.
//! Continuations run on the thread that marks the completion finished, or
//! inline when attached to an already finished completion.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::exec::error::{ExecError, ExecResult};

type Callback<T> = Box<dyn FnOnce(&ExecResult<T>) + Send + 'static>;

struct CompletionState<T> {
    result: Option<ExecResult<T>>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
}

struct CompletionInner<T> {
    mu: Mutex<CompletionState<T>>,
    cv: Condvar,
}

/// Set-once result with continuation attachment.
pub struct Completion<T = ()> {
    inner: Arc<CompletionInner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let finished = self
            .inner
            .mu
            .lock()
            .map(|st| st.result.is_some())
            .unwrap_or(false);
        f.debug_struct("Completion")
            .field("finished", &finished)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                mu: Mutex::new(CompletionState {
                    result: None,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Returns a completion that is already finished with `result`.
    pub fn finished(result: ExecResult<T>) -> Self {
        let completion = Self::new();
        completion.mark_finished(result);
        completion
    }

    /// Sets the result. Returns false if the completion was already finished.
    pub fn mark_finished(&self, result: ExecResult<T>) -> bool {
        let (callbacks, wakers) = {
            let mut st = self.inner.mu.lock().expect("completion lock");
            if st.result.is_some() {
                return false;
            }
            st.result = Some(result.clone());
            (
                std::mem::take(&mut st.callbacks),
                std::mem::take(&mut st.wakers),
            )
        };
        self.inner.cv.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.inner
            .mu
            .lock()
            .expect("completion lock")
            .result
            .is_some()
    }

    /// Point-in-time copy of the result, `None` while still pending.
    pub fn result(&self) -> Option<ExecResult<T>> {
        self.inner
            .mu
            .lock()
            .expect("completion lock")
            .result
            .clone()
    }

    /// Runs `callback` once the completion is finished.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&ExecResult<T>) + Send + 'static,
    {
        let result = {
            let mut st = self.inner.mu.lock().expect("completion lock");
            match st.result.as_ref() {
                Some(result) => result.clone(),
                None => {
                    st.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }

    /// Blocks the calling thread until the completion is finished.
    pub fn wait(&self) -> ExecResult<T> {
        let guard = self.inner.mu.lock().expect("completion lock");
        let guard = self
            .inner
            .cv
            .wait_while(guard, |st| st.result.is_none())
            .expect("completion wait");
        guard
            .result
            .clone()
            .unwrap_or_else(|| Err(ExecError::operator("completion woke without a result")))
    }

    /// Blocks for at most `timeout`; `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExecResult<T>> {
        let guard = self.inner.mu.lock().expect("completion lock");
        let (guard, _) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |st| st.result.is_none())
            .expect("completion wait");
        guard.result.clone()
    }
}

impl Completion<()> {
    pub fn ok() -> Self {
        Self::finished(Ok(()))
    }

    /// Finishes once every input finished, with the first error to arrive.
    pub fn all(completions: Vec<Completion<()>>) -> Completion<()> {
        let all = Completion::new();
        if completions.is_empty() {
            all.mark_finished(Ok(()));
            return all;
        }
        let remaining = Arc::new(Mutex::new((completions.len(), None::<ExecError>)));
        for completion in completions {
            let all = all.clone();
            let remaining = Arc::clone(&remaining);
            completion.on_complete(move |result| {
                let done = {
                    let mut st = remaining.lock().expect("all-finished lock");
                    if let Err(err) = result
                        && st.1.is_none()
                    {
                        st.1 = Some(err.clone());
                    }
                    st.0 -= 1;
                    if st.0 == 0 { Some(st.1.take()) } else { None }
                };
                if let Some(first_error) = done {
                    all.mark_finished(match first_error {
                        Some(err) => Err(err),
                        None => Ok(()),
                    });
                }
            });
        }
        all
    }
}

impl<T: Clone + Send + 'static> Future for Completion<T> {
    type Output = ExecResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.inner.mu.lock().expect("completion lock");
        if let Some(result) = st.result.as_ref() {
            return Poll::Ready(result.clone());
        }
        if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            st.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn mark_finished_is_set_once() {
        let c = Completion::<i32>::new();
        assert!(!c.is_finished());
        assert!(c.mark_finished(Ok(1)));
        assert!(!c.mark_finished(Ok(2)));
        assert_eq!(c.result(), Some(Ok(1)));
    }

    #[test]
    fn callbacks_run_when_attached_before_and_after() {
        let c = Completion::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let before = Arc::clone(&calls);
        c.on_complete(move |_| {
            before.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        c.mark_finished(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let after = Arc::clone(&calls);
        c.on_complete(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_returns_result_set_from_other_thread() {
        let c = Completion::<u8>::new();
        let setter = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.mark_finished(Ok(7));
        });
        assert_eq!(c.wait(), Ok(7));
        handle.join().expect("setter thread");
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let c = Completion::<()>::new();
        assert!(c.wait_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn all_waits_for_every_input_and_keeps_first_error() {
        let a = Completion::new();
        let b = Completion::new();
        let c = Completion::new();
        let all = Completion::all(vec![a.clone(), b.clone(), c.clone()]);
        b.mark_finished(Err(ExecError::operator("first")));
        a.mark_finished(Err(ExecError::operator("second")));
        assert!(!all.is_finished());
        c.mark_finished(Ok(()));
        assert_eq!(all.result(), Some(Err(ExecError::operator("first"))));
    }

    #[test]
    fn all_of_nothing_is_finished() {
        assert_eq!(Completion::all(Vec::new()).result(), Some(Ok(())));
    }

    #[test]
    fn completion_can_be_awaited() {
        let c = Completion::<&'static str>::new();
        let setter = c.clone();
        let handle = thread::spawn(move || {
            setter.mark_finished(Ok("done"));
        });
        assert_eq!(futures::executor::block_on(c), Ok("done"));
        handle.join().expect("setter thread");
    }
}
