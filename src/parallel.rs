// SPDX-License-Identifier: Apache-2.0

//! The parallel-call aggregator: fan N concurrent `send_sync`-style
//! calls out and fire a single aggregate completion once every one of
//! them has answered, or once a shared deadline elapses first.
//!
//! Grounded on spec.md §4.4's `ParallelCtx` (`num_parallel`,
//! `num_called`, `ret_code`, a single aggregate callback). The "fires
//! exactly once" guard described there as a `fired: AtomicBool` is
//! implemented with a `OnceLock<()>` instead — `OnceLock::set` already
//! gives the same "did I win the race" atomicity in one call, so a
//! separate flag plus compare-exchange would just duplicate it.

use std::sync::{Arc, Mutex, OnceLock};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::RpcError;
use crate::session::ResponseCallback;

pub type AggregateCallback = Box<dyn FnOnce(i32) + Send>;

/// Shared state for one `send_parallel` fan-out.
pub struct ParallelCtx {
    num_parallel: u32,
    num_called: AtomicU32,
    ret_code: AtomicI32,
    fired: OnceLock<()>,
    callback: Mutex<Option<AggregateCallback>>,
}

impl ParallelCtx {
    pub fn new(num_parallel: u32, callback: AggregateCallback) -> Arc<Self> {
        Arc::new(Self {
            num_parallel,
            num_called: AtomicU32::new(0),
            ret_code: AtomicI32::new(0),
            fired: OnceLock::new(),
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Wrap a per-call response callback so its completion also counts
    /// against this aggregate. `inner` still runs, and still runs
    /// first, even on a late response that arrives after the aggregate
    /// already fired.
    pub fn wrap(self: &Arc<Self>, inner: ResponseCallback) -> ResponseCallback {
        let ctx = Arc::clone(self);
        Box::new(move |error_code, body| {
            inner(error_code, body);
            ctx.complete_one(error_code);
        })
    }

    /// Record one individual call's completion. Latches the first
    /// non-zero error code seen and fires the aggregate once every
    /// call has reported.
    pub fn complete_one(&self, error_code: i32) {
        if error_code != 0 {
            let _ = self.ret_code.compare_exchange(0, error_code, Ordering::SeqCst, Ordering::SeqCst);
        }
        let called = self.num_called.fetch_add(1, Ordering::SeqCst) + 1;
        if called >= self.num_parallel {
            self.fire();
        }
    }

    /// Force the aggregate to fire with `RpcTimeout` (unless it has
    /// already fired on its own) when the shared deadline elapses
    /// before every call has reported.
    pub fn complete_by_timeout(&self) {
        let _ = self
            .ret_code
            .compare_exchange(0, RpcError::RpcTimeout.code(), Ordering::SeqCst, Ordering::SeqCst);
        self.fire();
    }

    fn fire(&self) {
        if self.fired.set(()).is_err() {
            return;
        }
        if let Some(callback) = self.callback.lock().expect("parallel ctx lock").take() {
            callback(self.ret_code.load(Ordering::SeqCst));
        }
    }

    pub fn num_parallel(&self) -> u32 {
        self.num_parallel
    }

    pub fn num_called(&self) -> u32 {
        self.num_called.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn aggregate_fires_once_all_calls_succeed() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let ctx = ParallelCtx::new(
            3,
            Box::new(move |code| {
                seen2.lock().expect("seen lock").push(code);
            }),
        );

        ctx.complete_one(0);
        ctx.complete_one(0);
        ctx.complete_one(0);

        assert_eq!(*seen.lock().expect("seen lock"), vec![0]);
    }

    #[test]
    fn aggregate_records_first_non_zero_code_in_completion_order() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let ctx = ParallelCtx::new(
            3,
            Box::new(move |code| {
                seen2.lock().expect("seen lock").push(code);
            }),
        );

        ctx.complete_one(0);
        ctx.complete_one(-42);
        ctx.complete_one(7);

        assert_eq!(*seen.lock().expect("seen lock"), vec![-42]);
    }

    #[test]
    fn late_response_after_aggregate_fired_is_discarded() {
        let fire_count = Arc::new(AtomicUsize::new(0));
        let fire_count2 = Arc::clone(&fire_count);
        let ctx = ParallelCtx::new(
            2,
            Box::new(move |_code| {
                fire_count2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        ctx.complete_one(0);
        ctx.complete_one(0);
        // a straggler that still reports after the aggregate fired.
        ctx.complete_one(0);

        assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_forces_the_aggregate_to_fire() {
        let seen = Arc::new(StdMutex::new(None));
        let seen2 = Arc::clone(&seen);
        let ctx = ParallelCtx::new(
            2,
            Box::new(move |code| {
                *seen2.lock().expect("seen lock") = Some(code);
            }),
        );

        ctx.complete_one(0);
        ctx.complete_by_timeout();

        assert_eq!(*seen.lock().expect("seen lock"), Some(RpcError::RpcTimeout.code()));
        // a late straggler after the timeout fired must not re-invoke the callback.
        ctx.complete_one(0);
        assert_eq!(*seen.lock().expect("seen lock"), Some(RpcError::RpcTimeout.code()));
    }
}
