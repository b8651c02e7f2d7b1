// SPDX-License-Identifier: Apache-2.0

//! The Session Table: correlates in-flight `session_id`s with their
//! eventual response, ported from `ClientConnection`'s
//! `sending`/`reciver` `DashMap<u32, ...>` pair keyed by ITT
//! (`client/client.rs`) — `session_id` here plays exactly the role ITT
//! plays there, widened to 64 bits.
//!
//! Unlike that pair (which hands the waiting task an `mpsc::Receiver`
//! it polls itself), callers here register a plain callback; a
//! `tokio_util::time::DelayQueue` drives deadline expiry instead of a
//! per-entry `sleep` future, so one `tick()` call amortises the cost
//! across every pending session.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::time::DelayQueue;

use crate::codec::Value;
use crate::error::RpcError;
use crate::handle::Handle;

/// Invoked exactly once per registered session, with `(error_code,
/// body)` — `error_code == 0` on success, matching spec.md §4.6's
/// client-visible result shape.
///
/// The body is a decoded [`Value`] rather than raw wire bytes: the
/// JSON and BSON codecs parse a whole inbound message (header and body
/// together) in one pass and stage the body inside the `Protocol`
/// instance itself (`JsonCodec::read_message_begin` consumes the
/// entire buffer and stages the body for the next `read_struct_begin`)
/// — there is no independently-decodable byte range to hand a
/// callback that would need a second, unrelated `Protocol` instance to
/// make sense of it. The dispatcher decodes once, here, and threads
/// the result through.
pub type ResponseCallback = Box<dyn FnOnce(i32, Option<Value>) + Send>;

struct PendingEntry {
    handle: Handle,
    callback: ResponseCallback,
}

/// Maps `session_id → PendingSession`, per spec.md §4.4.
#[derive(Default)]
pub struct SessionTable {
    entries: DashMap<u64, PendingEntry>,
    timers: Mutex<DelayQueue<u64>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next monotonically increasing session id for this
    /// RPC instance.
    pub fn alloc_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending session. `deadline_ms == 0` means no timeout
    /// (matching `yield_for`'s convention in the scheduler).
    pub fn register(
        &self,
        session_id: u64,
        handle: Handle,
        deadline_ms: u64,
        callback: ResponseCallback,
    ) -> Result<(), RpcError> {
        match self.entries.entry(session_id) {
            Entry::Occupied(_) => Err(RpcError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry { handle, callback });
                if deadline_ms > 0 {
                    let mut timers = self.timers.lock().expect("session timers lock");
                    timers.insert(session_id, Duration::from_millis(deadline_ms));
                }
                Ok(())
            },
        }
    }

    /// Look up and remove `session_id`, invoking its callback exactly
    /// once. A no-op if the session already fired (a late reply racing
    /// a timeout, or a duplicate reply) — this is what makes the
    /// terminal transition idempotent.
    pub fn complete(&self, session_id: u64, error_code: i32, body: Option<Value>) {
        if let Some((_, entry)) = self.entries.remove(&session_id) {
            (entry.callback)(error_code, body);
        }
    }

    /// Walk expired entries and complete each with `RpcTimeout`. Cheap
    /// to call on every server-loop pass: `DelayQueue` amortises
    /// expiry tracking in its own timer wheel rather than scanning the
    /// whole table.
    pub fn tick(&self) {
        let expired = {
            let mut timers = self.timers.lock().expect("session timers lock");
            drain_expired(&mut timers)
        };
        for session_id in expired {
            self.complete(session_id, RpcError::RpcTimeout.code(), None);
        }
    }

    /// Complete every entry bound to `handle` with `ChannelClosed`,
    /// called when the transport behind that handle drops.
    pub fn cancel_all(&self, handle: Handle) {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.value().handle == handle)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            self.complete(id, RpcError::ChannelClosed.code(), None);
        }
    }

    /// Drop a registered session without invoking its callback — used
    /// to roll back a registration when the write that was supposed to
    /// elicit a reply never went out.
    pub fn cancel_pending(&self, session_id: u64) {
        self.entries.remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drain every currently-due timer without blocking. A stale key whose
/// session already completed through [`SessionTable::complete`] simply
/// yields a `session_id` no longer present in `entries`, which `tick`
/// turns into a harmless no-op — cheaper than trying to cancel a
/// `DelayQueue` entry early on normal completion.
fn drain_expired(timers: &mut DelayQueue<u64>) -> Vec<u64> {
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    let mut out = Vec::new();
    while let Poll::Ready(Some(expired)) = timers.poll_expired(&mut cx) {
        out.push(expired.into_inner());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn handle(raw: i64) -> Handle {
        Handle::new(raw).expect("handle")
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = SessionTable::new();
        table.register(1, handle(0), 0, Box::new(|_, _| {})).expect("first register");
        let err = table.register(1, handle(0), 0, Box::new(|_, _| {})).expect_err("duplicate");
        assert_eq!(err, RpcError::Duplicate);
    }

    #[test]
    fn complete_fires_callback_exactly_once() {
        let table = SessionTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        table
            .register(
                1,
                handle(0),
                0,
                Box::new(move |code, body| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(code, 0);
                    assert!(body.is_none());
                }),
            )
            .expect("register");

        table.complete(1, 0, None);
        table.complete(1, 0, None);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn tick_times_out_expired_entries() {
        let table = SessionTable::new();
        let got = Arc::new(Mutex::new(None));
        let got2 = Arc::clone(&got);
        table
            .register(
                1,
                handle(0),
                1,
                Box::new(move |code, body| {
                    *got2.lock().expect("got lock") = Some((code, body));
                }),
            )
            .expect("register");

        std::thread::sleep(Duration::from_millis(30));
        table.tick();

        let got = got.lock().expect("got lock");
        assert_eq!(got.as_ref().map(|(code, _)| *code), Some(RpcError::RpcTimeout.code()));
        assert!(table.is_empty());
    }

    #[test]
    fn cancel_pending_drops_the_entry_without_firing_its_callback() {
        let table = SessionTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        table
            .register(1, handle(0), 0, Box::new(move |_, _| { fired2.fetch_add(1, Ordering::SeqCst); }))
            .expect("register");

        table.cancel_pending(1);

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn tick_is_a_no_op_when_nothing_is_due() {
        let table = SessionTable::new();
        table.register(1, handle(0), 60_000, Box::new(|_, _| {})).expect("register");
        table.tick();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn cancel_all_completes_only_entries_on_that_handle() {
        let table = SessionTable::new();
        let codes = Arc::new(Mutex::new(Vec::new()));

        let c1 = Arc::clone(&codes);
        table
            .register(1, handle(0), 0, Box::new(move |code, _| c1.lock().expect("codes lock").push(code)))
            .expect("register 1");
        let c2 = Arc::clone(&codes);
        table
            .register(2, handle(1), 0, Box::new(move |code, _| c2.lock().expect("codes lock").push(code)))
            .expect("register 2");

        table.cancel_all(handle(0));

        assert_eq!(*codes.lock().expect("codes lock"), vec![RpcError::ChannelClosed.code()]);
        assert_eq!(table.len(), 1);
    }
}
