// SPDX-License-Identifier: Apache-2.0

//! The Server Loop: the event-loop shell an application runs around
//! one [`Rpc`] instance — accept inbound connections, drive session
//! timeouts and user timers, and call out to lifecycle hooks.
//!
//! Grounded on the accept-loop/`tokio::select!`/shutdown-signal shape
//! common to server-side examples in the pack (`ipc/server.rs`'s
//! `TcpListener::accept` loop, the daemon's `SignalKind`-driven
//! shutdown watcher) combined with a per-connection task-per-socket
//! structure (`ClientConnection::connect` spawning its `read_loop`).
//! Because [`Rpc::attach`] already spawns a read task per connection,
//! this loop itself only has to drive the pieces that aren't already
//! event-driven: session-timeout ticking, user timers, and the
//! lifecycle hooks below.

use std::sync::Arc;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::rpc::Rpc;
use crate::transport::TcpTransport;

type Hook = Box<dyn Fn() + Send + Sync>;
type StopHook = Box<dyn Fn() -> i32 + Send + Sync>;
type TimerCallback = Box<dyn FnOnce() + Send>;

/// Wraps an [`Rpc`] with the event-loop cadence an application runs it
/// under: accept new connections, tick session timeouts, fire due user
/// timers, and call out to lifecycle hooks once per pass.
pub struct Server {
    rpc: Arc<Rpc>,
    timers: Mutex<DelayQueue<TimerCallback>>,
    on_update: Option<Hook>,
    on_idle: Option<Hook>,
    on_reload: Option<Hook>,
    on_stop: Option<StopHook>,
}

impl Server {
    pub fn new(rpc: Arc<Rpc>) -> Self {
        Self {
            rpc,
            timers: Mutex::new(DelayQueue::new()),
            on_update: None,
            on_idle: None,
            on_reload: None,
            on_stop: None,
        }
    }

    pub fn rpc(&self) -> &Arc<Rpc> {
        &self.rpc
    }

    /// Called once at the top of every loop pass.
    pub fn on_update(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }

    /// Called once per pass that produced no timer work, right before
    /// the idle sleep.
    pub fn on_idle(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_idle = Some(Box::new(hook));
        self
    }

    /// Called whenever the process receives `SIGHUP`.
    pub fn on_reload(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reload = Some(Box::new(hook));
        self
    }

    /// Called once per pass; the loop exits once this returns `0`.
    pub fn on_stop(mut self, hook: impl Fn() -> i32 + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Fire `callback` once, `delay_ms` from now. Cheap to call from
    /// inside a service handler — amortised the same way
    /// [`crate::session::SessionTable`] amortises session deadlines.
    pub fn add_timer(&self, delay_ms: u64, callback: impl FnOnce() + Send + 'static) {
        let mut timers = self.timers.lock().expect("server timers lock");
        timers.insert(Box::new(callback), Duration::from_millis(delay_ms));
    }

    fn drain_due_timers(&self) -> Vec<TimerCallback> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        let mut timers = self.timers.lock().expect("server timers lock");
        let mut out = Vec::new();
        while let Poll::Ready(Some(expired)) = timers.poll_expired(&mut cx) {
            out.push(expired.into_inner());
        }
        out
    }

    /// Bind `addr` and spawn an accept loop that attaches every incoming
    /// connection to this server's `Rpc` instance. Can be called more
    /// than once to listen on several addresses. Returns the actually
    /// bound address, useful when `addr` asks for an ephemeral port.
    pub async fn bind_tcp(self: &Arc<Self>, addr: &str) -> Result<std::net::SocketAddr, RpcError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| RpcError::SendFailed(format!("bind {addr}: {e}")))?;
        let bound_addr = listener.local_addr().map_err(|e| RpcError::SendFailed(e.to_string()))?;
        let rpc = Arc::clone(&self.rpc);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, addr = %bound_addr, "accepted connection");
                        stream.set_nodelay(true).ok();
                        rpc.attach(Arc::new(TcpTransport::from_stream(stream)));
                    },
                    Err(e) => {
                        warn!(error = %e, addr = %bound_addr, "accept failed");
                    },
                }
            }
        });
        Ok(bound_addr)
    }

    /// Run the event loop until an `on_stop` hook returns `0`.
    ///
    /// `SIGHUP` is watched on its own task and simply invokes
    /// `on_reload`; everything else — ticking, user timers, and the
    /// remaining hooks — runs inline once per pass, sleeping 1ms
    /// whenever a pass had no timer to fire.
    pub async fn serve(self: Arc<Self>) -> Result<(), RpcError> {
        let mut reload_signal = signal(SignalKind::hangup()).map_err(RpcError::other)?;
        {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                while reload_signal.recv().await.is_some() {
                    if let Some(hook) = &server.on_reload {
                        hook();
                    }
                }
            });
        }

        loop {
            self.rpc.sessions().tick();
            self.rpc.scheduler().update();

            let due = self.drain_due_timers();
            let did_work = !due.is_empty();
            for callback in due {
                callback();
            }

            if let Some(hook) = &self.on_update {
                hook();
            }

            if !did_work {
                if let Some(hook) = &self.on_idle {
                    hook();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            if let Some(hook) = &self.on_stop {
                if hook() == 0 {
                    break;
                }
            }
        }
        Ok(())
    }
}
