// SPDX-License-Identifier: Apache-2.0

//! The RPC core: ties the session table, scheduler, service registry and
//! transport map together into `send_sync`/`send_parallel` on the
//! client side and frame dispatch on the server side.
//!
//! Grounded on `ClientConnection` (`client/client.rs`):
//! one read task per connection feeding decoded messages back into
//! shared state, a `DashMap<Handle, Arc<dyn Transport>>` standing in
//! for its single `reader`/`writer` pair generalized to many
//! connections, and the same "register a correlation entry, then
//! write, then wait" ordering `ClientConnection::execute_with` follows
//! for every outbound command.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;

use crate::buffer::MemoryBuffer;
use crate::codec::head::{HeadDialect, RpcException};
use crate::codec::{CodecKind, Field, MessageType, TType, Value, decode_value, encode_value};
use crate::error::RpcError;
use crate::handle::{Handle, HandleAllocator};
use crate::parallel::ParallelCtx;
use crate::registry::{ServiceFunction, ServiceOutcome, ServiceRegistry};
use crate::scheduler::{Scheduler, SchedulerConfig, YieldOutcome};
use crate::session::{ResponseCallback, SessionTable};
use crate::transport::{FrameCodec, Transport};

/// Field id a message body is wrapped under on the wire (see
/// `Rpc::write_message`).
const BODY_FIELD_ID: i16 = 1;

/// Unwrap a struct decoded by `dispatch_inbound` back to the bare
/// value `write_message` was given.
fn unwrap_body(value: Value) -> Result<Value, RpcError> {
    match value {
        Value::Struct(mut fields) => {
            let idx = fields
                .iter()
                .position(|f| f.id == BODY_FIELD_ID)
                .ok_or_else(|| RpcError::DecodeBodyFailed("message body missing its wrapper field".into()))?;
            Ok(fields.swap_remove(idx).value)
        },
        other => Err(RpcError::DecodeBodyFailed(format!("expected a wrapped message body, got {:?}", other.ttype()))),
    }
}

/// Owns every piece of per-connection state for one RPC endpoint —
/// client, server, or both at once, matching spec.md's "a single `Rpc`
/// instance can act as either side" framing.
pub struct Rpc {
    sessions: SessionTable,
    scheduler: Scheduler,
    registry: ServiceRegistry,
    transports: DashMap<Handle, Arc<dyn Transport>>,
    handles: HandleAllocator,
    codec: CodecKind,
    head_dialect: HeadDialect,
}

impl Rpc {
    pub fn new(codec: CodecKind, head_dialect: HeadDialect) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionTable::new(),
            scheduler: Scheduler::new(SchedulerConfig::default()),
            registry: ServiceRegistry::new(),
            transports: DashMap::new(),
            handles: HandleAllocator::new(),
            codec,
            head_dialect,
        })
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Install a batch of methods under `"{name_prefix}:{method}"`.
    pub fn register_service<I>(&self, name_prefix: &str, methods: I) -> Result<(), RpcError>
    where
        I: IntoIterator<Item = (String, Arc<dyn ServiceFunction>)>,
    {
        self.registry.add_service(name_prefix, methods)
    }

    /// Adopt `transport` under a freshly allocated handle and spawn its
    /// inbound read loop. Mirrors `ClientConnection::connect` spawning
    /// its own `read_loop` task at connect time.
    pub fn attach(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Handle {
        let handle = self.handles.alloc();
        self.transports.insert(handle, Arc::clone(&transport));
        let rpc = Arc::clone(self);
        tokio::spawn(async move {
            rpc.read_loop(handle, transport).await;
        });
        handle
    }

    /// Remove `handle`'s transport, complete every session still
    /// pending on it with `ChannelClosed`, and close the channel.
    pub async fn detach(&self, handle: Handle) {
        if let Some((_, transport)) = self.transports.remove(&handle) {
            self.sessions.cancel_all(handle);
            transport.close().await;
        }
    }

    /// Cancel every still-yielded coroutine and detach every transport.
    pub async fn shutdown(&self) {
        self.scheduler.cancel_all();
        let handles: Vec<Handle> = self.transports.iter().map(|entry| *entry.key()).collect();
        for handle in handles {
            self.detach(handle).await;
        }
    }

    fn transport_for(&self, handle: Handle) -> Result<Arc<dyn Transport>, RpcError> {
        self.transports.get(&handle).map(|entry| Arc::clone(entry.value())).ok_or(RpcError::ChannelClosed)
    }

    /// Issue a `Call`, wait for its reply, and return
    /// `(error_code, response_body)` per spec.md §4.6/§7.
    ///
    /// When called from inside a coroutine task (`Scheduler::current()`
    /// is `Some`), suspension rides `Scheduler::yield_for` so the
    /// calling task can itself be resumed out of order by the read
    /// loop. Outside any coroutine — a plain call from "main" context —
    /// a direct `oneshot` channel plays the same role. Either way, the
    /// session's own deadline (driven by `SessionTable::tick`, which
    /// the server loop calls on every pass) is the single timeout
    /// mechanism: neither path races a second, independent timer.
    pub async fn send_sync(
        self: &Arc<Self>,
        handle: Handle,
        function_name: &str,
        body: Value,
        timeout_ms: u64,
    ) -> Result<(i32, Option<Value>), RpcError> {
        match Scheduler::current() {
            Some(coroutine_id) => {
                let rpc = Arc::clone(self);
                let callback: ResponseCallback = Box::new(move |code, value| {
                    let _ = rpc.scheduler.resume(coroutine_id, (code, value));
                });
                self.issue_call(handle, function_name, body, timeout_ms, callback).await?;
                Ok(match self.scheduler.yield_for(0).await {
                    YieldOutcome::Resumed((code, value)) => (code, value),
                    YieldOutcome::TimedOut => (RpcError::RpcTimeout.code(), None),
                    YieldOutcome::Cancelled => (RpcError::ChannelClosed.code(), None),
                })
            },
            None => {
                let (tx, rx) = oneshot::channel();
                let callback: ResponseCallback = Box::new(move |code, value| {
                    let _ = tx.send((code, value));
                });
                self.issue_call(handle, function_name, body, timeout_ms, callback).await?;
                Ok(rx.await.unwrap_or((RpcError::ChannelClosed.code(), None)))
            },
        }
    }

    /// A `Oneway` call: no session is registered, nothing is awaited
    /// past the write itself succeeding.
    pub async fn send_oneway(&self, handle: Handle, function_name: &str, body: Value) -> Result<(), RpcError> {
        let transport = self.transport_for(handle)?;
        self.write_message(transport.as_ref(), function_name, MessageType::Oneway, 0, body).await
    }

    /// Fan `calls` out concurrently and fire once every one of them has
    /// reported (or its own deadline forces it to report
    /// `RpcTimeout`), returning the aggregate code (the first non-zero
    /// code seen, `0` if every call succeeded) alongside each call's
    /// own response body in call order.
    pub async fn send_parallel(
        self: &Arc<Self>,
        calls: Vec<(Handle, String, Value)>,
        timeout_ms: u64,
    ) -> (i32, Vec<Option<Value>>) {
        if calls.is_empty() {
            return (0, Vec::new());
        }

        let num_parallel = calls.len() as u32;
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = std::sync::Mutex::new(Some(done_tx));
        let ctx = ParallelCtx::new(
            num_parallel,
            Box::new(move |code| {
                if let Some(tx) = done_tx.lock().expect("parallel done-signal lock").take() {
                    let _ = tx.send(code);
                }
            }),
        );

        let mut value_rxs = Vec::with_capacity(calls.len());
        for (handle, function_name, body) in calls {
            let (value_tx, value_rx) = oneshot::channel();
            value_rxs.push(value_rx);
            let per_call: ResponseCallback = Box::new(move |_code, value| {
                let _ = value_tx.send(value);
            });
            let wrapped = ctx.wrap(per_call);
            if let Err(e) = self.issue_call(handle, &function_name, body, timeout_ms, wrapped).await {
                ctx.complete_one(e.code());
            }
        }

        let code = done_rx.await.unwrap_or(RpcError::ChannelClosed.code());
        let mut values = Vec::with_capacity(value_rxs.len());
        for rx in value_rxs {
            values.push(rx.await.unwrap_or(None));
        }
        (code, values)
    }

    /// Register `callback` against a fresh session id, then write the
    /// `Call`. Rolls the registration back (without firing `callback`)
    /// if the write itself fails, so a send failure never leaks a
    /// session nobody will ever complete.
    async fn issue_call(
        &self,
        handle: Handle,
        function_name: &str,
        body: Value,
        timeout_ms: u64,
        callback: ResponseCallback,
    ) -> Result<u64, RpcError> {
        let transport = self.transport_for(handle)?;
        let session_id = self.sessions.alloc_session_id();
        self.sessions.register(session_id, handle, timeout_ms, callback)?;
        if let Err(e) = self.write_message(transport.as_ref(), function_name, MessageType::Call, session_id, body).await {
            self.sessions.cancel_pending(session_id);
            return Err(e);
        }
        Ok(session_id)
    }

    /// Encode `(head, body)` against one `Protocol` instance in a
    /// single continuous pass and write the result as one length-framed
    /// message. The shared instance matters: the JSON and BSON codecs
    /// stage body state inside the `Protocol` value itself between
    /// `write_message_begin` and `write_message_end`, so head and body
    /// cannot be encoded independently and spliced together.
    ///
    /// `body` travels on the wire as field `BODY_FIELD_ID` of a
    /// one-field struct rather than as a bare value: none of the three
    /// body codecs can describe a primitive's own wire type once it's
    /// been flattened to bytes (`read_field_begin` is the only place a
    /// type tag precedes a value), so a stub passing `Value::Str(..)`
    /// or `Value::I32(..)` needs the same self-describing frame a
    /// struct's fields already get. `dispatch_inbound` unwraps this on
    /// the way back in.
    async fn write_message(
        &self,
        transport: &dyn Transport,
        function_name: &str,
        mtype: MessageType,
        session_id: u64,
        body: Value,
    ) -> Result<(), RpcError> {
        let mut protocol = self.codec.protocol();
        let dialect = self.head_dialect.codec();
        let mut buf = MemoryBuffer::owned(256);
        dialect.write_head(protocol.as_mut(), &mut buf, function_name, mtype, session_id)?;
        let wrapped = Value::Struct(vec![Field { id: BODY_FIELD_ID, value: body }]);
        encode_value(protocol.as_mut(), &mut buf, &wrapped)?;
        dialect.write_tail(protocol.as_mut(), &mut buf)?;
        FrameCodec::new().write_frame(transport, &buf.into_bytes()).await
    }

    async fn write_exception(
        &self,
        transport: &dyn Transport,
        function_name: &str,
        session_id: u64,
        exception: &RpcException,
    ) -> Result<(), RpcError> {
        let mut protocol = self.codec.protocol();
        let dialect = self.head_dialect.codec();
        let mut buf = MemoryBuffer::owned(256);
        dialect.write_head(protocol.as_mut(), &mut buf, function_name, MessageType::Exception, session_id)?;
        exception.encode(protocol.as_mut(), &mut buf)?;
        dialect.write_tail(protocol.as_mut(), &mut buf)?;
        FrameCodec::new().write_frame(transport, &buf.into_bytes()).await
    }

    /// Read frames off `transport` until the channel closes, dispatching
    /// each one, then tear the connection down.
    async fn read_loop(self: Arc<Self>, handle: Handle, transport: Arc<dyn Transport>) {
        let mut frame = FrameCodec::new();
        loop {
            let payload = match frame.read_frame(transport.as_ref()).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!(%handle, error = %e, "connection read loop ended");
                    break;
                },
            };
            if let Err(e) = self.dispatch_inbound(handle, &transport, payload).await {
                warn!(%handle, error = %e, "failed to dispatch inbound message");
            }
        }
        self.detach(handle).await;
    }

    async fn dispatch_inbound(self: &Arc<Self>, handle: Handle, transport: &Arc<dyn Transport>, payload: Bytes) -> Result<(), RpcError> {
        let mut protocol = self.codec.protocol();
        let dialect = self.head_dialect.codec();
        let mut buf = MemoryBuffer::observe(payload);
        let (function_name, mtype, session_id) = dialect.read_head(protocol.as_mut(), &mut buf)?;

        match mtype {
            MessageType::Call | MessageType::Oneway => {
                let body = decode_value(protocol.as_mut(), &mut buf, TType::Struct)?;
                dialect.read_tail(protocol.as_mut(), &mut buf)?;
                self.dispatch_call(Arc::clone(transport), function_name, mtype, session_id, unwrap_body(body)?);
                Ok(())
            },
            MessageType::Reply => {
                let body = decode_value(protocol.as_mut(), &mut buf, TType::Struct)?;
                dialect.read_tail(protocol.as_mut(), &mut buf)?;
                self.sessions.complete(session_id, 0, Some(unwrap_body(body)?));
                Ok(())
            },
            MessageType::Exception => {
                let exc = RpcException::decode(protocol.as_mut(), &mut buf)?;
                dialect.read_tail(protocol.as_mut(), &mut buf)?;
                self.sessions.complete(session_id, exc.error_code, None);
                Ok(())
            },
        }
    }

    /// Look the method up and run it on a fresh scheduler coroutine so
    /// a handler may itself issue downstream calls (S6) without
    /// blocking this connection's read loop. A miss replies with
    /// `RpcException{ UnknownMethod }` unless the inbound message was
    /// `Oneway`, in which case it is logged and dropped (§7).
    fn dispatch_call(self: &Arc<Self>, transport: Arc<dyn Transport>, function_name: String, mtype: MessageType, session_id: u64, body: Value) {
        match self.registry.lookup(&function_name) {
            Some(handler) => {
                let rpc = Arc::clone(self);
                self.scheduler.start(async move {
                    let outcome = (handler.as_ref())(session_id, body).await;
                    if mtype == MessageType::Oneway {
                        return;
                    }
                    let result = match outcome {
                        ServiceOutcome::Reply(value) => {
                            rpc.write_message(transport.as_ref(), &function_name, MessageType::Reply, session_id, value).await
                        },
                        ServiceOutcome::Oneway => Ok(()),
                        ServiceOutcome::Exception(exc) => rpc.write_exception(transport.as_ref(), &function_name, session_id, &exc).await,
                    };
                    if let Err(e) = result {
                        warn!(error = %e, function = %function_name, "failed to write rpc response");
                    }
                });
            },
            None => {
                if mtype == MessageType::Oneway {
                    warn!(function = %function_name, "oneway call to unknown method dropped");
                    return;
                }
                let rpc = Arc::clone(self);
                self.scheduler.start(async move {
                    let exc = RpcException {
                        error_code: RpcError::UnknownMethod.code(),
                        message: format!("unknown method {function_name}"),
                    };
                    if let Err(e) = rpc.write_exception(transport.as_ref(), &function_name, session_id, &exc).await {
                        warn!(error = %e, "failed to write unknown-method exception");
                    }
                });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::registry::BoxFuture;
    use crate::transport::TcpTransport;

    async fn loopback_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accept = tokio::spawn(async move { listener.accept().await.expect("accept").0 });
        let client = TcpStream::connect(addr).await.expect("connect");
        let server = accept.await.expect("accept task");
        (
            Arc::new(TcpTransport::from_stream(server)) as Arc<dyn Transport>,
            Arc::new(TcpTransport::from_stream(client)) as Arc<dyn Transport>,
        )
    }

    fn echo_service() -> Arc<dyn ServiceFunction> {
        Arc::new(|_session_id: u64, args: Value| -> BoxFuture<'static, ServiceOutcome> { Box::pin(async move { ServiceOutcome::Reply(args) }) })
    }

    fn spawn_ticker(rpc: Arc<Rpc>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                rpc.sessions().tick();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    #[tokio::test]
    async fn send_sync_round_trips_through_a_registered_service() {
        let server = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
        server.register_service("Echo", vec![("say".to_string(), echo_service())]).expect("register");
        let client = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);

        let (server_side, client_side) = loopback_pair().await;
        server.attach(server_side);
        let client_handle = client.attach(client_side);

        let ticker = spawn_ticker(Arc::clone(&client));
        let (code, body) = client
            .send_sync(client_handle, "Echo:say", Value::Str("hi".into()), 2_000)
            .await
            .expect("send_sync");
        ticker.abort();

        assert_eq!(code, 0);
        assert_eq!(body, Some(Value::Str("hi".into())));
    }

    #[tokio::test]
    async fn send_sync_to_unknown_method_returns_unknown_method_exception() {
        let server = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
        let client = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);

        let (server_side, client_side) = loopback_pair().await;
        server.attach(server_side);
        let client_handle = client.attach(client_side);

        let ticker = spawn_ticker(Arc::clone(&client));
        let (code, body) = client
            .send_sync(client_handle, "Echo:missing", Value::Struct(vec![]), 2_000)
            .await
            .expect("send_sync");
        ticker.abort();

        assert_eq!(code, RpcError::UnknownMethod.code());
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn oneway_call_runs_the_handler_without_a_reply() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let handler: Arc<dyn ServiceFunction> =
            Arc::new(move |_session_id: u64, _args: Value| -> BoxFuture<'static, ServiceOutcome> {
                let hits3 = Arc::clone(&hits2);
                Box::pin(async move {
                    hits3.fetch_add(1, Ordering::SeqCst);
                    ServiceOutcome::Oneway
                })
            });

        let server = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
        server.register_service("Notify", vec![("ping".to_string(), handler)]).expect("register");
        let client = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);

        let (server_side, client_side) = loopback_pair().await;
        server.attach(server_side);
        let client_handle = client.attach(client_side);

        client.send_oneway(client_handle, "Notify:ping", Value::Struct(vec![])).await.expect("oneway send");

        // give the handler's scheduler coroutine a moment to run.
        for _ in 0..20 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_parallel_aggregates_every_call() {
        let server = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
        server.register_service("Echo", vec![("say".to_string(), echo_service())]).expect("register");
        let client = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);

        let (server_side, client_side) = loopback_pair().await;
        server.attach(server_side);
        let client_handle = client.attach(client_side);

        let ticker = spawn_ticker(Arc::clone(&client));
        let calls = vec![
            (client_handle, "Echo:say".to_string(), Value::Str("one".into())),
            (client_handle, "Echo:say".to_string(), Value::Str("two".into())),
        ];
        let (code, values) = client.send_parallel(calls, 2_000).await;
        ticker.abort();

        assert_eq!(code, 0);
        assert_eq!(values, vec![Some(Value::Str("one".into())), Some(Value::Str("two".into()))]);
    }

    #[tokio::test]
    async fn send_sync_times_out_when_nothing_answers() {
        let client = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
        // an accepted connection with nobody driving the server half of
        // dispatch on it: the write succeeds, no reply ever arrives.
        let (_server_side, client_side) = loopback_pair().await;
        let client_handle = client.attach(client_side);

        let ticker = spawn_ticker(Arc::clone(&client));
        let (code, body) = client.send_sync(client_handle, "Echo:say", Value::Struct(vec![]), 20).await.expect("send_sync");
        ticker.abort();

        assert_eq!(code, RpcError::RpcTimeout.code());
        assert!(body.is_none());
    }
}
