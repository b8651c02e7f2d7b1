use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pebble_rpc::codec::head::HeadDialect;
use pebble_rpc::codec::{CodecKind, Value};
use pebble_rpc::error::RpcError;
use pebble_rpc::registry::{BoxFuture, ServiceFunction, ServiceOutcome};
use pebble_rpc::rpc::Rpc;
use pebble_rpc::server::Server;
use pebble_rpc::transport::TcpTransport;

fn echo() -> Arc<dyn ServiceFunction> {
    Arc::new(|_session_id: u64, args: Value| -> BoxFuture<'static, ServiceOutcome> {
        Box::pin(async move { ServiceOutcome::Reply(args) })
    })
}

fn slow_echo(delay_ms: u64) -> Arc<dyn ServiceFunction> {
    Arc::new(move |_session_id: u64, args: Value| -> BoxFuture<'static, ServiceOutcome> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            ServiceOutcome::Reply(args)
        })
    })
}

fn counting_oneway(count: Arc<AtomicUsize>) -> Arc<dyn ServiceFunction> {
    Arc::new(move |_session_id: u64, _args: Value| -> BoxFuture<'static, ServiceOutcome> {
        let count = Arc::clone(&count);
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            ServiceOutcome::Oneway
        })
    })
}

/// Drives a client-side [`Rpc`]'s session deadlines the way
/// [`Server::serve`] drives a bound one's, for tests that only need
/// the outbound half of the event loop.
fn spawn_ticker(rpc: Arc<Rpc>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            rpc.sessions().tick();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
}

#[tokio::test]
async fn a_client_exercises_sync_parallel_oneway_and_timeout_calls_against_a_bound_server() {
    let oneway_count = Arc::new(AtomicUsize::new(0));

    let server_rpc = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
    server_rpc
        .register_service(
            "Demo",
            vec![
                ("echo".to_string(), echo()),
                ("slow".to_string(), slow_echo(200)),
                ("notify".to_string(), counting_oneway(Arc::clone(&oneway_count))),
            ],
        )
        .expect("register services");

    let server = Arc::new(Server::new(Arc::clone(&server_rpc)).on_stop(|| 0));
    let addr = server.bind_tcp("127.0.0.1:0").await.expect("bind");
    let server_task = tokio::spawn(async move {
        let _ = server.serve().await;
    });

    let client_rpc = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let client_handle = client_rpc.attach(Arc::new(TcpTransport::from_stream(stream)));
    let ticker = spawn_ticker(Arc::clone(&client_rpc));

    let (code, body) = client_rpc
        .send_sync(client_handle, "Demo:echo", Value::Str("hi".into()), 2_000)
        .await
        .expect("send_sync");
    assert_eq!(code, 0);
    assert_eq!(body, Some(Value::Str("hi".into())));

    client_rpc.send_oneway(client_handle, "Demo:notify", Value::Bool(true)).await.expect("send_oneway");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(oneway_count.load(Ordering::SeqCst), 1);

    let calls = vec![
        (client_handle, "Demo:echo".to_string(), Value::I32(1)),
        (client_handle, "Demo:echo".to_string(), Value::I32(2)),
        (client_handle, "Demo:echo".to_string(), Value::I32(3)),
    ];
    let (agg_code, results) = client_rpc.send_parallel(calls, 2_000).await;
    assert_eq!(agg_code, 0);
    assert_eq!(results, vec![Some(Value::I32(1)), Some(Value::I32(2)), Some(Value::I32(3))]);

    let (timeout_code, timeout_body) = client_rpc
        .send_sync(client_handle, "Demo:slow", Value::Str("too slow".into()), 20)
        .await
        .expect("send_sync call itself should not fail, only time out");
    assert_eq!(timeout_code, RpcError::RpcTimeout.code());
    assert_eq!(timeout_body, None);

    ticker.abort();
    client_rpc.shutdown().await;
    server_task.abort();
}
