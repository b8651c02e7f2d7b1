use pebble_rpc::transport::Transport;
use pebble_rpc::url::ServiceUrl;

#[tokio::test]
async fn service_url_connects_a_real_tcp_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        pebble_rpc::transport::TcpTransport::from_stream(stream)
    });

    let url = ServiceUrl::parse(&format!("tcp://{addr}")).expect("parse");
    let client = url.connect().await.expect("connect");
    let server = accept.await.expect("accept task");

    client.write(b"ping").await.expect("write");
    let got = server.read_exact(4).await.expect("read");
    assert_eq!(got.as_ref(), b"ping");
}

#[tokio::test]
async fn service_url_rejects_an_unreachable_tcp_address() {
    let url = ServiceUrl::parse("tcp://127.0.0.1:1").expect("parse");
    assert!(url.connect().await.is_err());
}
