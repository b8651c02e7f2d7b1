// SPDX-License-Identifier: Apache-2.0

//! The framework's canonical smoke-test service: one `HelloWorld`
//! service with a single `hello` method that echoes its argument back,
//! ported from `example/hello_world/server.cpp`'s `HelloWorldService`.

use std::sync::Arc;

use anyhow::{Context, Result};
use pebble_rpc::cfg::cli::resolve_config_path;
use pebble_rpc::cfg::config::Config;
use pebble_rpc::cfg::logger::init_logger;
use pebble_rpc::codec::head::HeadDialect;
use pebble_rpc::codec::{CodecKind, Value};
use pebble_rpc::registry::{BoxFuture, ServiceOutcome};
use pebble_rpc::rpc::Rpc;
use pebble_rpc::server::Server;
use pebble_rpc::url::ServiceUrl;
use tracing::info;

fn hello(_session_id: u64, args: Value) -> BoxFuture<'static, ServiceOutcome> {
    Box::pin(async move {
        info!(?args, "receive rpc request");
        ServiceOutcome::Reply(args)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("cfg/logger.yaml").context("failed to init logger")?;

    let cfg = resolve_config_path("cfg/pebble.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let rpc = Rpc::new(cfg.rpc.codec.into(), HeadDialect::from(cfg.rpc.head_dialect));
    rpc.register_service("HelloWorld", vec![("hello".to_string(), Arc::new(hello))])
        .context("failed to register HelloWorld service")?;

    let server = Arc::new(Server::new(Arc::clone(&rpc)));
    for addr in &cfg.rpc.listen {
        let url = ServiceUrl::parse(addr).with_context(|| format!("invalid listen address {addr}"))?;
        let bound = server.bind_tcp(&url.authority()).await.with_context(|| format!("failed to bind {addr}"))?;
        info!(%bound, "listening");
    }

    server.serve().await.context("server loop exited with an error")?;
    Ok(())
}
