// SPDX-License-Identifier: Apache-2.0

//! A minimal control-plane client, ported from
//! `source/app/control_client.cpp` / `control_command.{h,cpp}`: connect
//! to a running server, issue one `Control:RunCommand` call carrying
//! the command line as its body, and report the result.
//!
//! `argv` is walked by hand rather than through an argument-parsing
//! crate, matching the original's own three-positional-argument `argv`
//! walk — there's nothing here a parser would buy back.

use std::time::Duration;

use pebble_rpc::codec::head::HeadDialect;
use pebble_rpc::codec::{CodecKind, Field, Value};
use pebble_rpc::error::RpcError;
use pebble_rpc::rpc::Rpc;
use pebble_rpc::url::ServiceUrl;

const CALL_TIMEOUT_MS: u64 = 5_000;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage   : control_client <service_url> <command> [args...]");
        eprintln!("example : control_client tcp://127.0.0.1:10001 Reload");
        eprintln!("example : control_client tcp://127.0.0.1:10001 Reload config");
        std::process::exit(1);
    }

    let service_url = &args[1];
    let command_line = args[2..].join(" ");

    match run_command(service_url, &command_line).await {
        Ok((result, description)) => {
            println!("Result:{result}\nDescription:{description}");
            std::process::exit(0);
        },
        Err(RunCommandError::Timeout) => {
            println!("RunCommand timeout.");
            std::process::exit(1);
        },
        Err(RunCommandError::Failed(code)) => {
            println!("RunCommand failed, ret:{code}");
            std::process::exit(1);
        },
    }
}

enum RunCommandError {
    Timeout,
    Failed(i32),
}

async fn run_command(service_url: &str, command_line: &str) -> Result<(i32, String), RunCommandError> {
    let url = ServiceUrl::parse(service_url).map_err(|e| RunCommandError::Failed(e.code()))?;
    let transport = url.connect().await.map_err(|e| RunCommandError::Failed(e.code()))?;

    let rpc = Rpc::new(CodecKind::Binary, HeadDialect::Thrift);
    let handle = rpc.attach(transport);

    let rpc_ticker = std::sync::Arc::clone(&rpc);
    let ticker = tokio::spawn(async move {
        loop {
            rpc_ticker.sessions().tick();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let (code, body) = rpc.send_sync(handle, "Control:RunCommand", Value::Str(command_line.to_string()), CALL_TIMEOUT_MS).await.map_err(|e| RunCommandError::Failed(e.code()))?;
    ticker.abort();
    rpc.shutdown().await;

    if code == RpcError::RpcTimeout.code() {
        return Err(RunCommandError::Timeout);
    }
    if code != 0 {
        return Err(RunCommandError::Failed(code));
    }

    let (result, description) = match body {
        Some(Value::Struct(fields)) => (result_field(&fields).unwrap_or(code), description_field(&fields).unwrap_or_default()),
        Some(Value::Str(s)) => (code, s),
        _ => (code, String::new()),
    };
    Ok((result, description))
}

fn result_field(fields: &[Field]) -> Option<i32> {
    fields.iter().find_map(|f| match &f.value {
        Value::I32(n) if f.id == 1 => Some(*n),
        _ => None,
    })
}

fn description_field(fields: &[Field]) -> Option<String> {
    fields.iter().find_map(|f| match &f.value {
        Value::Str(s) if f.id == 2 => Some(s.clone()),
        _ => None,
    })
}
