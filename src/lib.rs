// SPDX-License-Identifier: Apache-2.0

//! A server-side RPC framework: a wire codec, a correlation table that
//! turns replies back into the calls that sent them, a coroutine
//! scheduler that lets a stub call read like a blocking function, a
//! parallel-call aggregator, and a service dispatch table — wrapped in
//! an event loop an application runs as its main loop.

pub mod buffer;
pub mod cfg;
pub mod codec;
pub mod error;
pub mod handle;
pub mod parallel;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;
pub mod url;

pub use error::RpcError;
pub use handle::Handle;
pub use rpc::Rpc;
pub use server::Server;
