// SPDX-License-Identifier: Apache-2.0

//! Service Registry: maps a wire `"ServiceName:MethodName"` function
//! name to the handler that runs it.
//!
//! `DashMap` is used here the same way it is for the correlation
//! tables elsewhere in this crate, over a `Mutex<HashMap>`.
//! Registration is the one place that needs more than per-key
//! atomicity: installing a whole service's methods is all-or-nothing,
//! so a coarse `Mutex` guards the multi-key check-then-insert while
//! `lookup` still goes straight through `DashMap`'s own per-key
//! locking.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::codec::Value;
use crate::codec::head::RpcException;
use crate::error::RpcError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler hands back to the dispatcher.
pub enum ServiceOutcome {
    /// A normal reply body, to be encoded and written back as `Reply`.
    Reply(Value),
    /// The inbound message was `Oneway`; there is nothing to send back.
    Oneway,
    /// The handler raised a typed exception; translated to a wire
    /// `Exception` message carrying `error_code`.
    Exception(RpcException),
}

/// A registered method: takes the inbound `session_id` and the already
/// body-decoded argument [`Value`], returns the outcome asynchronously
/// so handlers may themselves issue downstream RPC calls.
///
/// The argument arrives decoded rather than as raw bytes because the
/// JSON and BSON body codecs stage the decoded body inside their own
/// `Protocol` state as part of reading the message envelope — the
/// dispatcher has already paid for the decode by the time a handler
/// runs, and there is no separable byte range left to hand it instead.
pub trait ServiceFunction: Fn(u64, Value) -> BoxFuture<'static, ServiceOutcome> + Send + Sync {}

impl<T> ServiceFunction for T where T: Fn(u64, Value) -> BoxFuture<'static, ServiceOutcome> + Send + Sync {}

#[derive(Default)]
pub struct ServiceRegistry {
    by_name: DashMap<String, Arc<dyn ServiceFunction>>,
    insert_lock: Mutex<()>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `methods` under `"{name_prefix}:{method_name}"`. Fails
    /// with `ServiceAlreadyExisted`, leaving the registry untouched,
    /// if any resulting key already exists.
    pub fn add_service<I>(&self, name_prefix: &str, methods: I) -> Result<(), RpcError>
    where
        I: IntoIterator<Item = (String, Arc<dyn ServiceFunction>)>,
    {
        let keyed: Vec<(String, Arc<dyn ServiceFunction>)> = methods
            .into_iter()
            .map(|(method, handler)| (format!("{name_prefix}:{method}"), handler))
            .collect();

        let _guard = self.insert_lock.lock().expect("registry insert lock");
        if keyed.iter().any(|(key, _)| self.by_name.contains_key(key)) {
            return Err(RpcError::ServiceAlreadyExisted);
        }
        for (key, handler) in keyed {
            self.by_name.insert(key, handler);
        }
        Ok(())
    }

    pub fn lookup(&self, function_name: &str) -> Option<Arc<dyn ServiceFunction>> {
        self.by_name.get(function_name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_service() -> Arc<dyn ServiceFunction> {
        Arc::new(|_session_id: u64, args: Value| -> BoxFuture<'static, ServiceOutcome> {
            Box::pin(async move { ServiceOutcome::Reply(args) })
        })
    }

    #[tokio::test]
    async fn add_service_installs_methods_under_name_prefix() {
        let registry = ServiceRegistry::new();
        registry
            .add_service("Echo", vec![("say".to_string(), echo_service())])
            .expect("add service");

        let handler = registry.lookup("Echo:say").expect("method registered");
        match (handler.as_ref())(7, Value::Str("hi".into())).await {
            ServiceOutcome::Reply(Value::Str(body)) => assert_eq!(body, "hi"),
            _ => panic!("expected a reply outcome"),
        }
    }

    #[test]
    fn lookup_of_unknown_method_returns_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.lookup("Echo:say").is_none());
    }

    #[test]
    fn duplicate_registration_leaves_existing_methods_untouched() {
        let registry = ServiceRegistry::new();
        registry
            .add_service("Echo", vec![("say".to_string(), echo_service())])
            .expect("first add");

        let err = registry
            .add_service(
                "Echo",
                vec![("say".to_string(), echo_service()), ("shout".to_string(), echo_service())],
            )
            .expect_err("duplicate key in this batch");
        assert_eq!(err, RpcError::ServiceAlreadyExisted);

        assert!(registry.lookup("Echo:say").is_some());
        assert!(registry.lookup("Echo:shout").is_none());
        assert_eq!(registry.len(), 1);
    }
}
