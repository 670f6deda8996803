//! Services and typed method registration.
//!
//! A service is a named collection of methods a server exposes. Each
//! method is registered with a typed handler; the registration adapter
//! owns the decode/invoke/encode dance, so the dispatcher only ever sees
//! opaque body bytes:
//!
//! ```ignore
//! let service = Service::new("Foo")
//!     .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) });
//! server.register(service)?;
//! ```
//!
//! Handlers return `anyhow::Result`; an `Err` is rendered into the
//! response header's error field and the placeholder body is sent in
//! place of a reply.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::CodecKind;

/// The stored form of a handler: body bytes in, reply bytes out.
type MethodFn =
    Box<dyn Fn(CodecKind, Vec<u8>) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;

struct Method {
    handler: MethodFn,
    calls: AtomicU64,
}

/// A named set of callable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Service {
    /// Starts an empty service. Name validity (non-empty, no `.`) is
    /// checked when the service is registered with a server.
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Registers a typed method handler. Registering the same name twice
    /// replaces the earlier handler.
    ///
    /// The bounds are the acceptance rule: one deserializable argument
    /// value in, one serializable reply out, errors of the framework's
    /// error kind.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let adapter: MethodFn = Box::new(move |kind, body| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: A = kind.decode(&body)?;
                let reply = handler(args).await?;
                Ok(kind.encode(&reply)?)
            })
        });
        debug!("rpc server: register {}.{}", self.name, name);
        self.methods.insert(
            name.to_string(),
            Method { handler: adapter, calls: AtomicU64::new(0) },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times a method has been dispatched, or zero for an
    /// unknown method name.
    pub fn call_count(&self, method: &str) -> u64 {
        self.methods
            .get(method)
            .map(|m| m.calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Looks up a method and produces its invocation future, bumping the
    /// call counter. `None` when the method does not exist.
    pub(crate) fn invoke(
        &self,
        method: &str,
        kind: CodecKind,
        body: Vec<u8>,
    ) -> Option<BoxFuture<'static, anyhow::Result<Vec<u8>>>> {
        let m = self.methods.get(method)?;
        m.calls.fetch_add(1, Ordering::Relaxed);
        Some((m.handler)(kind, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    fn sum_service() -> Service {
        Service::new("Foo").method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
    }

    #[tokio::test]
    async fn invoke_decodes_args_and_encodes_reply() {
        let service = sum_service();
        let kind = CodecKind::Bin;
        let body = kind.encode(&Args { num1: 1, num2: 2 }).unwrap();

        let reply = service
            .invoke("Sum", kind, body)
            .expect("Sum is registered")
            .await
            .expect("handler succeeds");
        let total: i32 = kind.decode(&reply).unwrap();
        assert_eq!(total, 3);
        assert_eq!(service.call_count("Sum"), 1);
    }

    #[tokio::test]
    async fn invoke_surfaces_handler_errors() {
        let service = Service::new("Foo").method("Fail", |_: i32| async move {
            Err::<i32, _>(anyhow::anyhow!("it broke"))
        });
        let kind = CodecKind::Bin;
        let body = kind.encode(&5_i32).unwrap();

        let err = service
            .invoke("Fail", kind, body)
            .expect("Fail is registered")
            .await
            .expect_err("handler fails");
        assert!(err.to_string().contains("it broke"));
    }

    #[test]
    fn unknown_method_is_none() {
        let service = sum_service();
        assert!(service
            .invoke("Missing", CodecKind::Bin, Vec::new())
            .is_none());
        assert_eq!(service.call_count("Missing"), 0);
    }
}
