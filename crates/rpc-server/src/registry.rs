//! Name → typed-invoker table.
//!
//! Rust has no variadic generics, so heterogeneous typed handlers are
//! modeled with a handler's parameters collapsed to one codec-decodable
//! tuple type `Args` (use `()` for no arguments, a bare type for one, a
//! tuple for several), erased at registration time to a
//! `Fn(ConnectionContext, bytes) -> bytes-or-nothing` closure. The registry
//! only ever stores the erased form.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rpc_transport::Codec;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::ConnectionContext;
use crate::error::DispatchError;

/// Whether a registered handler responds inline or defers the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// The handler's return value becomes the response body immediately.
    Sync,
    /// The handler responds later via `ConnectionContext::pack_and_response`;
    /// the dispatcher sends nothing automatically on success (a pre-invocation
    /// dispatch failure, e.g. an argument decode error, still gets an error
    /// response — the handler body never ran to defer one itself).
    Async,
}

type ErasedInvoker<C> =
    Arc<dyn Fn(ConnectionContext<C>, Vec<u8>) -> Pin<Box<dyn Future<Output = Option<Vec<u8>>> + Send>> + Send + Sync>;

/// A single registered handler, erased to bytes-in/bytes-out.
pub struct Handler<C: Codec> {
    /// Whether the dispatcher should expect an automatic response.
    pub mode: HandlerMode,
    pub(crate) invoke: ErasedInvoker<C>,
}

impl<C: Codec> Clone for Handler<C> {
    fn clone(&self) -> Self {
        Self { mode: self.mode, invoke: self.invoke.clone() }
    }
}

/// Packs a successful response body: status `0` followed by the packed value.
pub(crate) fn success_body<C: Codec, T: Serialize>(codec: &C, value: &T) -> Option<Vec<u8>> {
    let mut body = vec![0u8];
    body.extend(codec.pack(value).ok()?);
    Some(body)
}

/// Packs an error response body: status `1` followed by the packed message.
pub(crate) fn error_body<C: Codec>(codec: &C, message: &str) -> Vec<u8> {
    let mut body = vec![1u8];
    body.extend(codec.pack(&message.to_string()).unwrap_or_default());
    body
}

/// Name → [`Handler`] map. Frozen by convention once [`crate::Server::run`]
/// starts accepting connections; see that type for the enforcement.
pub struct HandlerRegistry<C: Codec> {
    codec: Arc<C>,
    handlers: HashMap<String, Handler<C>>,
}

impl<C: Codec> HandlerRegistry<C> {
    /// Creates an empty registry using `codec` to decode arguments and
    /// encode return values.
    pub fn new(codec: Arc<C>) -> Self {
        Self { codec, handlers: HashMap::new() }
    }

    /// Registers a synchronous handler: its return value becomes the
    /// response body. `Args` is the decoded argument tuple (`()` for none);
    /// `Ret` is the packed success payload. A handler that returns
    /// `Err(message)` produces an error response without closing the
    /// connection.
    pub fn register_handler<F, Fut, Args, Ret>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionContext<C>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Ret, String>> + Send + 'static,
        Args: DeserializeOwned + Send + 'static,
        Ret: Serialize + Send + 'static,
    {
        let handler = Arc::new(handler);
        let codec = self.codec.clone();
        let invoke: ErasedInvoker<C> = Arc::new(move |ctx, body| {
            let handler = handler.clone();
            let codec = codec.clone();
            Box::pin(async move {
                let args: Args = match codec.unpack(&body) {
                    Ok(a) => a,
                    Err(e) => {
                        return Some(error_body(codec.as_ref(), &DispatchError::Decode(e.to_string()).to_string()))
                    }
                };
                match handler(ctx, args).await {
                    // The handler's own error message is what a caller sees; it is not
                    // wrapped in `DispatchError` (that's reserved for dispatch-machinery
                    // failures: decode errors, unknown methods, encode failures).
                    Ok(ret) => success_body(codec.as_ref(), &ret).or_else(|| {
                        Some(error_body(
                            codec.as_ref(),
                            &DispatchError::Handler("failed to encode response".to_string()).to_string(),
                        ))
                    }),
                    Err(msg) => Some(error_body(codec.as_ref(), &msg)),
                }
            })
        });
        self.handlers.insert(name.into(), Handler { mode: HandlerMode::Sync, invoke });
    }

    /// Registers an async handler: it receives the decoded arguments and
    /// the connection context, and is expected to copy out
    /// `ctx.request_id()` and later call `ctx.pack_and_response(..)` itself.
    /// Nothing is sent automatically on success; a failure to decode the
    /// arguments still produces an error response, since the handler body
    /// never ran to defer one itself.
    pub fn register_handler_async<F, Fut, Args>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionContext<C>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        Args: DeserializeOwned + Send + 'static,
    {
        let handler = Arc::new(handler);
        let codec = self.codec.clone();
        let invoke: ErasedInvoker<C> = Arc::new(move |ctx, body| {
            let handler = handler.clone();
            let codec = codec.clone();
            Box::pin(async move {
                let args: Args = match codec.unpack(&body) {
                    Ok(a) => a,
                    Err(e) => {
                        return Some(error_body(codec.as_ref(), &DispatchError::Decode(e.to_string()).to_string()))
                    }
                };
                handler(ctx, args).await;
                None
            })
        });
        self.handlers.insert(name.into(), Handler { mode: HandlerMode::Async, invoke });
    }

    /// Looks up a handler by name, cloning it out (cheap: an `Arc` clone
    /// plus a `Copy` enum) so the caller never holds the registry's lock
    /// across an `.await`.
    pub fn lookup(&self, name: &str) -> Option<Handler<C>> {
        self.handlers.get(name).cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
