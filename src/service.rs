//! Service registration and typed dispatch.
//!
//! A [`Service`] is a named collection of methods addressable as
//! `"<Service>.<Method>"`. Methods are registered through a typed
//! builder: the handler is an async closure `args -> Result<reply, E>`
//! and the builder owns the concrete argument and reply types, erasing
//! the handler to one that decodes argument bytes, invokes, and
//! encodes the reply. The wire layers only ever see bytes.
//!
//! # Example
//!
//! ```
//! use wirecall::Service;
//!
//! let svc = Service::new("Arith")
//!     .method("Mul", |args: (i64, i64)| async move {
//!         Ok::<i64, String>(args.0 * args.1)
//!     });
//! assert_eq!(svc.name(), "Arith");
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPack;

/// Boxed future returned by erased method handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one method invocation: encoded reply bytes, or the error
/// message carried back in the response header.
pub type MethodResult = std::result::Result<Vec<u8>, String>;

/// Type-erased method handler operating on payload bytes.
pub trait MethodHandler: Send + Sync + 'static {
    /// Decode the argument bytes, run the method, encode the reply.
    fn call(&self, args: Bytes) -> BoxFuture<'static, MethodResult>;
}

/// Adapter that owns the concrete argument and reply types of a
/// handler and erases it to a bytes-in/bytes-out [`MethodHandler`].
pub struct TypedMethod<F, A, R, E, Fut>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(A) -> (R, E, Fut)>,
}

impl<F, A, R, E, Fut> TypedMethod<F, A, R, E, Fut>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    /// Wrap a typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, A, R, E, Fut> MethodHandler for TypedMethod<F, A, R, E, Fut>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    fn call(&self, args: Bytes) -> BoxFuture<'static, MethodResult> {
        let parsed: A = match MsgPack::decode(&args) {
            Ok(v) => v,
            Err(e) => {
                let msg = format!("decoding arguments: {}", e);
                return Box::pin(async move { Err(msg) });
            }
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            let reply = fut.await.map_err(|e| e.to_string())?;
            MsgPack::encode(&reply).map_err(|e| format!("encoding reply: {}", e))
        })
    }
}

/// One registered method: the erased handler plus a call counter.
pub struct Method {
    handler: Box<dyn MethodHandler>,
    calls: AtomicU64,
}

impl Method {
    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("calls", &self.calls.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A named collection of methods registered with a server.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// Start building a service with the given name.
    ///
    /// Names are validated at registration time: they must be
    /// non-empty, contain no `.`, and start with an uppercase letter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register a method handler.
    ///
    /// Re-registering a method name replaces the previous handler.
    pub fn method<F, A, R, E, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                handler: Box::new(TypedMethod::new(handler)),
                calls: AtomicU64::new(0),
            }),
        );
        self
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn get_method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    /// Registered method names and their entries, for the debug page.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &Arc<Method>)> {
        self.methods.iter().map(|(name, m)| (name.as_str(), m))
    }

    /// Invoke a method: bump its call counter and run the handler on
    /// the argument bytes.
    pub async fn call(&self, method: &Method, args: Bytes) -> MethodResult {
        method.calls.fetch_add(1, Ordering::Relaxed);
        method.handler.call(args).await
    }
}

/// Service names mirror exported type names: capitalized, dot-free.
pub(crate) fn valid_service_name(name: &str) -> bool {
    !name.contains('.')
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
}
