//! Per-call context and envelopes.

use std::sync::{Arc, Mutex};

use apache_avro::types::Value;
use parley_core::Message;
use parley_wire::Metadata;

use crate::Extensions;

/// Call-scoped storage shared between middleware, hooks, and the handler.
///
/// A cheap clonable handle over an [`Extensions`] map. Each call gets a
/// fresh one; there is no cross-call state.
#[derive(Clone, Default)]
pub struct Locals {
    inner: Arc<Mutex<Extensions>>,
}

impl Locals {
    /// Create an empty locals map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed locals from an existing extensions map.
    pub fn from_extensions(ext: Extensions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ext)),
        }
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.inner.lock().expect("locals poisoned").insert(value)
    }

    /// Clone out the value of type `T`, if present.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner
            .lock()
            .expect("locals poisoned")
            .get::<T>()
            .cloned()
    }

    /// Remove and return the value of type `T`, if present.
    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.lock().expect("locals poisoned").remove::<T>()
    }

    /// Whether a value of type `T` is present.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.inner
            .lock()
            .expect("locals poisoned")
            .contains::<T>()
    }

    /// Run `f` with the locked extensions map.
    pub fn with<R>(&self, f: impl FnOnce(&mut Extensions) -> R) -> R {
        f(&mut self.inner.lock().expect("locals poisoned"))
    }
}

impl std::fmt::Debug for Locals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.lock().expect("locals poisoned").fmt(f)
    }
}

/// The per-call context handed to middleware, hooks, and handlers.
///
/// Clonable; clones observe the same [`Locals`].
#[derive(Clone)]
pub struct CallContext {
    locals: Locals,
    message: Arc<Message>,
    channel: crate::ChannelInfo,
}

impl CallContext {
    pub(crate) fn new(locals: Locals, message: Arc<Message>, channel: crate::ChannelInfo) -> Self {
        Self {
            locals,
            message,
            channel,
        }
    }

    /// Call-scoped storage.
    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    /// The message being called.
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// The carrying channel (incoming on the server, outgoing on the client).
    pub fn channel(&self) -> &crate::ChannelInfo {
        &self.channel
    }
}

/// The request envelope visible to the forward phase of middleware.
#[derive(Debug)]
pub struct WrappedRequest {
    /// The decoded request record.
    pub request: Value,
    /// Binary headers traveling with the request.
    pub headers: Metadata,
}

impl WrappedRequest {
    /// Wrap a request value with empty headers.
    pub fn new(request: Value) -> Self {
        Self {
            request,
            headers: Metadata::new(),
        }
    }
}

/// The response envelope visible to the reverse phase of middleware.
///
/// At most one of `response`/`error` is set; one-way messages set neither.
#[derive(Debug, Default)]
pub struct WrappedResponse {
    /// The decoded response, on success.
    pub response: Option<Value>,
    /// The error-union value, on a declared or system error.
    pub error: Option<Value>,
    /// Binary headers traveling with the response.
    pub headers: Metadata,
}

impl WrappedResponse {
    /// Create an empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the envelope carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
