// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::warn;
use serde_json::Value;
use std::collections::HashMap;

use crate::Error;

/// A request handler bound to a route name.
pub type Handler<C> = fn(&mut C, &Value) -> Value;

/// Dispatch table from request names to handler functions.
pub struct Router<C> {
    routes: HashMap<&'static str, Handler<C>>,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<C> Router<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a request name.
    ///
    /// The first registration wins; duplicates are dropped with a warning.
    ///
    pub fn register(&mut self, request: &'static str, handler: Handler<C>) {
        if self.routes.contains_key(request) {
            warn!("The route '{request}' already exists.");
            return;
        }

        self.routes.insert(request, handler);
    }

    /// Dispatch a request envelope to its handler.
    ///
    /// The envelope must carry a string `request` and a `data` member
    /// (which may be null).
    ///
    /// # Errors
    /// * `Error::MalformedRequest` when the envelope is not well formed.
    /// * `Error::RouteNotFound` when no handler matches the request name.
    ///
    pub fn dispatch(&self, context: &mut C, message: &Value) -> Result<Value, Error> {
        let Some(envelope) = message.as_object() else {
            return Err(Error::MalformedRequest());
        };

        let Some(request) = envelope.get("request").and_then(Value::as_str) else {
            return Err(Error::MalformedRequest());
        };

        let Some(data) = envelope.get("data") else {
            return Err(Error::MalformedRequest());
        };

        let Some(handler) = self.routes.get(request) else {
            return Err(Error::RouteNotFound(request.to_string()));
        };

        Ok(handler(context, data))
    }
}
