//! Category-based routing of inbound envelopes.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
};

use thiserror::Error;

use crate::envelope::{Category, CodecError, Envelope};

/// Failure reported by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Unexpected payload: {0}")]
    Payload(#[from] CodecError),
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Handles envelopes of one category, with mutable access to a context `C`.
pub trait Handler<C>: Send {
    /// Handle one envelope.
    ///
    /// # Errors
    /// Errors are logged by the dispatcher and never propagate further.
    fn handle(&mut self, ctx: &mut C, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<C, F> Handler<C> for F
where
    F: FnMut(&mut C, &Envelope) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, ctx: &mut C, envelope: &Envelope) -> Result<(), HandlerError> {
        self(ctx, envelope)
    }
}

/// What happened to a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// No handler registered for the category; the envelope was dropped.
    Unhandled,
    /// The handler returned an error or panicked.
    Failed,
}

/// Routes envelopes to at most one handler per category.
pub struct Dispatcher<C> {
    handlers: HashMap<Category, Box<dyn Handler<C>>>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Dispatcher<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `category`, replacing any previous one.
    pub fn on<H>(&mut self, category: Category, handler: H)
    where
        H: Handler<C> + 'static,
    {
        if self.handlers.insert(category, Box::new(handler)).is_some() {
            tracing::debug!(%category, "Replaced handler");
        } else {
            tracing::debug!(%category, "Registered handler");
        }
    }

    /// Remove the handler for `category`.
    pub fn off(&mut self, category: Category) -> bool {
        self.handlers.remove(&category).is_some()
    }

    #[must_use]
    pub fn handles(&self, category: Category) -> bool {
        self.handlers.contains_key(&category)
    }

    /// Deliver one envelope. Never fails; failures are logged.
    pub fn dispatch(&mut self, ctx: &mut C, envelope: &Envelope) -> Outcome {
        let category = envelope.category();
        let Some(handler) = self.handlers.get_mut(&category) else {
            tracing::debug!(%category, id = envelope.id(), "No handler for category");
            return Outcome::Unhandled;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(ctx, envelope))) {
            Ok(Ok(())) => Outcome::Handled,
            Ok(Err(e)) => {
                tracing::error!(%category, id = envelope.id(), "Error handling message: {e}");
                Outcome::Failed
            }
            Err(_) => {
                tracing::error!(%category, id = envelope.id(), "Handler panicked");
                Outcome::Failed
            }
        }
    }
}
