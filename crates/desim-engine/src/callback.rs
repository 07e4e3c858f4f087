//! Type-erased deferred invocation.
//!
//! A [`Callback`] binds a handler and its arguments when an event is
//! scheduled and runs them when the event fires. Invocation consumes the
//! callback, so an event can never run its handler twice.

use crate::SimulationEngine;
use desim_common::SimError;
use std::fmt;

/// Result returned by every event handler.
pub type HandlerResult = Result<(), SimError>;

type Handler = Box<dyn FnOnce(&mut SimulationEngine) -> HandlerResult + Send>;

/// A bound event handler.
///
/// Handlers receive the engine that fired them, which is how they read
/// `now()` and schedule follow-up events. State shared between several
/// pending callbacks should be held through `Arc`.
pub struct Callback {
    handler: Handler,
    debug_name: Option<&'static str>,
}

impl Callback {
    /// Wrap a closure taking the engine.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnOnce(&mut SimulationEngine) -> HandlerResult + Send + 'static,
    {
        Callback {
            handler: Box::new(handler),
            debug_name: Some(std::any::type_name::<F>()),
        }
    }

    /// Bind `args` to `handler` now; the pair is invoked when the event fires.
    pub fn bind<F, A>(handler: F, args: A) -> Self
    where
        F: FnOnce(&mut SimulationEngine, A) -> HandlerResult + Send + 'static,
        A: Send + 'static,
    {
        Callback {
            handler: Box::new(move |engine| handler(engine, args)),
            debug_name: Some(std::any::type_name::<F>()),
        }
    }

    /// Wrap a zero-argument closure that needs neither the engine nor error
    /// reporting.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Callback {
            handler: Box::new(move |_| {
                f();
                Ok(())
            }),
            debug_name: Some(std::any::type_name::<F>()),
        }
    }

    /// A callback that does nothing.
    pub fn noop() -> Self {
        Callback {
            handler: Box::new(|_| Ok(())),
            debug_name: Some("noop"),
        }
    }

    /// Replace the diagnostic name.
    pub fn with_debug_name(mut self, name: &'static str) -> Self {
        self.debug_name = Some(name);
        self
    }

    /// Diagnostic name of the bound handler, if one is known.
    pub fn debug_name(&self) -> Option<&'static str> {
        self.debug_name
    }

    /// Run the handler, consuming the callback.
    pub fn invoke(self, engine: &mut SimulationEngine) -> HandlerResult {
        (self.handler)(engine)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("handler", &self.debug_name.unwrap_or("<anonymous>"))
            .finish()
    }
}
