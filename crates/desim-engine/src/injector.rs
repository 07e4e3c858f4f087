//! Cross-thread event injection.

use crate::callback::Callback;
use desim_common::{ContextId, SimError, VirtualTime};
use desim_sync::Mailbox;
use std::sync::Arc;

/// Work handed to an engine by another thread.
#[derive(Debug)]
pub enum Injection {
    /// Schedule `callback` `delay` after the engine's notion of "now" at the
    /// moment it drains the injection.
    Schedule {
        delay: VirtualTime,
        context: ContextId,
        callback: Callback,
    },
    /// Request an immediate stop.
    Stop,
}

/// Handle other threads use to schedule into or stop a running engine.
///
/// Injections queue in a [`Mailbox`]; the engine thread drains them between
/// events, and a real-time driver sleeping on the same mailbox wakes up.
#[derive(Debug, Clone)]
pub struct Injector {
    mailbox: Arc<Mailbox<Injection>>,
}

impl Injector {
    pub(crate) fn new(mailbox: Arc<Mailbox<Injection>>) -> Self {
        Injector { mailbox }
    }

    /// Schedule `callback` with no context.
    pub fn schedule(&self, delay: VirtualTime, callback: Callback) -> Result<(), SimError> {
        self.schedule_with_context(ContextId::NONE, delay, callback)
    }

    /// Schedule `callback` in `context`. Negative delays are rejected here,
    /// before they reach the engine.
    pub fn schedule_with_context(
        &self,
        context: ContextId,
        delay: VirtualTime,
        callback: Callback,
    ) -> Result<(), SimError> {
        if delay.is_negative() {
            return Err(SimError::NegativeInjectionDelay(delay));
        }
        self.mailbox.push(Injection::Schedule {
            delay,
            context,
            callback,
        });
        Ok(())
    }

    /// Schedule `callback` as soon as the engine drains it.
    pub fn schedule_now(&self, callback: Callback) -> Result<(), SimError> {
        self.schedule(VirtualTime::ZERO, callback)
    }

    /// Ask the engine to stop after its current event.
    pub fn stop(&self) {
        self.mailbox.push(Injection::Stop);
    }

    /// Injections not yet drained by the engine.
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}
