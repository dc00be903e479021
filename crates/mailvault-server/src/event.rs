//! The continuation protocol.
//!
//! The unit of asynchronous work is an [`EventHandler`]: a resumable object
//! whose `resume()` is invoked only by the events it is waiting on: a
//! connection becoming ready, a timer firing, or a sub-operation such as a
//! query completing. A handler owning sub-operations must re-check all of
//! them for completion on every invocation, and must tolerate being invoked
//! more than once per logical event.
//!
//! There is no cancel primitive. A continuation that is never re-armed is
//! simply dropped, which is why owners hold strong `Rc` handles while
//! sub-operations hold only [`OwnerRef`] weak back-references: a dead weak
//! reference is a completed cancellation.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// A re-entrant, resumable unit of work.
pub trait EventHandler {
    /// Invoked by an event this handler is waiting on. Must run to
    /// completion without blocking; suspending means returning without
    /// having finished, keeping all state in the handler's own fields.
    fn resume(&mut self);
}

/// A strong, shared handle to a continuation. Held by the owner.
pub type HandlerRef = Rc<RefCell<dyn EventHandler>>;

/// A non-owning back-reference from a sub-operation to its owner.
pub type OwnerRef = Weak<RefCell<dyn EventHandler>>;

/// Notifies the owner behind `owner`, if it is still alive.
///
/// A notification that arrives while the owner is already running (the
/// owner synchronously caused the event from inside its own `resume()`) is
/// skipped: the running invocation re-checks its sub-operations before
/// returning, so the completion is not lost.
pub fn notify(owner: &OwnerRef) {
    let Some(handler) = owner.upgrade() else {
        return;
    };
    match handler.try_borrow_mut() {
        Ok(mut h) => h.resume(),
        Err(_) => {
            tracing::trace!("notification for a handler that is already running; skipped");
        }
    }
}
