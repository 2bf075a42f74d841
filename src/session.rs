//! Debug-session state machine.
//!
//! The session is driven by the debug events of the suspended target and
//! visits exactly three states: waiting for the process-creation event (the
//! import table is rewritten there, before the loader reads it), waiting for
//! the loader's initial breakpoint (forwards are resolved there, after the
//! loader has filled the new table), and detaching. The machine itself is
//! pure; the OS layer feeds it events and executes the actions it emits.

use crate::warn;

/// Exception code of the loader's initial breakpoint.
pub const EXCEPTION_BREAKPOINT_CODE: u32 = 0x8000_0003;

/// Where the session currently is in the target's startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No process-creation event seen yet.
    WaitingForCreate,
    /// Imports rewritten; the loader has not hit its initial breakpoint.
    WaitingForBreakpoint,
    /// All work done (or the target is gone); detach and stop.
    Detaching,
}

/// A debug event, reduced to what the session cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ProcessCreated,
    Exception { code: u32 },
    ProcessExited,
    /// Any other debug event (thread creation, DLL loads, debug strings).
    Other { code: u32 },
}

/// Work the OS layer has to perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Rewrite the suspended target's import directory.
    RewriteImports,
    /// Copy resolved forwarding targets over their source slots.
    ResolveForwards,
    /// Stop debugging and let the target run free.
    Detach,
}

/// Advances the session by one debug event.
///
/// Out-of-order events (a breakpoint before the creation event, a duplicate
/// creation event) are logged and ignored rather than treated as fatal; the
/// target's behavior is not under our control. A process exit always wins and
/// moves straight to detaching.
pub fn advance(state: SessionState, event: &SessionEvent) -> (SessionState, Vec<SessionAction>) {
    match (state, event) {
        (_, SessionEvent::ProcessExited) => (SessionState::Detaching, vec![SessionAction::Detach]),

        (SessionState::WaitingForCreate, SessionEvent::ProcessCreated) => (
            SessionState::WaitingForBreakpoint,
            vec![SessionAction::RewriteImports],
        ),
        (SessionState::WaitingForCreate, SessionEvent::Exception { code })
            if *code == EXCEPTION_BREAKPOINT_CODE =>
        {
            warn!("breakpoint before the process-creation event; imports were not rewritten");
            (state, Vec::new())
        }

        (SessionState::WaitingForBreakpoint, SessionEvent::Exception { code })
            if *code == EXCEPTION_BREAKPOINT_CODE =>
        {
            (
                SessionState::Detaching,
                vec![SessionAction::ResolveForwards, SessionAction::Detach],
            )
        }
        (SessionState::WaitingForBreakpoint, SessionEvent::ProcessCreated) => {
            warn!("duplicate process-creation event ignored");
            (state, Vec::new())
        }

        // Non-breakpoint exceptions and bookkeeping events pass through; the
        // caller continues them unhandled.
        _ => (state, Vec::new()),
    }
}
