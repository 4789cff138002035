//! Instance lifecycle state machine.
//!
//! This module defines which status changes an instance accepts. The
//! [`Instance`](crate::Instance) applies every change through
//! [`is_valid_transition`], so the rules here are the only place the state
//! machine is spelled out.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────────────┐
//!     │ ScheduledToStart │
//!     └────────┬─────────┘
//!              │ start()
//!              ▼
//!     ┌──────────────────┐   registered    ┌─────────┐
//!     │     Starting     │────────────────▶│ Running │◄─────────┐
//!     └──────────────────┘                 └────┬────┘          │
//!              ▲                     restart()  │  terminate()  │ registered
//!              │                    ┌───────────┴──────┐        │
//!              │                    ▼                  ▼        │
//!              │             ┌────────────┐     ┌──────────┐    │
//!              │             │ Restarting │─────│ Stopping │    │
//!              │             └────────────┘     └────┬─────┘    │
//!              │                                     │ unregistered
//!              │ start() (reuse)                     ▼          │
//!              │                               ┌──────────┐     │
//!              └───────────────────────────────│ Stopped  │─────┘
//!                                              └──────────┘
//!
//!     any state ──(failure)──▶ Error   (sticky, no way out)
//! ```
//!
//! Restart and terminate wait for `Running` with a bounded timeout and then
//! proceed regardless, so `Restarting` and `Stopping` are reachable from every
//! non-error state.

use crate::types::InstanceStatus;

/// Check if a status change is allowed.
#[must_use]
pub const fn is_valid_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::{Error, Restarting, Running, ScheduledToStart, Starting, Stopped, Stopping};

    match (from, to) {
        // Error is sticky
        (Error, _) => false,
        (_, Error) => true,
        // Starting only from a fresh or stopped instance
        (ScheduledToStart | Stopped, Starting) => true,
        (_, Starting | ScheduledToStart) => false,
        // Nothing can claim to run or stop before the first start
        (ScheduledToStart, Running | Stopped) => false,
        // Unregistration must not interrupt a restart
        (Restarting, Stopped) => false,
        (_, Running | Restarting | Stopping | Stopped) => true,
    }
}

/// Status to apply for a registration callback, or `None` to ignore it.
#[must_use]
pub const fn registration_target(
    current: InstanceStatus,
    registered: bool,
) -> Option<InstanceStatus> {
    let target = if registered {
        InstanceStatus::Running
    } else {
        InstanceStatus::Stopped
    };
    if is_valid_transition(current, target) {
        Some(target)
    } else {
        None
    }
}

/// Returns true if a pooled instance in this status can be handed out again.
#[must_use]
pub const fn is_reusable(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Stopped)
}

/// Returns true if the instance can never change status again.
#[must_use]
pub const fn is_terminal(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Error)
}

/// Returns true if a worker process may exist for this status.
#[must_use]
pub const fn is_active(status: InstanceStatus) -> bool {
    matches!(
        status,
        InstanceStatus::Starting
            | InstanceStatus::Running
            | InstanceStatus::Restarting
            | InstanceStatus::Stopping
    )
}
