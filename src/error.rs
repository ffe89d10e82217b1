//! Error kinds for the causal-ordering core and the controller glue above it.
//!
//! Mirrors the teacher's `DagError` (one small `thiserror` enum per layer, propagated with `?`
//! rather than unwound as panics). Neither enum is raised to the caller of `send`: `send` returns
//! `()` and treats `EmptyDestinations` as a logged no-op; `receive` logs and drops on
//! `MalformedEnvelope` before the KS state machine ever runs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CausalError {
    #[error("malformed envelope")]
    MalformedEnvelope(#[from] bincode::Error),

    #[error("send called with an empty destination set")]
    EmptyDestinations,

    #[error("delivery of a message stalled waiting on a dependency past its deadline")]
    StalledDependency,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no group or user named {0}")]
    UnknownTarget(String),

    #[error("group {0} already exists")]
    GroupExists(String),

    #[error("you are not a member of {0}")]
    NotAMember(String),

    #[error("you cannot leave the group 'all'")]
    CannotLeaveAll,
}
