//! Error types for the gateway core.
//!
//! This module defines the central `Error` enum shared by the allocators, the
//! scheduler and the coordinator. Remote failures arrive as
//! [`tonic::Status`] and are folded into [`Error::Authority`] so that retry
//! decisions can be made on the gRPC code.
//!
//! ## Error Cases
//! - `AllocatorUnavailable`: The authority stayed unreachable past the retry
//!   deadline.
//! - `LeaseExhausted` / `LeaseExpired`: A segment lease cannot hold a request;
//!   normally handled by renewal and only surfaced when renewal fails.
//! - `ValidationFailed`: Bad client input, rejected in `PreExecute`.
//! - `ExecutionFailed`: `Execute` kept failing after its retry budget.
//! - `ExclusionTimeout`: A collection exclusion token stayed unavailable past
//!   the re-queue budget.
//! - `Deadline`: The caller's deadline expired. A task already queued keeps
//!   running; one still being prepared is dropped.
//! - `ServiceShutdown`: The core is shutting down.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the gateway core.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The authority could not be reached before the retry deadline.
    #[error("{allocator} allocator unavailable after {attempts} attempts: {reason}")]
    AllocatorUnavailable {
        allocator: &'static str,
        attempts: u32,
        reason: String,
    },

    /// A fresh lease still cannot hold the requested rows.
    #[error("segment {segment_id} lease exhausted: requested {requested}, granted {granted}")]
    LeaseExhausted {
        segment_id: u64,
        requested: u64,
        granted: u64,
    },

    /// A lease was used past its expiry.
    #[error("segment {segment_id} lease expired")]
    LeaseExpired { segment_id: u64 },

    /// The authority refused to grant a lease.
    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: String },

    /// The client request was malformed or referenced unknown schema.
    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    /// A downstream call kept failing during `Execute`.
    #[error("Execution failed after {attempts} attempts: {reason}")]
    ExecutionFailed { attempts: u32, reason: String },

    /// The collection exclusion token could not be acquired in time.
    #[error("Exclusion on collection {collection} timed out after {requeues} re-queues")]
    ExclusionTimeout { collection: String, requeues: u32 },

    /// The request-scoped deadline expired. The task may still complete if
    /// it was queued in time; `task_id` is 0 if it never got an id.
    #[error("Deadline exceeded waiting for task {task_id}")]
    Deadline { task_id: u64 },

    /// An authority RPC failed.
    #[error("Authority error ({code:?}): {message}")]
    Authority { code: Code, message: String },

    /// A message-bus operation failed.
    #[error("Message bus error on {channel}: {reason}")]
    Bus { channel: String, reason: String },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A component was used before the coordinator started it.
    #[error("{component} is not started")]
    NotStarted { component: &'static str },

    /// The core is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Returns `true` for failures worth retrying: unreachable or overloaded
    /// authority, bus hiccups and broken internal channels.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authority { code, .. } => matches!(
                code,
                Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
                    | Code::Unknown
            ),
            Self::Bus { .. } | Self::ChannelError { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Authority {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Authority {
            code: Code::Unavailable,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_authority_is_transient() {
        let err: Error = Status::unavailable("down").into();
        assert!(err.is_transient());
    }

    #[test]
    fn not_found_authority_is_permanent() {
        let err: Error = Status::not_found("no such collection").into();
        assert!(!err.is_transient());
        assert!(!Error::invalid("bad").is_transient());
    }
}
