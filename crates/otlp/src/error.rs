// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Export failure classification.

use tonic::{Code, Status};

/// How an export failure is handled by the sender's state machine.
#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    /// Network trouble or an overloaded backend: retry with backoff.
    #[error("retryable export failure: {details}")]
    Retryable {
        /// A description of the error that occurred.
        details: String,
    },

    /// The backend rejected the payload for good: spill to the DLQ.
    #[error("permanent export failure: {details}")]
    Permanent {
        /// A description of the error that occurred.
        details: String,
    },

    /// Credentials were rejected: spill and raise the persistent auth
    /// gauge until a later export succeeds.
    #[error("authentication failure: {details}")]
    Auth {
        /// A description of the error that occurred.
        details: String,
    },
}

impl ExportError {
    /// Classifies a gRPC status per the retry policy: network trouble,
    /// server errors and push-back retry; auth is sticky; everything
    /// else is permanent.
    #[must_use]
    pub fn classify(status: &Status) -> Self {
        let details = format!("{}: {}", status.code(), status.message());
        match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Cancelled
            | Code::Aborted
            | Code::Unknown => ExportError::Retryable { details },
            Code::Unauthenticated | Code::PermissionDenied => ExportError::Auth { details },
            _ => ExportError::Permanent { details },
        }
    }

    /// True for the retryable class.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExportError::Retryable { .. })
    }

    /// True for the auth class.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, ExportError::Auth { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_retry_policy() {
        assert!(ExportError::classify(&Status::unavailable("down")).is_retryable());
        assert!(ExportError::classify(&Status::resource_exhausted("slow down")).is_retryable());
        assert!(ExportError::classify(&Status::deadline_exceeded("late")).is_retryable());
        assert!(ExportError::classify(&Status::unauthenticated("bad key")).is_auth());
        assert!(ExportError::classify(&Status::permission_denied("no")).is_auth());
        assert!(matches!(
            ExportError::classify(&Status::invalid_argument("bad payload")),
            ExportError::Permanent { .. }
        ));
    }
}
