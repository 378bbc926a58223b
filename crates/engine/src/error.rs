// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the engine core.

/// Errors raised while building or running the pipeline core. Admission
/// paths never return these; they surface only at startup and shutdown.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// The durable store could not be opened. Maps to the durable-store
    /// I/O exit code at startup.
    #[error("durable store: {0}")]
    DurableStore(#[from] nrdot_dlq::Error),

    /// An internal task failed in a way the core cannot recover from.
    #[error("internal error: {details}")]
    Internal {
        /// A description of the error that occurred.
        details: String,
    },
}
