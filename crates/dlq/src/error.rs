// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the dead-letter queue.

/// Errors raised by the dead-letter store.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A durable write (append, seal, fsync) failed. The caller drops the
    /// batch and counts it; the same batch is never retried against the
    /// store, to avoid unbounded memory pinning.
    #[error("durable write failed: {details}")]
    DurableWriteFailed {
        /// A description of the error that occurred.
        details: String,
    },

    /// The store directory cannot be created or listed at startup. Fatal;
    /// maps to the durable-store I/O exit code.
    #[error("dead-letter directory `{dir}` unusable: {details}")]
    Unusable {
        /// The configured directory.
        dir: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A non-fatal I/O error while reading during replay.
    #[error("i/o error on `{path}`: {source}")]
    Io {
        /// The file involved.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
