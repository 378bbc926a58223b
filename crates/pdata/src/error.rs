// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the pdata crate.

/// Errors raised while decoding framed batch payloads or OTLP bytes.
///
/// These are data-integrity failures: the offending batch or item is
/// dropped and counted, never retried.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The framed payload ended before the declared length.
    #[error("truncated batch payload: needed {needed} more bytes")]
    Truncated {
        /// How many bytes were missing.
        needed: usize,
    },

    /// The frame header carried an unknown version or signal kind.
    #[error("unsupported batch framing: {details}")]
    UnsupportedFraming {
        /// A description of the error that occurred.
        details: String,
    },

    /// A protobuf payload failed to decode.
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
}
