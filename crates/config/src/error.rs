// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

/// Errors that can occur while loading or validating the agent configuration.
///
/// All of these are fatal: the agent refuses to start on any of them and
/// exits with the configuration error exit code.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A collection of errors that occurred during validation.
    #[error("invalid configuration: {errors:?}")]
    InvalidConfiguration {
        /// The individual validation failures.
        errors: Vec<Error>,
    },

    /// An error that occurred while reading a configuration file.
    #[error("failed to read config file `{path}`: {details}")]
    FileReadError {
        /// Path of the file that could not be read.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while deserializing a configuration file.
    #[error("YAML deserialization error: {details}")]
    DeserializationError {
        /// A description of the error that occurred.
        details: String,
    },

    /// An environment override carried a value the target field cannot hold.
    #[error("invalid value for `{var}`: {details}")]
    InvalidEnvOverride {
        /// The environment variable name.
        var: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A setting holds a value outside its valid domain.
    #[error("invalid setting `{field}`: {details}")]
    InvalidSetting {
        /// Dotted path of the offending field.
        field: String,
        /// A description of the error that occurred.
        details: String,
    },
}
