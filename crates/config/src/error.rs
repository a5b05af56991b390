// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use thiserror::Error;

/// Errors that can occur while loading or validating control plane settings.
#[derive(Error, Debug)]
pub enum Error {
    /// An error that occurred while reading a settings file.
    #[error("Failed to read settings file '{path}': {details}")]
    FileReadError {
        /// The path that could not be read.
        path: String,
        /// Human-readable details of the read failure.
        details: String,
    },

    /// An error that occurred while deserializing a settings file.
    #[error("YAML deserialization error in '{path}': {details}")]
    DeserializationError {
        /// The path that failed to deserialize.
        path: String,
        /// Human-readable details of the failure.
        details: String,
    },

    /// A collection of violations found while validating the settings.
    #[error("Invalid settings: {errors:?}")]
    InvalidSettings {
        /// Every violation found, one message per knob.
        errors: Vec<String>,
    },
}
