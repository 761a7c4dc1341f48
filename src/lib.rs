//! Apitape - record filtered, redacted API traffic from a browser session
//!
//! Exchanges flow from a capture source through scope matching, body
//! sanitization and header redaction into an ordered session record.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod capture;
pub mod config;
pub mod error;
pub mod headers;
pub mod matcher;
pub mod output;
pub mod recording;
pub mod sanitize;

pub use error::{RecorderError, Result};
