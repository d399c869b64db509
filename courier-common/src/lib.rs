//! Shared building blocks for Courier services.
//!
//! Provides configuration loading, the unified error type, and logging
//! initialization used by the server binary.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};
