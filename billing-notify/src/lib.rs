//! billing-notify library crate.
//!
//! This module exposes the pipeline components for the binary and for
//! integration testing.

pub mod broker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
