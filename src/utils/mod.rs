//! Utility functions shared by the CLI and the library
//!
//! - [`app_data`] - Application data directory and config file loading

pub mod app_data;

pub use app_data::*;
