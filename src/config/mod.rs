//! # Configuration
//!
//! Controller configuration loaded once at startup from the environment.

pub mod controller;

pub use controller::ControllerConfig;
