//! # Configuration
//!
//! Operator configuration loaded once at startup from the environment.

pub mod operator;

pub use operator::OperatorConfig;
