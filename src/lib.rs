// src/lib.rs

pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod mediator;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod tools;

pub use error::{AssistantError, Result};
