#![doc = "Common types shared across the honeypot fleet workspace."]

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;
