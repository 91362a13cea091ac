pub mod builder;
pub mod classify;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod gate;
pub mod log_sanitize;
pub mod modules;
pub mod planner;
pub mod preflight;
pub mod profile;
pub mod validate;
pub mod verify;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
