pub mod config;
pub mod consolidate;
pub mod dataset;
pub mod error;
pub mod exec;
pub mod history;
pub mod kbuild;
pub mod layout;
pub mod log_sanitize;
pub mod patch;
pub mod resolver;
pub mod switch;
pub mod vcs;

pub use error::{Error, Result};
