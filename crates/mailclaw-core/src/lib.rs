//! # MailClaw Core
//!
//! Configuration and error types shared by every MailClaw crate.

pub mod config;
pub mod error;

pub use config::{LogConfig, MailClawConfig, SchedulerConfig};
pub use error::{MailClawError, Result};
