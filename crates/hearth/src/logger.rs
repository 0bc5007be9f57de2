//! # Structured Instance Logging
//!
//! A thin wrapper over `tracing` that stamps every record with the actor
//! name and instance id, so one subscriber can interleave the logs of
//! thousands of instances and still attribute each line.
//!
//! Call [`init_tracing`] once at application startup; control verbosity
//! with the `RUST_LOG` environment variable (e.g. `RUST_LOG=hearth=debug`).

use std::fmt::Display;

/// Per-instance logger. Cheap to clone; handed to every framework
/// component owned by an instance.
#[derive(Clone)]
pub struct Logger {
    actor: &'static str,
    instance: String,
}

impl Logger {
    pub fn new(actor: &'static str, instance: impl Into<String>) -> Self {
        Self {
            actor,
            instance: instance.into(),
        }
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(actor = self.actor, instance = %self.instance, "{msg}");
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(actor = self.actor, instance = %self.instance, "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(actor = self.actor, instance = %self.instance, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(actor = self.actor, instance = %self.instance, "{msg}");
    }

    pub fn warn_cause(&self, msg: &str, cause: &dyn Display) {
        tracing::warn!(actor = self.actor, instance = %self.instance, cause = %cause, "{msg}");
    }

    pub fn error_cause(&self, msg: &str, cause: &dyn Display) {
        tracing::error!(actor = self.actor, instance = %self.instance, cause = %cause, "{msg}");
    }
}

/// Initializes the tracing subscriber with environment-based filtering.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
