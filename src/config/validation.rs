//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that
//! cannot be expressed through the type system alone (range checks,
//! cross-field invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - Checking that script files exist (the executor reports that per run)

use super::OrchestratorConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "queue.max_concurrency").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Server ───────────────────────────────────────────────────────
    if config.server.host.trim().is_empty() {
        errors.push(invalid("server.host", "", "host must not be empty"));
    }
    if config.server.max_request_size == 0 {
        errors.push(invalid("server.max_request_size", 0, "must be at least 1 byte"));
    }
    if config.server.event_capacity == 0 {
        errors.push(invalid("server.event_capacity", 0, "must be at least 1"));
    }

    // ── Queue ────────────────────────────────────────────────────────
    if config.queue.max_concurrency == 0 {
        errors.push(invalid("queue.max_concurrency", 0, "must be at least 1"));
    }
    if config.queue.run_timeout_secs == 0 {
        errors.push(invalid("queue.run_timeout_secs", 0, "must be at least 1 second"));
    }
    if config.queue.default_max_rounds == 0 {
        errors.push(invalid("queue.default_max_rounds", 0, "must be at least 1"));
    }
    if config.queue.default_max_rounds > config.queue.absolute_max_rounds {
        errors.push(invalid(
            "queue.default_max_rounds",
            config.queue.default_max_rounds,
            "must be \u{2264} absolute_max_rounds",
        ));
    }

    // ── Executor ─────────────────────────────────────────────────────
    if config.executor.python_bin.trim().is_empty() {
        errors.push(invalid("executor.python_bin", "", "interpreter must not be empty"));
    }
    if config.executor.script_path.as_os_str().is_empty() {
        errors.push(invalid("executor.script_path", "", "script path must not be empty"));
    }

    // ── Evaluation ───────────────────────────────────────────────────
    if config.evaluation.enabled {
        if config.evaluation.script_path.as_os_str().is_empty() {
            errors.push(invalid(
                "evaluation.script_path",
                "",
                "script path must not be empty when evaluation is enabled",
            ));
        }
        if config.evaluation.timeout_secs == 0 {
            errors.push(invalid(
                "evaluation.timeout_secs",
                0,
                "must be at least 1 second when evaluation is enabled",
            ));
        }
    }

    // ── Cost ─────────────────────────────────────────────────────────
    let rate = config.cost.cost_per_round;
    if !rate.is_finite() || rate < 0.0 {
        errors.push(invalid("cost.cost_per_round", rate, "must be a non-negative number"));
    }

    // ── Store ────────────────────────────────────────────────────────
    if config.store.backend == super::StoreBackend::Sqlite {
        if config.store.path.as_os_str().is_empty() {
            errors.push(invalid("store.path", "", "path must not be empty for sqlite"));
        }
        if !cfg!(feature = "sqlite") {
            errors.push(invalid(
                "store.backend",
                "sqlite",
                "binary was built without the `sqlite` feature",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
