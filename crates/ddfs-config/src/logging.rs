//! Structured logging utilities for ddfs components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use ddfs_config::log_audit_info;
//!
//! log_audit_info!("Map file scanned", blocks = 128u64);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const BUFFER: &'static str = "BUFFER";
    pub const AUDIT: &'static str = "AUDIT";
    pub const CAS: &'static str = "CAS";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a `-v` count onto a level (0 = warn)
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === BUFFER logging macros ===

#[macro_export]
macro_rules! log_buffer_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "BUFFER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_buffer_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "BUFFER", $($key = $value,)* $msg)
    };
}

// === AUDIT logging macros ===

#[macro_export]
macro_rules! log_audit_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "AUDIT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_audit_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "AUDIT", $($key = $value,)* $msg)
    };
}

// === CAS logging macros ===

#[macro_export]
macro_rules! log_cas_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CAS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cas_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CAS", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// Like [`init_logging`] but tolerates an already-installed subscriber (tests).
pub fn try_init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::BUFFER, "BUFFER");
        assert_eq!(Component::AUDIT, "AUDIT");
        assert_eq!(Component::CAS, "CAS");
        assert_eq!(Component::CLI, "CLI");
    }

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(9), LogLevel::Trace);
    }

    #[test]
    fn test_try_init_is_repeatable() {
        try_init_logging(LogLevel::Debug);
        try_init_logging(LogLevel::Debug);
        log_audit_debug!("logging initialised", attempt = 2u32);
        log_cas_debug!("cas logging", nodes = 3usize);
        log_cli_debug!("cli logging", verbose = true);
    }
}
