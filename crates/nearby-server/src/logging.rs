//! Logging setup for the discovery server.
//!
//! Production writes JSON lines to a daily rolling file (with the current
//! span, so every record carries its `channel`) and compact lines to stdout.
//! Development prints pretty output with discovery internals at `debug`.
//!
//! The scan and discovery loops log on every tick. Unless `RUST_LOG` says
//! otherwise, their targets are held at `info` so ticks stay out of the
//! default output.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guards for the non-blocking writers; dropping one stops its writer.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Prefix of the daily log files.
const LOG_FILE_PREFIX: &str = "nearby";

/// Environment variable holding the base level (or a full filter) when
/// `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "NEARBY_LOG_LEVEL";

/// Crates whose diagnostics are raised to `debug` in development.
const OWN_TARGETS: [&str; 2] = ["nearby_core", "nearby_server"];

/// Targets that log on every scan or discovery tick.
const TICK_TARGETS: [&str; 2] = ["nearby_core::scanner", "nearby_core::sync"];

/// Initialize logging.
///
/// Filter precedence: `RUST_LOG`, then [`LOG_LEVEL_ENV`], then `info`.
/// A bare level in [`LOG_LEVEL_ENV`] is expanded by [`default_directives`];
/// anything else is used as a filter verbatim.
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed, or in production if
/// the log directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let configured = std::env::var(LOG_LEVEL_ENV).ok();
            fallback_filter(is_production, configured.as_deref())?
        }
    };

    if is_production {
        init_production(env_filter)?;
    } else {
        init_development(env_filter);
    }

    Ok(())
}

/// Filter used when `RUST_LOG` is unset.
fn fallback_filter(is_production: bool, configured: Option<&str>) -> anyhow::Result<EnvFilter> {
    let base = match configured.map(str::trim) {
        None | Some("") => LevelFilter::INFO,
        Some(raw) => match raw.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return Ok(EnvFilter::try_new(raw)?),
        },
    };
    Ok(EnvFilter::try_new(default_directives(is_production, base))?)
}

/// Filter directives for a base level.
///
/// Development raises this workspace's crates to at least `debug`. Tick
/// targets never go above `info`, whatever the base.
pub fn default_directives(is_production: bool, base: LevelFilter) -> String {
    let own = if is_production {
        base
    } else {
        base.max(LevelFilter::DEBUG)
    };
    let tick = own.min(LevelFilter::INFO);

    let mut directives = vec![base.to_string()];
    directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={own}")));
    directives.extend(TICK_TARGETS.iter().map(|target| format!("{target}={tick}")));
    directives.join(",")
}

fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    // The current span holds `channel`; the full list would repeat it per level.
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_thread_ids(true);

    // journald adds its own timestamps
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .without_time()
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    // Only CLOSE: loop spans live as long as a session, so NEW adds nothing.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Returns the log directory for the current platform.
pub fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/nearby")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "nearby")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}
