//! Log sink selection for the `log_output` setting

#[cfg(unix)]
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global subscriber: `RUST_LOG` wins over `log_level`
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log_level '{}'", config.log_level))?;

    let (writer, ansi) = make_writer(&config.log_output)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .init();
    Ok(())
}

/// Writer for `stdout`, `stderr`, `syslog` or an append-mode file path,
/// plus whether ANSI colors suit it
pub fn make_writer(output: &str) -> Result<(BoxMakeWriter, bool)> {
    let sink = match output {
        "" | "stdout" => (BoxMakeWriter::new(std::io::stdout), true),
        "stderr" => (BoxMakeWriter::new(std::io::stderr), true),
        "syslog" => (syslog_writer()?, false),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("can't open log file {}", path))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
    };
    Ok(sink)
}

// openlog(3) keeps the identity pointer, and only one Syslog may exist per process
#[cfg(unix)]
fn syslog_writer() -> Result<BoxMakeWriter> {
    let identity = CStr::from_bytes_with_nul(b"split-dns\0").context("invalid syslog identity")?;
    let (options, facility) = Default::default();
    let syslog = syslog_tracing::Syslog::new(identity, options, facility)
        .context("syslog logger is already initialized")?;
    Ok(BoxMakeWriter::new(syslog))
}

#[cfg(not(unix))]
fn syslog_writer() -> Result<BoxMakeWriter> {
    anyhow::bail!("log_output 'syslog' is only supported on unix")
}
