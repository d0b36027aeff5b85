/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    ffi::OsString,
    io,
    num::NonZeroUsize,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{Level, debug};

use crate::merge::{self, MergeOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Level and message only.
    #[default]
    Short,
    /// Also include the module path.
    Medium,
    /// Also include timestamps, thread names, and source locations.
    Long,
}

/// Apply a SquashFS delta to a source image.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to source SquashFS image.
    #[arg(value_name = "SOURCE", value_parser)]
    pub source: PathBuf,

    /// Path to delta file.
    #[arg(value_name = "PATCH", value_parser)]
    pub patch: PathBuf,

    /// Path to output SquashFS image.
    #[arg(value_name = "TARGET", value_parser)]
    pub target: PathBuf,

    /// Directory for the temporary scratch file.
    ///
    /// Defaults to the system temporary directory, which honors TMPDIR.
    #[arg(long, value_name = "DIR", value_parser)]
    pub temp_dir: Option<PathBuf>,

    /// xdelta3 executable to run.
    #[arg(long, value_name = "PROGRAM", value_parser, default_value = "xdelta3")]
    pub xdelta3: OsString,

    /// Number of threads to use for recompression.
    ///
    /// Defaults to the number of available CPUs.
    #[arg(long, value_name = "N")]
    pub threads: Option<NonZeroUsize>,

    /// Lowest log message severity to output.
    #[arg(long, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, value_name = "FORMAT", default_value_t, value_enum)]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn merge_options(&self) -> MergeOptions {
        let mut options = MergeOptions {
            xdelta3: self.xdelta3.clone(),
            threads: self.threads,
            ..Default::default()
        };

        if let Some(dir) = &self.temp_dir {
            options.temp_dir.clone_from(dir);
        }

        options
    }
}

/// Set up the global tracing subscriber. Log messages are written to stderr.
pub fn init_logging(log_level: LogLevel, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(log_level));

    match log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Medium => builder.without_time().init(),
        LogFormat::Long => builder
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors exit with 1 instead of clap's default of 2.
            if e.use_stderr() {
                eprint!("{e}");
                std::process::exit(1);
            }
            e.exit();
        }
    };

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    debug!("Arguments: {cli:?}");

    let options = cli.merge_options();

    merge::merge(&cli.source, &cli.patch, &cli.target, &options, cancel_signal)
        .with_context(|| format!("Failed to apply {:?} to {:?}", cli.patch, cli.source))?;

    Ok(())
}
