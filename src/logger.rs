//! Global `tracing` subscriber setup.
//!
//! `LoggerManager` validates the logging configuration and installs one
//! console layer and, on request, a systemd journald layer. Each layer gets
//! its own `EnvFilter` so `RUST_LOG` overrides the configured level.

use std::io;

use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LogTarget, LoggerConfig},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error("Failed to install the global subscriber: {0}")]
    InstallFailed(String),
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Builds the configured layers and installs them as the global subscriber.
    /// Must be called once, before the first event is emitted.
    ///
    /// A journald failure is tolerated when a console layer is active.
    pub fn init(&self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InstallFailed(e.to_string()))
    }

    fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(console_layer(console, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer.with_syslog_identifier(journald.identifier.clone());
                    layers.push(layer.with_filter(self.filter()).boxed());
                    print_info!(
                        "Journald logging enabled with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) if !layers.is_empty() => {
                    print_warn!("Journald unavailable, keeping console logging only: {}", e);
                }
                Err(e) => return Err(LoggerError::IoError(e)),
            }
        }

        if layers.is_empty() {
            return Err(LoggerError::NoLayersConfigured);
        }
        Ok(layers)
    }
}

fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
    let writer = match config.target {
        LogTarget::Stdout => BoxMakeWriter::new(io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(io::stderr),
    };
    let spans = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(spans)
        .with_ansi(config.ansi_colors)
        .with_writer(writer);

    match config.format {
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_filter(filter).boxed(),
    }
}
