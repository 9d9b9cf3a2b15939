// Copyright (C) 2024, 2025 Etherpool Developers (see AUTHORS)
//
// This file is part of Etherpool
//
// Etherpool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Etherpool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Etherpool. If not, see <https://www.gnu.org/licenses/>.

use crate::config::{LoggerConfig, RunLevel};
use std::error::Error;
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Sets up console logging plus optional daily-rolling files: the main log
/// at `logPath` and warnings-and-up at `errLogPath`. Returns guards that
/// must stay alive for the non-blocking writers to flush.
pub fn setup_logging(
    logger: &LoggerConfig,
    runlevel: RunLevel,
) -> Result<Vec<WorkerGuard>, Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(runlevel.default_log_level()));

    let mut guards = Vec::new();

    let (main_layer, err_layer) = {
        let main = match &logger.log_path {
            Some(path) => {
                let (writer, guard) = rolling_writer(path)?;
                guards.push(guard);
                Some(fmt::layer().with_writer(writer).with_ansi(false))
            }
            None => None,
        };
        let err = match &logger.err_log_path {
            Some(path) => {
                let (writer, guard) = rolling_writer(path)?;
                guards.push(guard);
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(LevelFilter::WARN),
                )
            }
            None => None,
        };
        (main, err)
    };

    Registry::default()
        .with(filter)
        .with(fmt::layer())
        .with(main_layer)
        .with(err_layer)
        .init();

    Ok(guards)
}

fn rolling_writer(
    path: &str,
) -> Result<(non_blocking::NonBlocking, WorkerGuard), Box<dyn Error>> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let filename = path
        .file_name()
        .unwrap_or_default()
        .to_str()
        .unwrap_or("etherpool.log");

    let appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);
    Ok(non_blocking::NonBlockingBuilder::default().finish(appender))
}
