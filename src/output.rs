use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FetchResult, InitResult, ProgressEvent, ProgressSink};
use crate::grid::{GridSpec, Square};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_init(result: &InitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_grid(grid: &GridSpec) -> io::Result<()> {
        Self::print_json(grid)
    }

    pub fn print_corners(square: &Square) -> io::Result<()> {
        Self::print_json(square)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_s = elapsed.as_secs_f64(), "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}
