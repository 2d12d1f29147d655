// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

mod args;
mod channel;
mod download;
mod error;
mod transfer;
mod writer;

use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use args::parse_args;
use channel::{ControlPort, spawn_reader};
use transfer::Orchestrator;
use writer::DirectoryVolume;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let (args, settings, client) = parse_args()?;

    let default_level = if settings.quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    // Log lines go through the indicatif writer so they never tear the bar.
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_target(false),
        )
        .with(indicatif_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    // Stdout carries the command responses; stdin delivers the URL.
    let (mut port, feeder) = ControlPort::new(tokio::io::stdout());
    spawn_reader(std::io::stdin(), feeder)?;

    let mut volume = DirectoryVolume::new(settings.mount_point.clone(), settings.capacity);
    let orchestrator = Orchestrator::new(client, &settings);

    let result = orchestrator
        .handle_command(&args.command(), &mut volume, &mut port)
        .await;

    Ok(match result {
        Ok(report) => {
            if report.leftover_parameter_bytes > 0 {
                tracing::warn!(
                    "{} bytes received after the URL were ignored",
                    report.leftover_parameter_bytes
                );
            }
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    })
}
