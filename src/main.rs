mod dataflow;
mod descriptor;
mod detectors;
mod engine;
mod finding;
mod ir;
mod opcodes;
mod report;
mod scan;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::detectors::RuleMetadata;
use crate::engine::Engine;
use crate::report::{OutputFormat, RunStats, write_report};
use crate::scan::scan_inputs;
use crate::telemetry::{init_logging, with_span};

/// CLI arguments for inspequte-idioms execution.
#[derive(Parser, Debug)]
#[command(
    name = "inspequte-idioms",
    about = "Bytecode idiom detectors for JVM class files and JAR files.",
    version
)]
struct Cli {
    /// Class file, directory of class files, or JAR to analyze.
    #[arg(long, value_name = "PATH", required = true)]
    input: Vec<PathBuf>,
    /// Report destination; `-` or absent writes to stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Sarif)]
    format: OutputFormat,
    /// Only run the detector with this id (repeatable).
    #[arg(long = "detector", value_name = "ID")]
    detectors: Vec<String>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    for input in &cli.input {
        if !input.exists() {
            anyhow::bail!("input not found: {}", input.display());
        }
    }
    let engine = if cli.detectors.is_empty() {
        Engine::new()
    } else {
        Engine::with_detector_ids(&cli.detectors)?
    };

    let started_at = Instant::now();
    let scan_started_at = Instant::now();
    let scan = with_span("scan", "inputs", || scan_inputs(&cli.input))?;
    let scan_duration_ms = scan_started_at.elapsed().as_millis();

    let analysis_started_at = Instant::now();
    let output = engine.analyze(&scan.classes);
    let analysis_duration_ms = analysis_started_at.elapsed().as_millis();
    info!(
        classes = scan.class_count,
        findings = output.findings.len(),
        diagnostics = output.diagnostics.len(),
        "analysis finished"
    );

    let rules: Vec<&RuleMetadata> = engine
        .detectors()
        .iter()
        .flat_map(|detector| detector.metadata().rules.iter())
        .collect();
    let stats = RunStats {
        scan_duration_ms,
        analysis_duration_ms,
        class_count: scan.class_count,
        skipped_entries: scan.skipped.len(),
    };
    let mut writer = output_writer(cli.output.as_deref())?;
    write_report(writer.as_mut(), cli.format, &rules, &output, &stats)?;
    writer.flush().context("failed to flush report")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} scan_ms={} analysis_ms={} classes={} findings={}",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            analysis_duration_ms,
            scan.class_count,
            output.findings.len()
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        ))),
        None => Ok(Box::new(io::stdout())),
    }
}
