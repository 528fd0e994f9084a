use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use calltrack::cli::{Cli, Command, OutputFormat};
use calltrack::encode::{self, EventEncoder, JsonEncoder, TextEncoder};
use calltrack::event::EventRecord;
use calltrack::session::{Captured, Tracker};
use calltrack::workload::{self, StressConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()))
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Print captured events to stdout in the requested format
fn print_events(records: &[EventRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let trace = TextEncoder.encode(records);
            for line in &trace.events {
                println!("{line}");
            }
        }
        OutputFormat::Json => {
            let trace = JsonEncoder.encode(records);
            let json = serde_json::to_string_pretty(&trace).context("failed to encode events as JSON")?;
            println!("{json}");
        }
    }
    Ok(())
}

/// Write captured events to `path` as JSON lines
fn write_output(path: &Path, records: &[EventRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let errors = encode::write_json_lines(BufWriter::new(file), records);
    for err in &errors.errors {
        eprintln!("calltrack: {}: {} ({})", err.context, err.message, err.kind);
    }
    if errors.dropped > 0 {
        eprintln!("calltrack: {} more output errors not shown", errors.dropped);
    }
    Ok(())
}

fn report_callback_failures(captured: &Captured) {
    for failure in &captured.callback_failures {
        eprintln!("calltrack: event callback failed: {failure}");
    }
}

fn run_demo(cli: &Cli, tracker: &Tracker) -> Result<()> {
    let captured = workload::run_demo(tracker).context("demo session failed")?;
    report_callback_failures(&captured);
    print_events(&captured.records, cli.format)?;
    if let Some(path) = &cli.output {
        write_output(path, &captured.records)?;
    }
    Ok(())
}

fn run_stress(cli: &Cli, tracker: &Tracker, threads: usize, events: usize, stop_after_ms: u64) -> Result<()> {
    if threads == 0 {
        bail!("--threads must be at least 1");
    }
    let config = StressConfig {
        threads,
        events_per_thread: events,
        stop_after: Duration::from_millis(stop_after_ms),
    };
    let outcome = workload::run_stress(tracker, &config).context("stress session failed")?;

    match cli.format {
        OutputFormat::Text => {
            println!("threads:    {}", config.threads);
            println!("accepted:   {}", outcome.accepted);
            println!("rejected:   {}", outcome.rejected);
            println!("recorded:   {}", outcome.captured.records.len());
            println!("interned:   {}", outcome.captured.interned_strings);
            println!("elapsed:    {:.3}ms", outcome.elapsed.as_secs_f64() * 1000.0);
            println!("consistent: {}", if outcome.is_consistent() { "yes" } else { "no" });
        }
        OutputFormat::Json => {
            let summary = serde_json::json!({
                "threads": config.threads,
                "accepted": outcome.accepted,
                "rejected": outcome.rejected,
                "recorded": outcome.captured.records.len(),
                "interned_strings": outcome.captured.interned_strings,
                "unmatched_creations": outcome.captured.unmatched_creations,
                "elapsed_us": outcome.elapsed.as_micros() as u64,
                "consistent": outcome.is_consistent(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    if let Some(path) = &cli.output {
        write_output(path, &outcome.captured.records)?;
    }
    if !outcome.is_consistent() {
        bail!(
            "accepted {} events but recorded {}",
            outcome.accepted,
            outcome.captured.records.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = cli.tracker_config()?;
    let tracker = Tracker::new(config);

    match cli.command.clone() {
        Command::Demo => run_demo(&cli, &tracker),
        Command::Stress {
            threads,
            events,
            stop_after_ms,
        } => run_stress(&cli, &tracker, threads, events, stop_after_ms),
    }
}
