//! Run one resumable generation against an event-stream endpoint.
//!
//! Streams content to stdout as it arrives, reconnecting through dropped
//! connections and gateway timeouts. Reads the API key from the
//! `RESTREAM_API_KEY` environment variable. Logs go to stderr (`RUST_LOG`).
//!
//! # Examples
//!
//! ```sh
//! # Basic request
//! restream --url http://localhost:5001/api/process-stream --content "Meeting notes..."
//!
//! # Pipe content from stdin and save the result
//! cat notes.md | restream --url $URL --stdin --format "dark theme" --output page.html
//!
//! # Tighter retry budget
//! restream --url $URL --content "..." --max-attempts 2 --base-delay-ms 250
//! ```

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use restream::prelude::*;
use tracing_subscriber::EnvFilter;

/// Run one resumable generation and print the reconstructed output.
#[derive(Parser)]
#[command(name = "restream")]
struct Cli {
    // ── Endpoint and content ───────────────────────────────────
    /// Event-stream endpoint URL
    #[arg(long)]
    url: String,

    /// Source content to send
    #[arg(long)]
    content: Option<String>,

    /// Read source content from stdin
    #[arg(long)]
    stdin: bool,

    /// Additional formatting instructions
    #[arg(long, default_value = "")]
    format: String,

    // ── Generation parameters ──────────────────────────────────
    #[arg(long, default_value = restream::DEFAULT_MODEL)]
    model: String,

    #[arg(long, default_value_t = restream::DEFAULT_MAX_TOKENS)]
    max_tokens: u32,

    #[arg(long, default_value_t = restream::DEFAULT_TEMPERATURE)]
    temperature: f32,

    #[arg(long, default_value_t = restream::DEFAULT_THINKING_BUDGET)]
    thinking_budget: u32,

    // ── Reconnects ─────────────────────────────────────────────
    /// Maximum reconnects after the initial connection
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// First reconnect delay for network errors and gateway timeouts
    #[arg(long, default_value_t = 1000)]
    base_delay_ms: u64,

    /// First reconnect delay after an overload rejection
    #[arg(long, default_value_t = 3000)]
    overload_delay_ms: u64,

    // ── Output ─────────────────────────────────────────────────
    /// Usage totals file
    #[arg(long, default_value = ".restream/usage.json")]
    usage_file: PathBuf,

    /// Write the final content to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Do not stream content to stdout
    #[arg(long)]
    quiet: bool,
}

fn read_stdin_content() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

fn resolve_content(cli: &Cli) -> Result<String, String> {
    let stdin_text = if cli.stdin {
        Some(read_stdin_content()?)
    } else {
        None
    };
    match (&cli.content, stdin_text) {
        (Some(c), Some(s)) => Ok(format!("{c}\n\n{s}")),
        (Some(c), None) => Ok(c.clone()),
        (None, Some(s)) => Ok(s),
        (None, None) => Err("provide --content, --stdin, or both".to_string()),
    }
}

async fn run(cli: &Cli) -> Result<(), String> {
    let api_key = std::env::var("RESTREAM_API_KEY")
        .map_err(|_| "RESTREAM_API_KEY environment variable is not set".to_string())?;
    let content = resolve_content(cli)?;

    let request = GenerationRequest::new(api_key, content)
        .with_format_instructions(cli.format.clone())
        .with_model(cli.model.clone())
        .with_max_tokens(cli.max_tokens)
        .with_temperature(cli.temperature)
        .with_thinking_budget(cli.thinking_budget);

    let config = SessionConfig::default()
        .with_max_attempts(cli.max_attempts)
        .with_base_delay(Duration::from_millis(cli.base_delay_ms))
        .with_overload_delay(Duration::from_millis(cli.overload_delay_ms));

    let transport = HttpTransport::new(cli.url.clone())?;
    let store = UsageStore::open(FileBackend::new(&cli.usage_file))?;
    let aggregator = UsageAggregator::new(Arc::new(store));

    let quiet = cli.quiet;
    let stdout_closed = Arc::new(AtomicBool::new(false));
    let observer = CompositeObserver::new()
        .with(LoggingObserver)
        .with_if(
            !quiet,
            FnObserver::new(move |event| {
                if let SessionEvent::ContentDelta { text, .. } = event {
                    echo_delta(&mut io::stdout().lock(), text, &stdout_closed);
                }
            }),
        );

    let session = StreamSession::new(&transport, config)
        .with_observer(&observer)
        .with_usage_aggregator(&aggregator);

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            token.cancel();
        }
    });

    let result = session.run(request).await;
    if !quiet {
        println!();
    }

    let finished = match result {
        Ok(finished) => finished,
        Err(e) => {
            if let Some(path) = &cli.output
                && !e.partial_content().is_empty()
            {
                write_output(path, e.partial_content())?;
                eprintln!("Partial output written to {}", path.display());
            }
            return Err(e.to_string());
        }
    };

    if let Some(path) = &cli.output {
        write_output(path, &finished.content)?;
    }
    if let Some(usage) = &finished.usage {
        eprintln!(
            "Usage: {} input, {} output, {} thinking tokens",
            usage.input_tokens, usage.output_tokens, usage.thinking_tokens
        );
    }
    eprintln!("Totals: {}", aggregator.store().totals().summary());
    Ok(())
}

/// Echo a delta to `out`. After the first write failure (e.g. a closed pipe)
/// echoing stops; the session keeps running and `--output` still works.
fn echo_delta(out: &mut impl Write, text: &str, closed: &AtomicBool) {
    if closed.load(Ordering::Relaxed) {
        return;
    }
    if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        tracing::debug!("Stopping stdout echo: {e}");
        closed.store(true, Ordering::Relaxed);
    }
}

fn write_output(path: &Path, content: &str) -> Result<(), String> {
    std::fs::write(path, content)
        .map_err(|e| format!("failed to write {}: {e}", path.display()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
