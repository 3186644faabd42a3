//! AgentSpan CLI
//!
//! Replays recorded agent responses through the span builders.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use agentspan::replay::{self, ReplayFormat, ReplayInput};
use agentspan::tracer::InMemoryTracer;
use agentspan::{Config, Instrumentation, InvocationRequest, InvocationResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

/// AgentSpan - Span trees for AI agent traces
#[derive(Parser)]
#[command(name = "agentspan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "AGENTSPAN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded response and print the resulting spans
    Replay {
        /// Recorded response file
        file: PathBuf,

        /// The file is a `---`-separated trace log rather than response items
        #[arg(long)]
        trace_log: bool,

        /// Treat the response as streamed
        #[arg(long)]
        streaming: bool,

        /// Agent id recorded on the root span
        #[arg(long, default_value = "REPLAY")]
        agent_id: String,

        /// Agent alias id recorded on the root span
        #[arg(long, default_value = "TSTALIASID")]
        agent_alias_id: String,

        /// Session id recorded on the root span
        #[arg(long, default_value = "replay-session")]
        session_id: String,

        /// User input recorded as the prompt
        #[arg(long, default_value = "")]
        input: String,

        /// Export the spans over OTLP instead of printing them (needs the `otel` feature)
        #[arg(long)]
        export: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Error loading .env: {e}");
            return ExitCode::FAILURE;
        }
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Replay {
            file,
            trace_log,
            streaming,
            agent_id,
            agent_alias_id,
            session_id,
            input,
            export,
        } => {
            let format = if trace_log {
                ReplayFormat::TraceLog
            } else {
                ReplayFormat::ResponseItems
            };
            let request = InvocationRequest::new(agent_id, agent_alias_id, session_id, input)
                .streaming(streaming);
            run_replay(config, &file, format, &request, export, cli.format)
        }
        Commands::Config => run_config(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_replay(
    config: Config,
    file: &Path,
    format: ReplayFormat,
    request: &InvocationRequest,
    export: bool,
    output: OutputFormat,
) -> anyhow::Result<()> {
    info!(file = %file.display(), ?format, streaming = request.streaming, "Replaying recorded response");

    let input = replay::load(file, format)?;
    if input.skipped > 0 {
        warn!(skipped = input.skipped, "Malformed records left out of the replay");
    }
    if export {
        return run_export(config, request, input, output);
    }

    let tracer = Arc::new(InMemoryTracer::new());
    let instrumentation = Instrumentation::new(tracer.clone(), config);
    let result = replay::replay(&instrumentation, request, input.items)?;

    match output {
        OutputFormat::Text => {
            print!("{}", tracer.render_tree());
            println!();
            print_summary(&result, input.skipped);
        }
        OutputFormat::Json => {
            let report = serde_json::json!({
                "result": result,
                "skipped": input.skipped,
                "spans": tracer.finished_spans(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn print_summary(result: &InvocationResult, skipped: usize) {
    println!("completion: {}", result.completion);
    if let Some(failure) = &result.failure {
        println!("failure:    {failure}");
    }
    if result.event_errors > 0 {
        println!("event errors: {}", result.event_errors);
    }
    if skipped > 0 {
        println!("skipped records: {skipped}");
    }
}

#[cfg(feature = "otel")]
fn run_export(
    config: Config,
    request: &InvocationRequest,
    input: ReplayInput,
    output: OutputFormat,
) -> anyhow::Result<()> {
    use agentspan::otel::OtelTracer;

    let tracer = Arc::new(OtelTracer::otlp(&config.instrumentation)?);
    let endpoint = config.instrumentation.otlp_endpoint.clone();
    let instrumentation = Instrumentation::new(tracer.clone(), config);
    let result = replay::replay(&instrumentation, request, input.items)?;
    tracer.shutdown()?;

    match output {
        OutputFormat::Text => {
            println!("exported to {endpoint}");
            print_summary(&result, input.skipped);
        }
        OutputFormat::Json => {
            let report = serde_json::json!({
                "result": result,
                "skipped": input.skipped,
                "endpoint": endpoint,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[cfg(not(feature = "otel"))]
fn run_export(
    _config: Config,
    _request: &InvocationRequest,
    _input: ReplayInput,
    _output: OutputFormat,
) -> anyhow::Result<()> {
    anyhow::bail!("span export needs agentspan built with the `otel` feature")
}

fn run_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
