//! dayline: photo diaries and one-line day summaries from capability services.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dayline_chat::{LlmConfig, OpenAiCompatClient};
use dayline_core::RunConfig;
use dayline_runtime::{
    Gender, MachineSettings, Persona, ProcessLauncher, ResilientOrchestrator, StateMachine,
    SummaryInputs,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dayline")]
#[command(about = "Turn a photo and a few traces of a day into a diary or a one-liner")]
struct Cli {
    /// Run config (services, timeouts). Defaults to $DAYLINE_CONFIG or config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan, call caption/EXIF tools as the model decides, and write a diary
    Diary,
    /// Combine whatever inputs are available into a single line
    Summarize(SummarizeArgs),
}

#[derive(clap::Args)]
struct SummarizeArgs {
    /// Photo of the day
    #[arg(long)]
    image: Option<PathBuf>,

    /// Spotify playlist URL, text playlist file, or inline track lines
    #[arg(long)]
    playlist: Option<String>,

    #[arg(long)]
    mbti: Option<String>,

    /// Diary file or diary text
    #[arg(long)]
    diary: Option<String>,

    #[arg(long)]
    age: Option<u32>,

    #[arg(long, default_value = "unknown")]
    gender: Gender,

    /// Nationality, e.g. KR
    #[arg(long)]
    nation: Option<String>,

    /// Target length in characters
    #[arg(long, default_value_t = 14)]
    target: u32,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 8.0)]
    timeout: f64,

    /// Don't warn when there is no caption
    #[arg(long)]
    allow_no_image: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from {}", path.display());
    }

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(RunConfig::default_path);
    let config = RunConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let llm = OpenAiCompatClient::from_config(&LlmConfig::from_env())
        .context("configuring language model")?;

    match cli.command {
        Command::Diary => run_diary(config, &llm).await,
        Command::Summarize(args) => run_summarize(config, args, &llm).await,
    }
}

async fn run_diary(config: RunConfig, llm: &OpenAiCompatClient) -> anyhow::Result<()> {
    if !config.image.is_file() {
        exit_with(json!({"error": "image not found", "path": config.image.display().to_string()}));
    }

    let machine = StateMachine::new(llm, MachineSettings::from(&config));
    let image = config.image.clone();
    let prompt = config.prompt.clone();
    let launcher = ProcessLauncher::new(config);

    let report = match machine.run(&image, &prompt, &launcher).await {
        Ok(report) => report,
        Err(e) => exit_with(failure_report("diary failed", &e)),
    };
    info!(
        "Diary written after {} decisions (invoked: {:?})",
        report.decisions, report.invoked
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_summarize(
    config: RunConfig,
    args: SummarizeArgs,
    llm: &OpenAiCompatClient,
) -> anyhow::Result<()> {
    let timeout = call_budget(args.timeout)?;

    let inputs = SummaryInputs {
        image: args.image,
        playlist: args.playlist,
        mbti: args.mbti,
        diary: args.diary,
        persona: Persona {
            age: args.age,
            gender: args.gender,
            nationality: args.nation,
        },
        target_chars: args.target,
        timeout,
        allow_no_image: args.allow_no_image,
    };

    let launcher = ProcessLauncher::new(config);
    match ResilientOrchestrator::new(llm).summarize(&inputs, &launcher).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => exit_with(failure_report("summary failed", &e)),
    }
}

/// `--timeout` as a duration; rejects values that are not a positive,
/// representable number of seconds.
fn call_budget(secs: f64) -> anyhow::Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(t) if !t.is_zero() => Ok(t),
        _ => anyhow::bail!("--timeout must be a positive number of seconds, got {}", secs),
    }
}

fn failure_report(error: &str, reason: &dayline_core::Error) -> serde_json::Value {
    json!({"error": error, "reason": reason.to_string()})
}

fn exit_with(report: serde_json::Value) -> ! {
    eprintln!("{}", report);
    process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayline_core::Error;

    #[test]
    fn test_call_budget_bounds() {
        assert_eq!(call_budget(8.0).unwrap(), Duration::from_secs(8));
        assert_eq!(call_budget(0.25).unwrap(), Duration::from_millis(250));
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(call_budget(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_failure_report_shape() {
        let report = failure_report("diary failed", &Error::DecisionLimit(8));
        assert_eq!(report["error"], "diary failed");
        assert!(report["reason"].as_str().unwrap().contains('8'));
    }
}
