use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 10s, 250ms, 1m)".to_string());
    }

    humantime::parse_duration(s)
        .map_err(|e| format!("invalid duration '{s}': {e} (expected e.g. 10s, 250ms, 1m)"))
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    /// Progress bar on stderr and a human-readable summary.
    HumanReadable,
    /// Emit JSON progress lines (NDJSON) to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "cpsim",
    author,
    version,
    about = "Virtual charge-point load generator for OCPP-J central systems",
    long_about = "cpsim opens many concurrent OCPP-J WebSocket sessions against a central system, each playing a scripted charge-point lifecycle, and reports how the sessions fared.\n\nA YAML profile names the target, how charge-point identities are chosen, the ramping load stages, and the session script. CLI flags override values from the profile.",
    after_help = "Examples:\n  cpsim run profiles/charging.yaml\n  cpsim run profiles/charging.yaml --url ws://localhost:8180/steve/websocket/CentralSystemService --output json\n  cpsim validate profiles/charging.yaml"
)]
pub struct Cli {
    /// Log filter (e.g. `info`, `cpsim_core=debug`). Falls back to RUST_LOG, then `warn`.
    #[arg(long, global = true, env = "CPSIM_LOG", value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load profile against a central system
    Run(RunArgs),

    /// Parse and validate a profile, then print the resolved plan without connecting
    Validate(ValidateArgs),
}

/// Profile values that can be overridden from the command line.
#[derive(Debug, Clone, Default, Args)]
pub struct ProfileOverrides {
    /// Endpoint prefix; the charge point id is appended as the last path segment
    #[arg(long, env = "CPSIM_URL")]
    pub url: Option<String>,

    /// Shared secret used in every client's basic-auth credential
    #[arg(long, env = "CPSIM_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// WebSocket subprotocol (e.g. ocpp1.6, ocpp2.0.1)
    #[arg(long)]
    pub protocol: Option<String>,

    /// Upper bound for one session's connect plus script (e.g. 30m)
    #[arg(long, value_parser = parse_duration)]
    pub session_timeout: Option<Duration>,

    /// Cancel every live session once the run has lasted this long (e.g. 2h)
    #[arg(long, value_parser = parse_duration)]
    pub max_duration: Option<Duration>,

    /// Stop starting sessions once this many clients have been started in total
    #[arg(long)]
    pub max_sessions: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the load profile (.yaml)
    pub profile: PathBuf,

    #[command(flatten)]
    pub overrides: ProfileOverrides,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the load profile (.yaml)
    pub profile: PathBuf,

    #[command(flatten)]
    pub overrides: ProfileOverrides,
}
