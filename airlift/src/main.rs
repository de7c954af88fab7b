//! Operator CLI for launching and managing coding agents.
//!
//! Thin argument surface over [`Launcher`]: every subcommand loads
//! configuration (naming the variable to fix when it is incomplete),
//! builds the selected adapter, and performs exactly one operation.

use airlift::config::Config;
use airlift::launcher::{LaunchSpec, Launcher};
use airlift::logging;
use airlift::provider::AgentState;
use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "airlift",
    version,
    about = "Launch long-running autonomous coding agents on cloud or local compute"
)]
struct Cli {
    /// Deployment backend (gcp, aws, docker, railway). Defaults to
    /// AIRLIFT_PROVIDER, then gcp.
    #[arg(long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a new agent working on the given task.
    Launch {
        /// Task prompt / application specification.
        prompt: String,
        /// Custom agent name (generated if omitted).
        #[arg(long)]
        name: Option<String>,
        /// Git repository to clone into the workspace.
        #[arg(long)]
        repo: Option<String>,
        /// Branch to create or check out.
        #[arg(long)]
        branch: Option<String>,
        /// Use a spot/preemptible unit where supported.
        #[arg(long)]
        spot: bool,
        /// Maximum worker sessions (0 = unbounded).
        #[arg(long, default_value_t = 0)]
        max_iterations: u32,
        /// Keep the unit running after the agent finishes.
        #[arg(long)]
        keep_alive: bool,
        /// Authentication type (api_key or oauth). Defaults to
        /// AIRLIFT_AUTH_TYPE, then api_key.
        #[arg(long)]
        auth_type: Option<String>,
    },
    /// Show merged status for an agent.
    Status { agent_id: String },
    /// Print an agent's log tail.
    Logs { agent_id: String },
    /// Stop an agent and destroy its unit.
    Stop { agent_id: String },
    /// List agents on the configured backend.
    List,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let provider = cli.provider.as_deref();

    match cli.command {
        Command::Launch {
            prompt,
            name,
            repo,
            branch,
            spot,
            max_iterations,
            keep_alive,
            auth_type,
        } => {
            let config = Config::from_env(provider, auth_type.as_deref())?;
            let launcher = Launcher::new(config)?;
            let result = launcher.launch(&LaunchSpec {
                prompt,
                name,
                repo,
                branch,
                spot,
                max_iterations,
                keep_alive,
            });

            println!("agent:    {}", result.agent_id);
            println!("provider: {}", result.provider);
            println!("status:   {}", result.state);
            if let Some(address) = &result.address {
                println!("address:  {address}");
            }
            if result.state == AgentState::Failed {
                let error = result.error.unwrap_or_else(|| "unknown error".to_string());
                return Err(anyhow!("launch failed: {error}"));
            }
            Ok(())
        }
        Command::Status { agent_id } => {
            let launcher = Launcher::new(Config::from_env(provider, None)?)?;
            let report = launcher.status(&agent_id);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Logs { agent_id } => {
            let launcher = Launcher::new(Config::from_env(provider, None)?)?;
            match launcher.logs(&agent_id) {
                Some(logs) => {
                    println!("{logs}");
                    Ok(())
                }
                None => {
                    println!("no logs available for {agent_id}");
                    Ok(())
                }
            }
        }
        Command::Stop { agent_id } => {
            let launcher = Launcher::new(Config::from_env(provider, None)?)?;
            if launcher.stop(&agent_id) {
                println!("stopped {agent_id}");
                Ok(())
            } else {
                Err(anyhow!("failed to stop {agent_id}"))
            }
        }
        Command::List => {
            let launcher = Launcher::new(Config::from_env(provider, None)?)?;
            let agents = launcher.list_agents();
            if agents.is_empty() {
                println!("no agents");
                return Ok(());
            }
            for agent in agents {
                let address = agent.address.unwrap_or_default();
                println!("{:<40} {:<12} {address}", agent.name, agent.state.to_string());
            }
            Ok(())
        }
    }
}
