use std::path::PathBuf;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::orchestration::CoordinatorActor;
use conductor::state::{Snapshot, StateStore};
use conductor::transport::AgentListener;
use conductor::{Error, Result};

/// Conductor - task orchestration coordinator for research agents
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1       Enable debug logging (alternative to --debug)\n    CONDUCTOR_LISTEN=ADDR   Override server.listen_addr\n    RUST_LOG=FILTER         Full tracing filter, overrides both")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the coordinator and accept agent connections until Ctrl-C
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Print the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },

    /// Show task, agent and cost statistics from the last snapshot
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Snapshot file (default: state.snapshot_path from config)
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Config { init } => run_config(cli.config, init),
        Command::Serve { listen } => {
            let mut config = load_config(cli.config.as_deref())?;
            conductor::log::init(cli.debug, config.logging.format);
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            run_serve(config)
        }
        Command::Status { json, snapshot } => {
            let config = load_config(cli.config.as_deref())?;
            conductor::log::init(cli.debug, config.logging.format);
            run_status(&config, snapshot, json)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_config(path: Option<PathBuf>, init: bool) -> Result<()> {
    if init {
        let path = match path {
            Some(path) => path,
            None => Config::config_path()?,
        };
        if path.exists() {
            return Err(Error::Validation(format!(
                "{} already exists",
                path.display()
            )));
        }
        Config::default().save_to(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = load_config(path.as_deref())?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn run_serve(config: Config) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (handle, actor) = CoordinatorActor::new(&config).spawn();
        let listener = AgentListener::bind(&config.server.listen_addr, handle.clone()).await?;
        let accept = tokio::spawn(listener.run());

        tracing::info!(
            policy = %config.dispatch.policy,
            session_ceiling = config.admission.session_ceiling,
            global_ceiling = config.admission.global_ceiling,
            "coordinator running"
        );

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        tracing::info!("shutting down");
        handle.shutdown();

        let _ = accept.await;
        actor
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        Ok::<(), Error>(())
    })
}

fn run_status(config: &Config, snapshot: Option<PathBuf>, json: bool) -> Result<()> {
    let path = snapshot
        .or_else(|| config.state.snapshot_path())
        .ok_or_else(|| {
            Error::Validation("no snapshot path: pass --snapshot or set state.snapshot_path".to_string())
        })?;

    let Some(snapshot) = StateStore::new(&path).load()? else {
        println!("No snapshot at {}", path.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.stats())?);
    } else {
        print_status(&snapshot);
    }
    Ok(())
}

fn print_status(snapshot: &Snapshot) {
    let stats = snapshot.stats();
    println!("Snapshot taken {}", snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("Tasks ({} total):", snapshot.tasks.len());
    for (status, count) in &stats.tasks_by_status {
        println!("  {:<12} {}", status, count);
    }
    println!();
    println!("Agents ({} connected):", snapshot.agents.len());
    for agent in &snapshot.agents {
        println!(
            "  {:<20} {:<12} {:<12} {}/{}",
            agent.agent_id, agent.agent_type, agent.status, agent.current_load, agent.max_concurrent
        );
    }
    println!();
    println!("Cost: {:.2} global", stats.global_cost);
    for ledger in &stats.sessions {
        println!(
            "  {:<20} spent {:.2}  reserved {:.2}  admitted {}  rejected {}",
            ledger.context_id, ledger.spent, ledger.reserved, ledger.admitted, ledger.rejected
        );
    }
}
