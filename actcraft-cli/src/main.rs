//! # actcraft CLI
//!
//! Drive an agent one step at a time and tune its program offline.
//!
//! Usage:
//!   actcraft step <task>
//!   actcraft observe --output <text> [--exit-code <n>]
//!   actcraft observe --message <text>
//!   actcraft optimize --dataset <file> [--publish]
//!   actcraft show | reset | init-config
//!
//! Examples:
//!   actcraft init-config
//!   actcraft step "Make the failing test in src/parser.rs pass"
//!   actcraft observe --output "test result: FAILED" --exit-code 101
//!   actcraft optimize --dataset bench/examples.jsonl --publish

use actcraft_agent::{build_agent, Agent};
use actcraft_core::config::DEFAULT_CONFIG_FILE;
use actcraft_core::{
    load_examples, AgentConfig, EventPayload, EventSource, ExpectationMetric, HttpProvider,
    LlmProvider, Observation, Optimizer, ProgramModule, ProgramStore, ScriptedProvider,
    TaskDescriptor,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "actcraft")]
#[command(author, version, about = "actcraft - an optimizable coding agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, env = "ACTCRAFT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the agent id from the configuration
    #[arg(short, long, global = true, env = "ACTCRAFT_AGENT_ID")]
    agent_id: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Produce the next action for a task
    Step {
        /// The task description
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,

        /// Use this completion instead of calling the provider
        #[arg(long)]
        reply: Option<String>,
    },
    /// Record executor output or a user message
    Observe {
        /// Output of the last executed action
        #[arg(long, conflicts_with = "message", required_unless_present = "message")]
        output: Option<String>,

        /// Exit code of the last executed command
        #[arg(long, requires = "output")]
        exit_code: Option<i32>,

        /// A message from the user
        #[arg(long)]
        message: Option<String>,
    },
    /// Compile candidate programs and select the best on a dataset
    Optimize {
        /// JSON array or JSON Lines file of scored examples
        #[arg(long)]
        dataset: PathBuf,

        /// Override the optimizer seed
        #[arg(long)]
        seed: Option<u64>,

        /// Persist the winner as the agent's program
        #[arg(long)]
        publish: bool,
    },
    /// Show the active program and history
    Show,
    /// Forget history and the selected program
    Reset,
    /// Write a default configuration file
    InitConfig,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: &Path, agent_id: Option<String>) -> actcraft_core::Result<AgentConfig> {
    let mut config = AgentConfig::load_or_default(path)?;
    if let Some(id) = agent_id {
        config.agent_id = id;
        config.validate()?;
    }
    Ok(config)
}

fn http_provider(config: &AgentConfig) -> actcraft_core::Result<HttpProvider> {
    HttpProvider::new(config.provider.to_provider_config()).map_err(actcraft_core::error::provider_error)
}

/// Agent for commands that never generate
fn offline_agent(config: AgentConfig) -> actcraft_core::Result<Agent<ScriptedProvider>> {
    build_agent(config, ScriptedProvider::new(Vec::<String>::new()))
}

fn print_json(value: &impl serde::Serialize) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

async fn step_with<P: LlmProvider>(mut agent: Agent<P>, task: &TaskDescriptor) -> actcraft_core::Result<()> {
    let cancel = async {
        // Ctrl-C abandons the step without recording anything.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let result = agent.step_with_cancel(task, cancel).await;
    agent.save_history()?;
    let action = result?;
    print_json(&action);
    Ok(())
}

async fn run_step(config: AgentConfig, task: String, reply: Option<String>) -> actcraft_core::Result<()> {
    let task = TaskDescriptor::start(task);
    match reply {
        Some(reply) => step_with(build_agent(config, ScriptedProvider::repeating(reply))?, &task).await,
        None => {
            let provider = http_provider(&config)?;
            step_with(build_agent(config, provider)?, &task).await
        }
    }
}

fn run_observe(
    config: AgentConfig,
    output: Option<String>,
    exit_code: Option<i32>,
    message: Option<String>,
) -> actcraft_core::Result<()> {
    let mut agent = offline_agent(config)?;

    let (source, payload) = match (output, message) {
        (Some(content), _) => {
            let mut observation = Observation::new(content);
            if let Some(code) = exit_code {
                observation = observation.with_exit_code(code);
            }
            (EventSource::Environment, EventPayload::Observation(observation))
        }
        (None, Some(content)) => (EventSource::User, EventPayload::message(content)),
        (None, None) => {
            return Err(actcraft_core::error::invalid_argument("nothing to record"));
        }
    };

    let seq = agent.observe(source, payload);
    agent.save_history()?;
    println!("recorded event {}", seq);
    Ok(())
}

async fn run_optimize(
    config: AgentConfig,
    dataset: PathBuf,
    seed: Option<u64>,
    publish: bool,
) -> actcraft_core::Result<()> {
    let examples = load_examples(&dataset)?;
    let provider = http_provider(&config)?;
    let agent_id = config.agent_id.clone();

    let mut optimizer_config = config.optimizer_config();
    if let Some(seed) = seed {
        optimizer_config.seed = seed;
    }
    let optimizer = Optimizer::new(optimizer_config);

    let agent = offline_agent(config)?;
    let base = agent.program().as_ref().clone();
    let candidates = optimizer.compile_candidates(&base, &examples)?;

    let report = optimizer
        .optimize(candidates, &examples, &ExpectationMetric, &provider)
        .await?;

    for score in &report.scores {
        let marker = if score.index == report.best_index { "*" } else { " " };
        println!(
            "{} [{}] {} v{} gen {}  mean {:.3}  parse failures {}  ({} examples)",
            marker,
            score.index,
            score.name,
            score.version,
            score.generation,
            score.mean,
            score.parse_failures,
            score.scores.len()
        );
    }

    if publish {
        let mut agent = agent;
        agent.adopt(report.best.clone())?;
        println!("published {} v{} for agent '{}'", report.best.name(), report.best.version(), agent_id);
    }
    Ok(())
}

fn run_show(config: AgentConfig) -> actcraft_core::Result<()> {
    let store_dir = config.storage_dir.clone();
    let agent = offline_agent(config)?;
    let program = agent.program();
    let meta = program.meta();

    println!("agent:       {}", agent.config().agent_id);
    println!("state:       {}", agent.state());
    println!("program:     {} v{} ({})", meta.name, meta.version, program.strategy());
    println!("generation:  {}", meta.generation);
    println!("demos:       {}", program.demos().len());
    println!("fingerprint: {}", meta.fingerprint);
    println!("events:      {}", agent.history().len());
    println!("queued:      {}", agent.pending());

    let others: Vec<String> = ProgramStore::file(&store_dir)?
        .agents()
        .into_iter()
        .filter(|id| id != &agent.config().agent_id)
        .collect();
    if !others.is_empty() {
        println!("other agents with programs: {}", others.join(", "));
    }
    Ok(())
}

fn run_reset(config: AgentConfig) -> actcraft_core::Result<()> {
    let mut agent = offline_agent(config)?;
    agent.reset()?;
    println!("reset agent '{}'", agent.config().agent_id);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::InitConfig = cli.command {
        if cli.config.exists() {
            eprintln!("Error: {} already exists", cli.config.display());
            std::process::exit(1);
        }
        if let Err(e) = AgentConfig::write_default(&cli.config) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        println!("wrote {}", cli.config.display());
        return;
    }

    let config = match load_config(&cli.config, cli.agent_id) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Step { task, reply } => run_step(config, task.join(" "), reply).await,
        Commands::Observe {
            output,
            exit_code,
            message,
        } => run_observe(config, output, exit_code, message),
        Commands::Optimize {
            dataset,
            seed,
            publish,
        } => run_optimize(config, dataset, seed, publish).await,
        Commands::Show => run_show(config),
        Commands::Reset => run_reset(config),
        Commands::InitConfig => Ok(()),
    };

    if let Err(e) = result {
        tracing::debug!(error = ?e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
