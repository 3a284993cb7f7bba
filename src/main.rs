use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use mesh::agent::AgentRegistry;
use mesh::decomposer::TaskDecomposer;
use mesh::orchestration::{select_strategy, should_use_mesh};
use mesh::provider::CommandProvider;
use mesh::session::{JsonFileStore, SessionStore};
use mesh::{Error, MeshConfig, MeshCoordinator, OrchestrateOptions, Result, SessionId};

/// Mesh - decompose requests and run them across a mesh of agents
#[derive(Parser, Debug)]
#[command(name = "mesh")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MESH_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.mesh/mesh.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a request and print the execution plan as JSON
    Plan {
        /// The task description in natural language
        prompt: String,

        /// Additional context for the decomposer
        #[arg(long, default_value = "")]
        context: String,
    },

    /// Orchestrate a request through the configured provider
    Run {
        /// The task description in natural language
        prompt: String,

        /// Additional context passed to every task
        #[arg(long, default_value = "")]
        context: String,

        /// Decompose even when the request looks simple
        #[arg(long)]
        force_mesh: bool,

        /// Continue an existing session
        #[arg(long)]
        session: Option<String>,

        /// Owner recorded on the session
        #[arg(long)]
        user: Option<String>,
    },

    /// List stored sessions
    Sessions,

    /// Show a stored session and its checkpoints
    Show {
        /// Session id
        session_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    mesh::log::init_with_debug(cli.debug);
    debug!(command = ?cli.command, "mesh starting");

    let config = MeshConfig::load()?;

    match cli.command {
        Command::Plan { prompt, context } => run_plan(&config, &prompt, &context),
        Command::Run {
            prompt,
            context,
            force_mesh,
            session,
            user,
        } => {
            let session_id = session.as_deref().map(parse_session_id).transpose()?;
            let mut options = OrchestrateOptions::default().with_context(&context);
            if force_mesh {
                options = options.force_mesh();
            }
            run_orchestration(&config, &prompt, options, user.as_deref(), session_id)
        }
        Command::Sessions => run_sessions(&config),
        Command::Show { session_id } => run_show(&config, &parse_session_id(&session_id)?),
    }
}

/// Print the plan without executing anything.
fn run_plan(config: &MeshConfig, prompt: &str, context: &str) -> Result<()> {
    let decomposer = TaskDecomposer::new(AgentRegistry::with_defaults());
    let plan = decomposer.decompose(prompt, context)?;
    let strategy = select_strategy(&plan, config.coordinator.parallel_threshold_percent);

    let json_output = serde_json::json!({
        "use_mesh": should_use_mesh(prompt),
        "strategy": strategy,
        "plan": plan,
    });
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}

fn run_orchestration(
    config: &MeshConfig,
    prompt: &str,
    options: OrchestrateOptions,
    user_id: Option<&str>,
    session_id: Option<SessionId>,
) -> Result<()> {
    let provider = CommandProvider::from_config(&config.provider)?;
    let store = JsonFileStore::new(config.sessions_dir()?);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let coordinator = MeshCoordinator::new(
            config,
            AgentRegistry::with_defaults(),
            Arc::new(provider),
            Arc::new(store),
        );
        let sweeper = coordinator.bus().start_sweeper();
        let result = coordinator.orchestrate(prompt, options, user_id, session_id).await;
        coordinator.shutdown().await;
        let _ = sweeper.await;
        result
    });

    info!(success = result.success, strategy = %result.mesh.strategy, "Run finished");
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success {
        Ok(())
    } else {
        Err(Error::Provider(result.error.unwrap_or(result.result)))
    }
}

fn run_sessions(config: &MeshConfig) -> Result<()> {
    let store = JsonFileStore::new(config.sessions_dir()?);
    let rt = tokio::runtime::Runtime::new()?;
    let sessions = rt.block_on(async {
        let mut sessions = Vec::new();
        for id in store.list().await? {
            if let Some(session) = store.load(&id).await? {
                sessions.push(session);
            }
        }
        Ok::<_, Error>(sessions)
    })?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!("{:<10} {:<10} {:>6} {:>10}  TASK", "ID", "STATUS", "TASKS", "COST");
    for session in sessions {
        println!(
            "{:<10} {:<10} {:>6} {:>10.4}  {}",
            session.id.short(),
            session.status,
            session.completed_tasks.len(),
            session.total_cost,
            truncate_string(&session.task, 50)
        );
    }
    Ok(())
}

fn run_show(config: &MeshConfig, id: &SessionId) -> Result<()> {
    let store = JsonFileStore::new(config.sessions_dir()?);
    let rt = tokio::runtime::Runtime::new()?;
    let (session, checkpoints) = rt.block_on(async {
        let session = store
            .load(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let checkpoints = store.checkpoints(id).await?;
        Ok::<_, Error>((session, checkpoints))
    })?;

    let json_output = serde_json::json!({
        "session": session,
        "checkpoints": checkpoints.len(),
    });
    println!("{}", serde_json::to_string_pretty(&json_output)?);
    Ok(())
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    SessionId::from_str(raw).map_err(|e| Error::Validation(format!("invalid session id {:?}: {}", raw, e)))
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
