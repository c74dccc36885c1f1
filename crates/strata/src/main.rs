//! Run one conversational turn against a persisted history.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Ask a question; the history lives in ./strata-session.json
//! strata --user "What did we decide about the cache layer?"
//!
//! # Start a new topic and pipe content from stdin
//! cat notes.md | strata --new-topic --user "Summarize these notes." --stdin
//!
//! # Custom settings and a different session file
//! strata --config settings.json --session work.json --user "Continue."
//!
//! # Print the stored history without calling the model
//! strata --session work.json --show
//! ```

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use strata::OpenRouterClient;
use strata::agent::{
    Agent, AgentConfig, AgentEvent, CompositeEventHandler, EventHandler, LoggingHandler,
    SessionFile, UtilitySummarizer,
};
use strata::api::{RateLimited, RateLimiterRegistry};
use strata::tasks::TaskPool;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run one conversational turn against a persisted, self-compressing history.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "strata")]
struct Cli {
    /// Session file holding the conversation history
    #[arg(long, default_value = "strata-session.json")]
    session: PathBuf,

    /// JSON settings file (models, retry, rate limits, history budget)
    #[arg(long)]
    config: Option<PathBuf>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content from stdin
    #[arg(long)]
    stdin: bool,

    /// System prompt sent ahead of the history
    #[arg(long)]
    system: Option<String>,

    /// Override the chat model
    #[arg(long)]
    model: Option<String>,

    /// Override the model that writes history summaries
    #[arg(long)]
    utility_model: Option<String>,

    /// Close the current topic before adding the message
    #[arg(long)]
    new_topic: bool,

    /// Print the stored history and exit
    #[arg(long)]
    show: bool,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,
}

/// Streams the reply: response text to stdout, reasoning and progress to
/// stderr.
struct CliEventHandler;

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        match event {
            AgentEvent::ResponseDelta(text) => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            AgentEvent::ReasoningDelta(text) => {
                eprint!("{text}");
            }
            AgentEvent::CompressingHistory { .. } => {
                eprintln!("[compressing history...]");
            }
            AgentEvent::RetryScheduled { attempt, delay, .. } => {
                eprintln!("[retry {attempt} in {:.1}s]", delay.as_secs_f64());
            }
            _ => {}
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "strata=debug" } else { "strata=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn build_user_content(cli: &Cli) -> Result<String, String> {
    let stdin_text = if cli.stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        Some(buf)
    } else {
        None
    };

    match (&cli.user, stdin_text) {
        (Some(msg), Some(piped)) => Ok(format!("{msg}\n\n{piped}")),
        (Some(msg), None) => Ok(msg.clone()),
        (None, Some(piped)) => Ok(piped),
        (None, None) => Err("provide --user, --stdin, or both".to_string()),
    }
}

fn load_config(cli: &Cli) -> Result<AgentConfig, String> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path).map_err(|e| e.to_string())?,
        None => AgentConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(model) = &cli.utility_model {
        config.utility_model = model.clone();
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

async fn run(cli: &Cli) -> Result<(), String> {
    let config = load_config(cli)?;
    let mut session = SessionFile::new(&cli.session);
    let history = session
        .load_or_new(config.history.clone())
        .map_err(|e| e.to_string())?;

    if cli.show {
        println!("{}", history.output_text("user", "ai"));
        return Ok(());
    }

    let user_text = build_user_content(cli)?;
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;

    let limiters = RateLimiterRegistry::new();
    let chat_client = OpenRouterClient::new(&api_key).map_err(|e| e.to_string())?;
    let chat_limiter = limiters.get("openrouter", &config.model, config.rate_limits);
    let utility_client = OpenRouterClient::new(&api_key).map_err(|e| e.to_string())?;
    let utility_limiter = limiters.get("openrouter", &config.utility_model, config.rate_limits);

    let summarizer = UtilitySummarizer::new(
        RateLimited::new(utility_client, utility_limiter),
        &config.utility_model,
    )
    .with_max_tokens(config.utility_max_tokens)
    .with_retry(config.retry.clone());

    let pool = Arc::new(TaskPool::new(config.max_workers));
    let mut agent = Agent::new(
        RateLimited::new(chat_client, chat_limiter),
        Arc::new(summarizer),
        history,
        config,
        pool.clone(),
    );
    if let Some(system) = &cli.system {
        agent = agent.with_system_prompt(system);
    }
    if cli.new_topic {
        agent.new_topic();
    }

    let handler = CompositeEventHandler::new()
        .with(CliEventHandler)
        .with(LoggingHandler);
    let turn = agent.respond(&user_text, &handler).await;
    println!();

    // Whatever happened to the reply, finish compressing and keep the
    // history on disk.
    let compressed = agent.organizer().wait_idle(None).await;
    session
        .save(&agent.snapshot())
        .map_err(|e| e.to_string())?;
    let path = cli.session.display().to_string();
    handler.on_event(&AgentEvent::SessionSaved { path: &path });
    pool.shutdown();

    turn.map_err(|e| e.to_string())?;
    compressed.map_err(|e| e.to_string())?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
