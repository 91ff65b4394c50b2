use std::io::Write;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use opencode_client_error::ClientError;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::client::SessionClient;
use crate::config::{
    ClientConfig, ConfigError, ENV_BASE_URL, ENV_MAX_ATTEMPTS, ENV_PROMPT_TIMEOUT_MS,
    ENV_REQUEST_TIMEOUT_MS,
};
use crate::event_bus::SessionFilter;
use crate::types::{CreateSessionRequest, PromptRequest};

#[derive(Parser, Debug)]
#[command(name = "opencode-client", bin_name = "opencode-client")]
#[command(about = "Talk to a local OpenCode server", version)]
#[command(arg_required_else_help = true)]
pub struct OpencodeClientCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 'u', global = true, env = ENV_BASE_URL)]
    base_url: Option<String>,

    #[arg(long, global = true, env = ENV_REQUEST_TIMEOUT_MS)]
    timeout_ms: Option<u64>,

    #[arg(long, global = true, env = ENV_PROMPT_TIMEOUT_MS)]
    prompt_timeout_ms: Option<u64>,

    #[arg(long, global = true, env = ENV_MAX_ATTEMPTS)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report server health.
    Health,
    /// List sessions.
    Sessions,
    /// Show busy and retrying sessions.
    Status,
    /// Create a session.
    Create(CreateArgs),
    Get(SessionArgs),
    Delete(SessionArgs),
    /// Send a prompt and print the assistant reply.
    Prompt(PromptArgs),
    Messages(MessagesArgs),
    /// Abort the running turn of a session.
    Abort(SessionArgs),
    /// Print events as JSON lines until interrupted.
    Events(EventsArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long, short = 't')]
    title: Option<String>,
    #[arg(long, short = 'd')]
    directory: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    session_id: String,
}

#[derive(Args, Debug)]
pub struct PromptArgs {
    session_id: String,
    text: String,
    /// Return once the server accepted the prompt.
    #[arg(long)]
    no_wait: bool,
    #[arg(long, short = 'a')]
    agent: Option<String>,
    /// `provider/model`.
    #[arg(long, short = 'm')]
    model: Option<String>,
}

#[derive(Args, Debug)]
pub struct MessagesArgs {
    session_id: String,
    #[arg(long, short = 'l')]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EventsArgs {
    #[arg(long, short = 's')]
    session: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OpencodeClientCli {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.prompt_timeout_ms {
            config.prompt_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        config
    }
}

pub fn run_opencode_client() -> Result<(), CliError> {
    let cli = OpencodeClientCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }

    let client = SessionClient::new(cli.client_config())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run_command(&client, &cli.command));
    if let Err(CliError::Client(err)) = &result {
        write_stderr_line(&serde_json::to_string_pretty(&err.to_problem_details())?)?;
    }
    result
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub async fn run_command(client: &SessionClient, command: &Command) -> Result<(), CliError> {
    match command {
        Command::Health => print_json(&client.health().await?),
        Command::Sessions => print_json(&client.list_sessions().await?),
        Command::Status => print_json(&client.session_statuses().await?),
        Command::Create(args) => {
            let mut request = CreateSessionRequest::default();
            if let Some(title) = &args.title {
                request = request.with_title(title);
            }
            if let Some(directory) = &args.directory {
                request = request.with_directory(directory);
            }
            print_json(&client.create_session(request).await?)
        }
        Command::Get(args) => print_json(&client.get_session(&args.session_id).await?),
        Command::Delete(args) => {
            client.delete_session(&args.session_id).await?;
            print_json(&json!({ "deleted": args.session_id }))
        }
        Command::Prompt(args) => run_prompt(client, args).await,
        Command::Messages(args) => {
            print_json(&client.list_messages(&args.session_id, args.limit).await?)
        }
        Command::Abort(args) => {
            client.abort_session(&args.session_id).await?;
            print_json(&json!({ "aborted": args.session_id }))
        }
        Command::Events(args) => run_events(client, args).await,
    }
}

async fn run_prompt(client: &SessionClient, args: &PromptArgs) -> Result<(), CliError> {
    let mut prompt = PromptRequest::text(&args.text);
    if let Some(agent) = &args.agent {
        prompt = prompt.with_agent(agent);
    }
    if let Some(model) = &args.model {
        let (provider, model) = model.split_once('/').ok_or_else(|| {
            CliError::InvalidArgument(format!("model must be provider/model, got `{model}`"))
        })?;
        prompt = prompt.with_model(provider, model);
    }

    if args.no_wait {
        client.prompt_non_blocking(&args.session_id, prompt).await?;
        return print_json(&json!({ "accepted": args.session_id }));
    }
    let reply = client.send_message(&args.session_id, prompt).await?;
    print_json(&reply)
}

async fn run_events(client: &SessionClient, args: &EventsArgs) -> Result<(), CliError> {
    let mut subscription = client.subscribe_to_events(SessionFilter::from(args.session.clone()))?;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = subscription.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        write_stdout_line(&serde_json::to_string(&event)?)?;
    }
    client.shutdown();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    write_stdout_line(&serde_json::to_string_pretty(value)?)
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
