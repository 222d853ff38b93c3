use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qchat::client::RelayClient;
use qchat::config::{
    ClientConfig, ProfileConfig, RelayConfig, DEFAULT_BIND, DEFAULT_KEEP_ALIVE_SECS,
    DEFAULT_SYSTEM_PROMPT, GROQ_BASE_URL, THESYS_BASE_URL,
};
use qchat::db::Database;
use qchat::session::{ChatSession, TurnOutcome};
use qchat::store::{ConversationStore, StoreEvent};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "qchat", version, about = "Streaming chat relay and terminal client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Send one message through a running relay and stream the reply
    Ask(AskArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "QCHAT_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,
    #[arg(long, env = "THESYS_API_KEY", hide_env_values = true)]
    thesys_api_key: Option<String>,
    #[arg(long, env = "THESYS_BASE_URL", default_value = THESYS_BASE_URL)]
    thesys_base_url: String,
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    groq_api_key: Option<String>,
    #[arg(long, env = "GROQ_BASE_URL", default_value = GROQ_BASE_URL)]
    groq_base_url: String,
    /// Default system prompt used when a request carries none
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,
    /// Seconds between keep-alive comments on an idle stream
    #[arg(long, env = "QCHAT_KEEP_ALIVE_SECS", default_value_t = DEFAULT_KEEP_ALIVE_SECS)]
    keep_alive_secs: u64,
}

#[derive(Args)]
struct AskArgs {
    #[arg(long, env = "QCHAT_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay_url: String,
    #[arg(long, env = "QCHAT_DATABASE", default_value = "qchat.db")]
    database: PathBuf,
    /// Continue an existing conversation instead of starting a new one
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,
    /// Message text
    #[arg(required = true)]
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Ask(args) => ask(args).await,
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qchat=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_prompt(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read system prompt from {}", path.display()))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let default_system_prompt = match &args.system_prompt_file {
        Some(path) => read_prompt(path)?,
        None => DEFAULT_SYSTEM_PROMPT.to_string(),
    };

    let config = RelayConfig {
        bind: args.bind,
        primary: args
            .thesys_api_key
            .map(|key| ProfileConfig::thesys(key).with_base_url(args.thesys_base_url)),
        fallback: args
            .groq_api_key
            .map(|key| ProfileConfig::groq(key).with_base_url(args.groq_base_url)),
        default_system_prompt,
        keep_alive: Duration::from_secs(args.keep_alive_secs.max(1)),
    };

    qchat::run(config).await.context("Relay server failed")
}

async fn ask(args: AskArgs) -> Result<()> {
    let config = ClientConfig {
        relay_url: args.relay_url,
        database_path: args.database,
        system_prompt: args
            .system_prompt_file
            .as_deref()
            .map(read_prompt)
            .transpose()?,
    };

    let db = Database::open(&config.database_path).with_context(|| {
        format!("Failed to open database at {}", config.database_path.display())
    })?;
    let store = Arc::new(ConversationStore::load(db)?);
    if let Some(id) = &args.conversation {
        store.select(id)?;
    }

    let session = ChatSession::new(Arc::clone(&store), RelayClient::new(&config.relay_url))
        .with_system_prompt(config.system_prompt);

    let mut updates = store.subscribe();
    let handle = session.send(&args.text.join(" "))?;
    let conversation_id = handle.conversation_id().to_string();
    let cancel = handle.cancellation_token();

    let mut printer = ReplyPrinter::new(conversation_id.clone());
    let join = handle.join();
    tokio::pin!(join);

    let outcome = loop {
        tokio::select! {
            outcome = &mut join => break outcome,
            update = updates.recv() => match update {
                Ok(event) => printer.observe(&event)?,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => cancel.cancel(),
        }
    };
    while let Ok(event) = updates.try_recv() {
        printer.observe(&event)?;
    }

    println!();
    eprintln!("conversation: {} ({:?})", conversation_id, outcome);
    if outcome == TurnOutcome::Failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Prints only the newly arrived suffix of a streaming reply.
struct ReplyPrinter {
    conversation_id: String,
    printed: usize,
}

impl ReplyPrinter {
    fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            printed: 0,
        }
    }

    fn observe(&mut self, event: &StoreEvent) -> Result<()> {
        let StoreEvent::ContentUpdated {
            conversation_id,
            content,
        } = event
        else {
            return Ok(());
        };
        if conversation_id != &self.conversation_id
            || content.len() <= self.printed
            || !content.is_char_boundary(self.printed)
        {
            return Ok(());
        }
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(content[self.printed..].as_bytes())?;
        stdout.flush()?;
        self.printed = content.len();
        Ok(())
    }
}
