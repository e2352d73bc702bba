mod bootstrap;
mod commands;
mod transport;

use anyhow::Result;
use chatgate_config::ConfigLoader;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatgate")]
#[command(about = "ChatGate - multi-provider conversational assistant")]
#[command(version)]
struct Cli {
    /// Path to config file (default: ~/.chatgate/config.yml)
    #[arg(short, long, global = true, env = "CHATGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// User the conversation belongs to
    #[arg(long, global = true, env = "USER", default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and stream the answer
    Chat {
        /// Conversation id
        conversation: String,
        message: String,
        /// Start a fresh conversation, dropping any existing one with this id
        #[arg(long)]
        new: bool,
        /// Switch the conversation to this catalog model first
        #[arg(long)]
        model: Option<String>,
        /// Image to attach (URL, data URL, or local path)
        #[arg(long)]
        attach: Option<String>,
    },
    /// Print the live history of a conversation
    History { conversation: String },
    /// Change conversation settings
    Settings {
        conversation: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        /// Use a named role from the config as system prompt
        #[arg(long, conflicts_with_all = ["prompt", "clear_prompt"])]
        role: Option<String>,
        /// Free-form system prompt
        #[arg(long, conflicts_with = "clear_prompt")]
        prompt: Option<String>,
        #[arg(long)]
        clear_prompt: bool,
        /// History retention in days
        #[arg(long)]
        retention: Option<u32>,
        /// Live entries allowed before summarization
        #[arg(long)]
        context_limit: Option<usize>,
        #[arg(long)]
        streaming: Option<bool>,
    },
    /// Remove expired history of a conversation
    Prune { conversation: String },
    /// Delete a conversation and all its history
    Delete { conversation: String },
    /// List catalog models
    Models,
    /// Check every configured provider
    Health,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref())?;
    init_tracing(&config.log.level, cli.log_json || config.log.json);

    let engine = bootstrap::Engine::build(config)?;

    match cli.command {
        Commands::Chat {
            conversation,
            message,
            new,
            model,
            attach,
        } => {
            commands::chat(
                &engine,
                &cli.user,
                commands::ChatArgs {
                    conversation,
                    message,
                    new,
                    model,
                    attach,
                },
            )
            .await
        }
        Commands::History { conversation } => commands::history(&engine, &conversation).await,
        Commands::Settings {
            conversation,
            model,
            temperature,
            role,
            prompt,
            clear_prompt,
            retention,
            context_limit,
            streaming,
        } => {
            commands::settings(
                &engine,
                &conversation,
                commands::SettingsArgs {
                    model,
                    temperature,
                    role,
                    prompt,
                    clear_prompt,
                    retention,
                    context_limit,
                    streaming,
                },
            )
            .await
        }
        Commands::Prune { conversation } => commands::prune(&engine, &conversation).await,
        Commands::Delete { conversation } => commands::delete(&engine, &conversation).await,
        Commands::Models => {
            commands::models(&engine);
            Ok(())
        }
        Commands::Health => {
            commands::health(&engine).await;
            Ok(())
        }
    }
}
