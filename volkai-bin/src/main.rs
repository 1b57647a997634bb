use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use volkai_core::{
    config::Config,
    model::{GenerationParams, Message, Role},
    pipeline::Pipeline,
    prompt::format_prompt,
    source_factory::build_source,
    stream::StreamEvent,
};

mod logging;
mod server;

#[derive(Parser)]
#[command(author, version, about = "VolkAI streaming chat service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// JSON or TOML config file; environment variables are used when absent
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Listen address, overrides the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Stream a single reply to stdout
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },
}

/// Load `KEY=value` pairs from `path` (or `./.env` and its parents) into the
/// process environment. Variables that are already set win. A missing file
/// is not an error.
fn load_dotenv(path: Option<&Path>) -> Result<Option<PathBuf>, dotenv::Error> {
    let loaded = match path {
        Some(p) => dotenv::from_path(p).map(|_| p.to_path_buf()),
        None => dotenv::dotenv(),
    };
    match loaded {
        Ok(p) => Ok(Some(p)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let cfg = match path {
        Some(p) => Config::from_path(p)?,
        None => Config::from_env()?,
    };
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before logging so `RUST_LOG` may come from the file too.
    let dotenv = load_dotenv(None);
    logging::init();
    match dotenv {
        Ok(Some(path)) => tracing::debug!(path = %path.display(), "loaded environment file"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "ignoring unreadable .env file"),
    }
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            let source = build_source(&cfg)?;
            let addr = cfg.server.bind.clone();
            let state = server::AppState::new(source, cfg)?;

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(addr = %listener.local_addr()?, "listening");
            axum::serve(listener, server::router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Commands::Chat {
            message,
            config,
            max_tokens,
            temperature,
        } => {
            let cfg = load_config(config.as_deref())?;
            let params = GenerationParams {
                max_tokens: max_tokens.unwrap_or(cfg.defaults.max_tokens),
                temperature: temperature.unwrap_or(cfg.defaults.temperature),
            };
            params.validate()?;
            let source = build_source(&cfg)?;
            let pipeline = Pipeline::from_cfg(&cfg.stream)?;
            let prompt = format_prompt(
                &cfg.prompt.preamble,
                &[Message {
                    role: Role::User,
                    content: message,
                }],
            );

            let mut events = pipeline.start(source.as_ref(), &prompt, params, None).await?;
            let mut saw_text = false;
            while let Some(ev) = events.next().await {
                match ev {
                    StreamEvent::Segment(text) => {
                        saw_text = true;
                        print!("{text}");
                        io::stdout().flush().ok();
                    }
                    StreamEvent::Error(err) => {
                        if saw_text {
                            println!();
                        }
                        return Err(err.into());
                    }
                    terminal => {
                        if saw_text {
                            println!();
                        }
                        if let Some(t) = terminal.termination() {
                            eprintln!("[{}]", t.as_str());
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
