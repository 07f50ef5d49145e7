//! tether — WebSocket LLM gateway
//!
//! Usage:
//!   tether serve [--bind 0.0.0.0] [--port 8787] [--echo]
//!   tether init
//!   tether mint-token user-42
//!   tether users add user-42 --email a@example.com --credits 10
//!   tether usage user-42

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_core::config::{TetherConfig, default_config_path};
use tether_core::{AccountStore, ProviderRouter, UserIdentity};
use tether_gateway::GatewayServer;
use tether_ledger::SqliteLedger;

#[derive(Parser)]
#[command(name = "tether", version, about = "Authenticated, metered LLM access for desktop clients")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Also register the offline echo provider
        #[arg(long)]
        echo: bool,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Ask a running gateway for a handshake token
    MintToken {
        user_id: String,
        /// Gateway base URL (default: from config)
        #[arg(long)]
        url: Option<String>,
    },
    /// Manage accounts in the ledger
    Users {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Show recent usage for a user
    Usage {
        user_id: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user, or update email and tier of an existing one
    Add {
        user_id: String,
        #[arg(long, default_value = "")]
        email: String,
        /// Opening balance (ignored for existing users)
        #[arg(long, default_value_t = 0.0)]
        credits: f64,
        #[arg(long, default_value = "free")]
        tier: String,
    },
    Show {
        user_id: String,
    },
    /// Add credits (negative to remove)
    Credit {
        user_id: String,
        #[arg(allow_negative_numbers = true)]
        amount: f64,
    },
    List,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(default_config_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let path = config_path(&cli);
    if let Commands::Init { force } = &cli.command {
        return init_config(&path, *force);
    }
    let config = TetherConfig::load(&path)?;

    match cli.command {
        Commands::Serve { bind, port, echo } => serve(config, bind, port, echo).await,
        Commands::Init { .. } => Ok(()),
        Commands::MintToken { user_id, url } => mint_token(&config, &user_id, url).await,
        Commands::Users { action } => {
            let ledger = open_ledger(&config)?;
            users(&ledger, action).await
        }
        Commands::Usage { user_id, limit } => {
            let ledger = open_ledger(&config)?;
            let rows = ledger.recent_usage(&user_id, limit).await?;
            if rows.is_empty() {
                println!("No usage recorded for '{}'", user_id);
            }
            for row in rows {
                println!(
                    "{}  {:<10} {:<32} {:>8} tokens  {:>10.4} credits",
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    row.provider,
                    row.model,
                    row.tokens_used,
                    row.credits_used
                );
            }
            Ok(())
        }
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(&TetherConfig::default())
        .context("Failed to render default config")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn open_ledger(config: &TetherConfig) -> Result<SqliteLedger> {
    SqliteLedger::open(config.ledger.resolved_path())
}

async fn serve(
    mut config: TetherConfig,
    bind: Option<String>,
    port: Option<u16>,
    echo: bool,
) -> Result<()> {
    if let Some(bind) = bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    config.providers.echo |= echo;
    if config.gateway.control_token.is_none() {
        warn!("No gateway.control_token set: /auth and /auth/tokens accept any caller");
    }

    let ledger = Arc::new(open_ledger(&config)?);
    let router = ProviderRouter::from_config(&config.providers)
        .context("Failed to initialize providers")?;
    let server = GatewayServer::new(&config, router, ledger);
    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    server.serve(listener, shutdown).await
}

async fn mint_token(config: &TetherConfig, user_id: &str, url: Option<String>) -> Result<()> {
    let base = url.unwrap_or_else(|| {
        let host = match config.gateway.bind.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, config.gateway.port)
    });
    let mut request = reqwest::Client::new()
        .post(format!("{}/auth/tokens", base.trim_end_matches('/')))
        .json(&serde_json::json!({ "userId": user_id }));
    if let Some(token) = &config.gateway.control_token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to reach gateway at {}", base))?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("Gateway returned a non-JSON body")?;
    if !status.is_success() {
        bail!(
            "Gateway refused ({}): {}",
            status,
            body["message"].as_str().unwrap_or("no message")
        );
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn users(ledger: &SqliteLedger, action: UserAction) -> Result<()> {
    match action {
        UserAction::Add {
            user_id,
            email,
            credits,
            tier,
        } => {
            ledger
                .upsert_user(&UserIdentity::new(&user_id, email, credits).with_tier(tier))
                .await?;
            print_user(ledger, &user_id).await
        }
        UserAction::Show { user_id } => print_user(ledger, &user_id).await,
        UserAction::Credit { user_id, amount } => {
            let balance = ledger.grant_credits(&user_id, amount).await?;
            println!("{}: {:.4} credits", user_id, balance);
            Ok(())
        }
        UserAction::List => {
            for user in ledger.list_users().await? {
                println!(
                    "{:<24} {:<28} {:<8} {:>12.4}",
                    user.user_id, user.email, user.subscription_tier, user.credits_remaining
                );
            }
            Ok(())
        }
    }
}

async fn print_user(ledger: &SqliteLedger, user_id: &str) -> Result<()> {
    let user = ledger
        .fetch_user(user_id)
        .await?
        .with_context(|| format!("user '{}' not found", user_id))?;
    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["tether", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Serve {
                port: Some(9000),
                bind: None,
                echo: false,
            }
        ));

        let cli = Cli::try_parse_from(["tether", "serve", "--echo"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { echo: true, .. }));

        let cli = Cli::try_parse_from([
            "tether", "users", "credit", "user-42", "-2.5", "--config", "/tmp/t.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        match cli.command {
            Commands::Users {
                action: UserAction::Credit { user_id, amount },
            } => {
                assert_eq!(user_id, "user-42");
                assert_eq!(amount, -2.5);
            }
            _ => panic!("expected users credit"),
        }
    }

    #[test]
    fn test_default_config_renders() {
        let rendered = toml::to_string_pretty(&TetherConfig::default()).unwrap();
        let parsed = TetherConfig::parse(&rendered).unwrap();
        assert_eq!(parsed.gateway.port, 8787);
    }

    #[tokio::test]
    async fn test_users_against_temp_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteLedger::open(dir.path().join("ledger.db")).unwrap();
        users(
            &ledger,
            UserAction::Add {
                user_id: "user-42".into(),
                email: "a@example.com".into(),
                credits: 5.0,
                tier: "pro".into(),
            },
        )
        .await
        .unwrap();
        users(
            &ledger,
            UserAction::Credit {
                user_id: "user-42".into(),
                amount: 2.5,
            },
        )
        .await
        .unwrap();
        let user = ledger.fetch_user("user-42").await.unwrap().unwrap();
        assert_eq!(user.credits_remaining, 7.5);
        assert!(print_user(&ledger, "ghost").await.is_err());
    }
}
