//! Ephemeral Store CLI
//!
//! Inspects and migrates keys in a configured store chain. Reads through a
//! chain migrate keys into the newest store exactly as library reads do.
//!
//! ```text
//! ephemeral-store --store memory://new --store file:///var/lib/old get Post-1
//! ephemeral-store --config stores.yaml incr Post-1-views --by 5 --expires-in 600
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ephemeral_store::{Backend, BackendRef, BackendSettings, Expiry, StoreSpec};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Ephemeral Store - inspect and migrate per-object attribute storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Store address, newest first (memory://<name> or file://<path>)
    #[arg(long = "store", env = "EPHEMERAL_STORES", value_delimiter = ',')]
    stores: Vec<StoreSpec>,

    /// YAML backend settings (overrides --store)
    #[arg(long, env = "EPHEMERAL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Give each concurrent caller its own connection
    #[arg(long, env = "EPHEMERAL_THREAD_SAFE")]
    thread_safe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print a stored hash
    Get {
        key: String,
    },
    /// Store a raw hash value
    Set {
        key: String,
        value: String,
        /// Expire after this many seconds
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Delete a key from every store
    Del {
        key: String,
    },
    Exists {
        key: String,
    },
    /// Print the remaining TTL in seconds
    Ttl {
        key: String,
    },
    Expire {
        key: String,
        seconds: i64,
    },
    /// Print a counter
    Getc {
        key: String,
    },
    Setc {
        key: String,
        value: i64,
        #[arg(long)]
        expires_in: Option<i64>,
    },
    Incr {
        key: String,
        #[arg(long, default_value_t = 1)]
        by: i64,
        #[arg(long)]
        expires_in: Option<i64>,
    },
    Decr {
        key: String,
        #[arg(long, default_value_t = 1)]
        by: i64,
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Clear every store in the chain
    Flush,
}

fn expiry(expires_in: Option<i64>) -> Expiry {
    Expiry::from_ttl(expires_in)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let backend = build_backend(&args)?;
    info!(backend = %backend.fingerprint(), "Opened backend");

    run(backend.as_ref(), args.command).await
}

fn build_backend(args: &Args) -> anyhow::Result<BackendRef> {
    let settings = match &args.config {
        Some(path) => BackendSettings::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut settings = BackendSettings::new(args.stores.clone());
            settings.thread_safe = args.thread_safe;
            settings
        }
    };
    debug!(?settings, "Building backend");
    Ok(settings.build()?)
}

async fn run(backend: &dyn Backend, command: Cmd) -> anyhow::Result<()> {
    match command {
        Cmd::Get { key } => match backend.get(&key, Expiry::Never).await? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Cmd::Set {
            key,
            value,
            expires_in,
        } => {
            serde_json::from_str::<serde_json::Value>(&value)
                .context("value must be valid JSON")?;
            backend.set(&key, &value, expiry(expires_in)).await?;
            println!("OK");
        }
        Cmd::Del { key } => {
            backend.del(&key).await?;
            println!("OK");
        }
        Cmd::Exists { key } => println!("{}", backend.exists(&key).await?),
        Cmd::Ttl { key } => match backend.ttl(&key).await? {
            Some(seconds) => println!("{}", seconds),
            None => println!("(none)"),
        },
        Cmd::Expire { key, seconds } => {
            backend.expire(&key, seconds).await?;
            println!("OK");
        }
        Cmd::Getc { key } => match backend.getc(&key, Expiry::Never).await? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Cmd::Setc {
            key,
            value,
            expires_in,
        } => {
            backend.setc(&key, value, expiry(expires_in)).await?;
            println!("OK");
        }
        Cmd::Incr {
            key,
            by,
            expires_in,
        } => println!("{}", backend.incrby(&key, by, expiry(expires_in)).await?),
        Cmd::Decr {
            key,
            by,
            expires_in,
        } => println!("{}", backend.decrby(&key, by, expiry(expires_in)).await?),
        Cmd::Flush => {
            backend.flush().await?;
            println!("OK");
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so command output stays pipeable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}
