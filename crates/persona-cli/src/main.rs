use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use persona_core::paths::{config_path, data_dir, CONFIG_FILE};
use persona_core::{CoreConfig, IdentityManager, IdentityRecord, NewIdentity, ProfileUpdate};
use std::path::PathBuf;
use tracing::{debug, info};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "persona")]
#[command(about = "Manage device-local identities", long_about = None)]
struct Cli {
    /// Data directory (defaults to the per-user data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file (defaults to config.json in the data dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new identity
    Create {
        handle: String,
        #[arg(long, default_value = "person")]
        icon: String,
        #[arg(long, default_value = "#808080")]
        color: String,
    },

    /// List identities
    List,

    /// Verify a PIN and print the identity's public key
    Unlock { id: String },

    /// Show how many PIN attempts are left
    Attempts { id: String },

    /// Edit profile metadata
    Update {
        id: String,
        #[arg(long)]
        handle: Option<String>,
        #[arg(long)]
        icon: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },

    /// Change an identity's PIN
    ChangePin { id: String },

    /// Permanently delete an identity
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show or set the session lock timeout in minutes
    Timeout { minutes: Option<u32> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_file = match (&cli.config, &cli.data_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => dir.join(CONFIG_FILE),
        (None, None) => config_path()?,
    };
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    debug!(
        data_dir = %data_dir.display(),
        config = %config_file.display(),
        "opening identity store"
    );
    let config = CoreConfig::load(&config_file)
        .with_context(|| format!("loading {}", config_file.display()))?;
    let mgr = IdentityManager::open(&data_dir, config)?;

    match cli.command {
        Commands::Create { handle, icon, color } => {
            let pin = prompt_pin_twice("New PIN: ")?;
            let record = mgr
                .create(NewIdentity { handle, icon, color }, &pin)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary(&record))?);
        }

        Commands::List => {
            let all: Vec<_> = mgr.list().iter().map(summary).collect();
            println!("{}", serde_json::to_string_pretty(&all)?);
        }

        Commands::Unlock { id } => {
            let pin = prompt_pin("PIN: ")?;
            let unlocked = mgr.unlock(&id, &pin).await?;
            if let Some(e) = &unlocked.persist_error {
                eprintln!("warning: {e}");
            }
            let out = serde_json::json!({
                "id": unlocked.record.id,
                "handle": unlocked.payload.profile.handle,
                "publicKey": unlocked.payload.public_key_hex(),
                "expiresAt": unlocked.session.expires_at,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Attempts { id } => {
            println!("{}", mgr.remaining_attempts(&id)?);
        }

        Commands::Update { id, handle, icon, color } => {
            let record = mgr.update_profile(&id, ProfileUpdate { handle, icon, color })?;
            println!("{}", serde_json::to_string_pretty(&summary(&record))?);
        }

        Commands::ChangePin { id } => {
            let old = prompt_pin("Current PIN: ")?;
            let new = prompt_pin_twice("New PIN: ")?;
            mgr.change_pin(&id, &old, &new).await?;
            info!(identity_id = %id, "pin changed from cli");
            println!("PIN changed");
        }

        Commands::Delete { id, yes } => {
            if !yes {
                let record = mgr.get(&id)?;
                eprint!("Type the handle '{}' to delete this identity: ", record.handle);
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                if answer.trim() != record.handle {
                    return Err(anyhow!("confirmation did not match; nothing deleted"));
                }
            }
            mgr.delete(&id).await?;
            info!(identity_id = %id, "identity deleted from cli");
            println!("deleted {id}");
        }

        Commands::Timeout { minutes } => {
            if let Some(minutes) = minutes {
                mgr.set_lock_timeout(minutes)?;
                info!(minutes, "lock timeout updated");
            }
            println!("{}", mgr.lock_timeout());
        }
    }

    Ok(())
}

fn summary(record: &IdentityRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "handle": record.handle,
        "icon": record.icon,
        "color": record.color,
        "createdAt": record.created_at,
        "docCount": record.doc_count,
        "attemptCount": record.attempt_count,
    })
}

fn prompt_pin(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pin) = std::env::var("PERSONA_PIN") {
        if !pin.is_empty() {
            return Ok(Zeroizing::new(pin));
        }
    }
    let pin = rpassword::prompt_password(prompt).map_err(|e| anyhow!("PIN prompt: {e}"))?;
    Ok(Zeroizing::new(pin.trim().to_string()))
}

fn prompt_pin_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pin) = std::env::var("PERSONA_NEW_PIN") {
        if !pin.is_empty() {
            return Ok(Zeroizing::new(pin));
        }
    }
    let first = Zeroizing::new(
        rpassword::prompt_password(prompt)
            .map_err(|e| anyhow!("PIN prompt: {e}"))?
            .trim()
            .to_string(),
    );
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm PIN: ").map_err(|e| anyhow!("PIN prompt: {e}"))?,
    );
    if first.as_str() != second.trim() {
        return Err(anyhow!("PINs do not match"));
    }
    Ok(first)
}
