//! Operator CLI. Every command builds the vault from the same settings the
//! library uses, so what works here works when embedded.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use zeroize::Zeroizing;

use vaultline::audit::AuditLog;
use vaultline::config::Settings;
use vaultline::crypto::secrets::{EncryptedBlob, MASTER_KEY_LEN};
use vaultline::crypto::tokens;
use vaultline::registry::{ConnectionConfig, ConnectionRegistry, ConnectionTimeouts, ConnectionType, ConnectorCatalog};
use vaultline::telemetry;
use vaultline::vault::VaultManager;

#[derive(Parser, Debug)]
#[command(name = "vaultline", version, about = "Credential vault and connection registry")]
struct Cli {
    /// JSON settings file; defaults plus environment overrides when absent.
    #[arg(long, global = true, env = "VAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh hex-encoded master key.
    GenerateKey,
    HashPassword {
        plaintext: String,
    },
    VerifyPassword {
        plaintext: String,
        hash: String,
    },
    /// Seal a value and print the storable token.
    Encrypt {
        plaintext: String,
    },
    Decrypt {
        token: String,
    },
    /// Print the HMAC-SHA256 of `data`, or check it against `--verify`.
    Hmac {
        data: String,
        #[arg(long)]
        verify: Option<String>,
    },
    /// Print non-secret vault metadata as JSON.
    Status,
    /// Register a connection with the TCP probe connector and report its health.
    Probe {
        host: String,
        port: u16,
        #[arg(long = "type", default_value = "TCP")]
        connection_type: ConnectionType,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path).with_context(|| format!("loading settings from {}", path.display())),
        None => Settings::from_env().context("reading settings from the environment"),
    }
}

fn open_vault(settings: &Settings) -> Result<Arc<VaultManager>> {
    let audit = Arc::new(AuditLog::new(settings.vault.audit_capacity));
    let vault = VaultManager::new(settings.vault.clone(), audit);
    vault
        .initialize(settings.vault.key_source())
        .context("initializing the vault")?;
    Ok(Arc::new(vault))
}

async fn probe(
    settings: &Settings,
    vault: Arc<VaultManager>,
    host: String,
    port: u16,
    connection_type: ConnectionType,
    timeout_ms: u64,
) -> Result<()> {
    let registry = ConnectionRegistry::new(
        settings.registry.clone(),
        vault,
        Arc::new(ConnectorCatalog::tcp_probes()),
    );

    let config = ConnectionConfig::new(format!("{host}:{port}"), connection_type, host, port).with_timeouts(
        ConnectionTimeouts {
            connect_ms: timeout_ms,
            health_check_ms: timeout_ms,
        },
    );
    let outcome = async {
        let created = registry.create_connection(config).await?;
        let health = registry.health_check(&created.id).await?;
        Ok::<_, vaultline::registry::RegistryError>((registry.get_status(&created.id), health))
    }
    .await;
    registry.shutdown().await;

    let (snapshot, health) = outcome.context("probing connection")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "connection": snapshot, "health": health }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;
    if let Err(err) = telemetry::init_tracing(settings.logging.filter.as_deref()) {
        eprintln!("logging disabled: {err}");
    }

    match cli.command {
        Command::GenerateKey => {
            println!("{}", tokens::generate_token(MASTER_KEY_LEN));
        }
        Command::HashPassword { plaintext } => {
            let plaintext = Zeroizing::new(plaintext);
            let vault = open_vault(&settings)?;
            println!("{}", vault.hash_password(&plaintext));
        }
        Command::VerifyPassword { plaintext, hash } => {
            let plaintext = Zeroizing::new(plaintext);
            let vault = open_vault(&settings)?;
            let matches = vault.verify_password(&plaintext, &hash);
            println!("{}", if matches { "match" } else { "no-match" });
        }
        Command::Encrypt { plaintext } => {
            let plaintext = Zeroizing::new(plaintext);
            let vault = open_vault(&settings)?;
            let blob = vault.encrypt_str(&plaintext).context("encryption failed")?;
            println!("{}", blob.to_token());
        }
        Command::Decrypt { token } => {
            let vault = open_vault(&settings)?;
            let blob = EncryptedBlob::from_token(token.trim()).context("invalid token")?;
            let plaintext = vault.decrypt_to_string(&blob).context("decryption failed")?;
            println!("{}", plaintext.as_str());
        }
        Command::Hmac { data, verify } => {
            let vault = open_vault(&settings)?;
            match verify {
                Some(tag) => {
                    if !vault.verify_hmac(data.as_bytes(), &tag, None)? {
                        bail!("hmac mismatch");
                    }
                    println!("valid");
                }
                None => println!("{}", vault.create_hmac(data.as_bytes(), None)?),
            }
        }
        Command::Status => {
            let vault = open_vault(&settings)?;
            println!("{}", serde_json::to_string_pretty(&vault.status())?);
        }
        Command::Probe {
            host,
            port,
            connection_type,
            timeout_ms,
        } => {
            let vault = open_vault(&settings)?;
            probe(&settings, Arc::clone(&vault), host, port, connection_type, timeout_ms).await?;
            vault.shutdown();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_probe_arguments() {
        use clap::Parser;
        let cli = Cli::try_parse_from(["vaultline", "probe", "localhost", "6379", "--type", "redis"])
            .expect("arguments should parse");
        match cli.command {
            super::Command::Probe {
                port, connection_type, ..
            } => {
                assert_eq!(port, 6379);
                assert_eq!(connection_type, vaultline::registry::ConnectionType::Redis);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
