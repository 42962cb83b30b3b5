use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use matrix_sdk_secret_storage::{
    AccountDataError, AccountDataStore, KeySpec, ProgressListener, SecretStorageSettings,
    SharedSecretStorage,
};
use serde_json::Value;

/// A command line demo showcasing how secret storage works.
///
/// Secret storage is an account data backed encrypted key/value store. This
/// demo keeps the account data in a local JSON file instead of syncing it
/// with a homeserver.
#[derive(Parser, Debug)]
struct Cli {
    /// The JSON file holding the account data, it's created if it doesn't
    /// exist.
    #[clap(long, default_value = "account_data.json")]
    account_data: PathBuf,

    /// The number of PBKDF2 rounds for new passphrase based keys.
    #[clap(long)]
    iterations: Option<u32>,

    /// Enable verbose logging output.
    #[clap(short, long, action)]
    verbose: bool,

    /// The sub-command to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new storage key and make it the default key.
    GenerateKey {
        key_id: String,
        /// Derive the key from this passphrase instead of generating a random
        /// key.
        #[clap(long)]
        passphrase: Option<String>,
    },
    /// Encrypt a secret for the given keys, or for the default key.
    SetSecret {
        secret_name: String,
        secret: String,
        #[clap(long = "key")]
        key_ids: Vec<String>,
    },
    /// Decrypt a secret using a recovery key or a passphrase.
    GetSecret {
        secret_name: String,
        #[clap(long = "key")]
        key_id: Option<String>,
        #[clap(long, conflicts_with = "passphrase", required_unless_present = "passphrase")]
        recovery_key: Option<String>,
        #[clap(long)]
        passphrase: Option<String>,
    },
    /// Check that a key can unlock the given secrets.
    Check {
        secret_names: Vec<String>,
        #[clap(long = "key")]
        key_id: Option<String>,
    },
}

/// An account data store persisted as a single JSON object in a file.
#[derive(Debug)]
struct JsonFileStore {
    path: PathBuf,
    documents: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    async fn open(path: PathBuf) -> Result<Self> {
        let documents = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid account data file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, documents: RwLock::new(documents) })
    }
}

#[async_trait]
impl AccountDataStore for JsonFileStore {
    fn get_account_data(&self, event_type: &str) -> Result<Option<Value>, AccountDataError> {
        Ok(self.documents.read().unwrap_or_else(PoisonError::into_inner).get(event_type).cloned())
    }

    async fn set_account_data(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<(), AccountDataError> {
        // Only commit to the in-memory view once the file was written.
        let mut documents =
            self.documents.read().unwrap_or_else(PoisonError::into_inner).clone();
        documents.insert(event_type.to_owned(), content);

        let serialized = serde_json::to_vec_pretty(&documents)?;
        tokio::fs::write(&self.path, serialized).await.map_err(AccountDataError::backend)?;

        *self.documents.write().unwrap_or_else(PoisonError::into_inner) = documents;

        Ok(())
    }
}

fn progress_printer() -> Arc<dyn ProgressListener> {
    Arc::new(|progress: u32, total: u32| {
        if progress == total || progress % (total / 10).max(1) == 0 {
            eprintln!("Deriving key from passphrase: {progress}/{total}");
        }
    })
}

async fn generate_key(
    storage: &SharedSecretStorage,
    key_id: &str,
    passphrase: Option<&str>,
) -> Result<()> {
    let info = match passphrase {
        Some(passphrase) => {
            storage
                .generate_key_with_passphrase(
                    key_id,
                    key_id,
                    passphrase,
                    None,
                    Some(progress_printer()),
                )
                .await?
        }
        None => storage.generate_key(key_id, key_id, None).await?,
    };

    storage.set_default_key(key_id).await?;

    println!("Created the secret storage key {key_id} and made it the default key");
    println!("Recovery key: {}", info.recovery_key);

    Ok(())
}

async fn get_secret(
    storage: &SharedSecretStorage,
    secret_name: &str,
    key_id: Option<&str>,
    recovery_key: Option<&str>,
    passphrase: Option<&str>,
) -> Result<()> {
    let key_spec = match (recovery_key, passphrase) {
        (Some(recovery_key), _) => KeySpec::from_recovery_key(recovery_key)?,
        (None, Some(passphrase)) => {
            let key_id = match key_id {
                Some(key_id) => key_id.to_owned(),
                None => storage.get_default_key()?.id,
            };

            storage.key_spec_from_passphrase(&key_id, passphrase, Some(progress_printer())).await?
        }
        (None, None) => anyhow::bail!("Either a recovery key or a passphrase is needed"),
    };

    let secret = storage.get_secret(secret_name, key_id, &key_spec).await?;

    println!("Secret: {}", String::from_utf8_lossy(&secret));

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt::init();
    }

    let mut settings = SecretStorageSettings::default();
    if let Some(iterations) = cli.iterations {
        settings.passphrase_iterations = iterations;
    }

    let store = JsonFileStore::open(cli.account_data).await?;
    let storage = SharedSecretStorage::with_settings(store, settings);

    match cli.command {
        Commands::GenerateKey { key_id, passphrase } => {
            generate_key(&storage, &key_id, passphrase.as_deref()).await
        }
        Commands::SetSecret { secret_name, secret, key_ids } => {
            let key_ids: Vec<&str> = key_ids.iter().map(String::as_str).collect();
            storage.store_secret(&secret_name, secret.as_bytes(), &key_ids).await?;

            println!("Secret {secret_name} was successfully encrypted and stored");

            Ok(())
        }
        Commands::GetSecret { secret_name, key_id, recovery_key, passphrase } => {
            get_secret(
                &storage,
                &secret_name,
                key_id.as_deref(),
                recovery_key.as_deref(),
                passphrase.as_deref(),
            )
            .await
        }
        Commands::Check { secret_names, key_id } => {
            let secret_names: Vec<&str> = secret_names.iter().map(String::as_str).collect();
            let info = storage
                .check_should_be_able_to_access_secrets(&secret_names, key_id.as_deref())?;

            if info.has_passphrase {
                println!("All secrets are accessible, the key can be opened with a passphrase");
            } else {
                println!("All secrets are accessible, the key can be opened with a recovery key");
            }

            Ok(())
        }
    }
}
