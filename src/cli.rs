//! Command-line surface.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::{BackupTask, TaskManager, TaskSpec};
use crate::error::BackupError;
use crate::provider::ProviderRegistry;
use crate::security::{task_key_entry, Credential, CredentialVault, EncryptionManager};
use crate::utils::config::Config;

/// Back up files and folders to remote storage
#[derive(Parser, Debug)]
#[command(name = "cloud-backup")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Unlocks the credential vault; required for every command
    #[arg(long = "master-password", global = true)]
    pub master_password: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a backup task and run or schedule it
    Create(CreateArgs),
    /// List saved tasks
    List,
    /// Store (or remove) credentials for a provider
    Configure(ConfigureArgs),
    /// Delete a saved task
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Decrypt an encrypted (and already decompressed) artifact
    Decrypt {
        /// Task whose key encrypted the artifact
        #[arg(long)]
        task: String,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// File or folder to back up
    #[arg(long)]
    pub source: String,

    /// Storage provider with credentials in the vault, e.g. `local`
    #[arg(long)]
    pub provider: String,

    /// Remote destination path
    #[arg(long, default_value = "")]
    pub dest: String,

    /// Cron expression; without it the task runs immediately
    #[arg(long)]
    pub schedule: Option<String>,

    #[arg(long)]
    pub recurring: bool,

    #[arg(long)]
    pub compress: bool,

    #[arg(long)]
    pub encrypt: bool,

    /// Encryption key (random when omitted)
    #[arg(long)]
    pub key: Option<String>,

    /// Upload to the destination path exactly as given
    #[arg(long)]
    pub single: bool,

    /// Keep the destination in sync with the source folder until interrupted
    #[arg(long)]
    pub sync: bool,
}

#[derive(Args, Debug)]
pub struct ConfigureArgs {
    #[arg(long)]
    pub provider: String,

    /// Client id, API token, or for `local` the target directory
    #[arg(long, default_value = "")]
    pub client_id: String,

    #[arg(long, default_value = "")]
    pub client_secret: String,

    #[arg(long, default_value = "http://localhost:8080/callback")]
    pub redirect_url: String,

    /// Remove the stored credentials instead
    #[arg(long)]
    pub remove: bool,
}

impl From<CreateArgs> for TaskSpec {
    fn from(args: CreateArgs) -> Self {
        TaskSpec {
            source_path: args.source,
            provider: args.provider,
            destination_path: args.dest,
            schedule: args.schedule,
            recurring: args.recurring,
            compress: args.compress,
            encrypt: args.encrypt,
            encryption_key: args.key,
            is_single: args.single,
            is_sync: args.sync,
        }
    }
}

/// Unlock the vault and run one command.
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let Some(password) = cli.master_password.filter(|p| !p.is_empty()) else {
        bail!("--master-password is required");
    };

    // Key derivation and the verifying read both block
    let credentials_dir = config.credentials_dir.clone();
    let vault = tokio::task::spawn_blocking(move || CredentialVault::open(&credentials_dir, &password))
        .await?
        .context("failed to unlock credential vault")?;
    let vault = Arc::new(vault);

    match cli.command {
        Commands::Configure(args) => configure(&vault, args).await,
        Commands::Decrypt { task, input, output } => decrypt(&vault, &task, input, output).await,
        command => {
            let providers = Arc::new(ProviderRegistry::with_builtin());
            let manager = TaskManager::new(config, vault, providers);
            let result = dispatch(&manager, command).await;
            manager.shutdown();
            result
        }
    }
}

async fn dispatch(manager: &TaskManager, command: Commands) -> Result<()> {
    match command {
        Commands::Create(args) => create(manager, args.into()).await,
        Commands::List => {
            let tasks = manager.list_tasks().await?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in &tasks {
                println!("{}", describe(task));
            }
            Ok(())
        }
        Commands::Delete { id } => {
            manager.delete_task(&id).await?;
            println!("Deleted task {id}");
            Ok(())
        }
        Commands::Configure(_) | Commands::Decrypt { .. } => Ok(()),
    }
}

async fn create(manager: &TaskManager, spec: TaskSpec) -> Result<()> {
    let task = manager.create_task(spec).await?;
    println!("Created task {}", task.id);

    if task.is_scheduled() {
        let run = manager.schedule_task(&task);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => return finish(&task, result),
            _ = tokio::signal::ctrl_c() => {
                info!(task_id = %task.id, "Interrupted, cancelling schedule");
                manager.cancel_schedule(&task.id);
            }
        }
        return match run.await {
            Err(BackupError::Cancelled(_)) => Ok(()),
            other => finish(&task, other),
        };
    }

    if task.is_sync {
        let handle = {
            let manager = manager.clone();
            let task = task.clone();
            tokio::spawn(async move { manager.execute_task(&task).await })
        };
        tokio::pin!(handle);

        tokio::select! {
            joined = &mut handle => return finish(&task, joined?),
            _ = tokio::signal::ctrl_c() => {}
        }

        info!(task_id = %task.id, "Interrupted, stopping sync");
        if !manager.stop_sync(&task.id) {
            warn!(task_id = %task.id, "Sync not running yet, shutting down");
            manager.shutdown();
        }
        return finish(&task, handle.await?);
    }

    let result = manager.execute_task(&task).await;
    finish(&task, result)
}

fn finish(task: &BackupTask, result: crate::error::Result<()>) -> Result<()> {
    result.with_context(|| format!("task {} failed", task.id))?;
    println!("Task {} completed", task.id);
    Ok(())
}

fn describe(task: &BackupTask) -> String {
    let mut flags = Vec::new();
    if task.compress {
        flags.push("compress");
    }
    if task.encrypt {
        flags.push("encrypt");
    }
    if task.is_single {
        flags.push("single");
    }
    if task.is_sync {
        flags.push("sync");
    }
    if task.recurring {
        flags.push("recurring");
    }

    let mut line = format!(
        "{}  {:<9}  {} -> {}:{}",
        task.id, task.status.as_str(), task.source_path, task.provider, task.destination_path
    );
    if let Some(schedule) = &task.schedule {
        line.push_str(&format!("  schedule={schedule}"));
    }
    if !flags.is_empty() {
        line.push_str(&format!("  [{}]", flags.join(",")));
    }
    if let Some(error) = &task.error_message {
        line.push_str(&format!("  error={error}"));
    }
    line
}

async fn configure(vault: &Arc<CredentialVault>, args: ConfigureArgs) -> Result<()> {
    if args.remove {
        let provider = args.provider.clone();
        vault
            .run_blocking(move |vault| vault.delete_credential(&provider))
            .await?;
        println!("Removed credentials for {}", args.provider);
        return Ok(());
    }
    if args.client_id.is_empty() {
        bail!("--client-id is required");
    }

    let credential = Credential {
        provider: args.provider.clone(),
        key: args.client_id,
        secret: args.client_secret,
        redirect_url: args.redirect_url,
    };
    vault
        .run_blocking(move |vault| vault.store_credential(credential))
        .await?;
    println!("Stored credentials for {}", args.provider);
    Ok(())
}

async fn decrypt(vault: &Arc<CredentialVault>, task_id: &str, input: PathBuf, output: PathBuf) -> Result<()> {
    let entry = task_key_entry(task_id);
    let key = vault
        .run_blocking(move |vault| vault.get_credential(&entry))
        .await
        .with_context(|| format!("no encryption key stored for task {task_id}"))?
        .secret;
    let manager = EncryptionManager::from_passphrase(&key)?;
    manager.decrypt_file(&input, &output).await?;
    println!("Decrypted {} to {}", input.display(), output.display());
    Ok(())
}
