use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use pkgsync::{Outcome, Pipeline, SyncRequest, WebhookServer};
use pkgsync_config::{CONFIG_FILE, Config, find_config};
use pkgsync_version::{BranchConvention, RefName, derive_version_with};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "pkgsync", version)]
#[command(about = "Publish Composer packages to Cloudsmith from git pushes")]
struct Cli {
    /// Configuration file (default: nearest pkgsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs (and `sync` results) as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook server.
    Serve {
        /// Address to listen on (overrides `server.listen`)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run the pipeline once for a repository and ref.
    Sync {
        /// Remote URL of a configured repository
        #[arg(long)]
        repository: String,
        /// Ref to publish, e.g. refs/heads/main or refs/tags/1.0.0
        #[arg(long = "ref")]
        git_ref: String,
        /// Treat the ref as deleted upstream.
        #[arg(long)]
        deleted: bool,
    },
    /// Print the version a ref would publish as.
    Version {
        /// Ref to derive from, e.g. refs/tags/v1.2 or refs/heads/1.x
        #[arg(long = "ref")]
        git_ref: String,
    },
    /// Validate the configuration and list tracked repositories.
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json);

    match cli.cmd {
        Commands::Serve { listen } => {
            let config = load_config(cli.config.as_deref())?;
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let pipeline = Arc::new(Pipeline::from_config(config));
            WebhookServer::bind(&listen, pipeline)?.run()?;
        }
        Commands::Sync {
            repository,
            git_ref,
            deleted,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let pipeline = Pipeline::from_config(config);
            let outcome = pipeline.sync(&SyncRequest {
                repository,
                git_ref,
                deleted,
            })?;
            if cli.json {
                println!("{}", serde_json::to_string(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
        }
        Commands::Version { git_ref } => {
            let convention = match config_path(cli.config.as_deref()) {
                Some(path) if path.exists() => Config::load(&path)?.versioning.branch_convention(),
                _ => BranchConvention::default(),
            };
            print_version(&git_ref, &convention)?;
        }
        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            print_check(&config)?;
        }
    }

    Ok(())
}

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config(&cwd)),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = config_path(explicit).unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let config = Config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    tracing::debug!(path = %path.display(), repositories = config.repositories.len(), "loaded configuration");
    Ok(config)
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Pong { hook_id } => println!("pong ({hook_id})"),
        Outcome::Skipped {
            package,
            reference,
            reason,
        } => println!("skipped {package}@{reference}: {reason}"),
        Outcome::Deleted {
            package,
            version,
            existed,
        } => {
            let state = if *existed { "deleted" } else { "not present" };
            println!("{package}@{version}: {state}");
        }
        Outcome::Published {
            package,
            version,
            commit,
            receipt,
        } => {
            println!("published {package}@{version} ({})", version.normalized);
            println!("commit: {commit}");
            println!("slug: {}", receipt.slug_perm);
            if let Some(url) = &receipt.self_html_url {
                println!("url: {url}");
            }
        }
    }
}

fn print_version(git_ref: &str, convention: &BranchConvention) -> Result<()> {
    let name = RefName::parse(git_ref);
    match derive_version_with(name.full(), name.kind(), convention) {
        Ok(version) => {
            println!("kind: {}", name.kind());
            println!("version: {}", version.raw);
            println!("normalized: {}", version.normalized);
            Ok(())
        }
        Err(reason) => bail!("{git_ref} is not publishable: {reason}"),
    }
}

fn print_check(config: &Config) -> Result<()> {
    println!("owner: {}", config.owner);
    println!("target_repository: {}", config.target_repository);
    println!("repositories_dir: {}", config.repositories_dir.display());
    println!("artifacts_dir: {}", config.artifacts_dir.display());
    println!("webhook: {} {}", config.server.listen, config.server.path);
    println!(
        "signature_verification: {}",
        if config.webhook.secret.is_some() { "on" } else { "off" }
    );
    println!("api_key_configured: {}", config.registry.api_key.is_some());
    println!();

    for repo in &config.repositories {
        let path = config.working_copy_path(repo)?;
        let source = if repo.publish_source { " [source]" } else { "" };
        println!("{} -> {}{source}", repo.url, path.display());
    }
    Ok(())
}
