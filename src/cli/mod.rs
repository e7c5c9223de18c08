//! Command-line interface for stepwise.
//!
//! Provides commands for managing checkpoint definitions and identities,
//! running a checkpoint once, and serving scheduled triggers.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::load_config;
use crate::core::runner::RunHooks;
use crate::core::triggers::bind_checkpoints;
use crate::domain::{Checkpoint, ExecuteEnvironment, Identity, RunState, Variables};
use crate::services::Services;

/// stepwise - Scheduled multi-step operations runner
#[derive(Parser, Debug)]
#[command(name = "stepwise")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List checkpoints
    List {
        /// Only show this section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Import (or replace) a checkpoint from a YAML file
    Import {
        /// Checkpoint definition file
        file: PathBuf,
    },

    /// Remove a checkpoint
    Remove { section: String, name: String },

    /// Run a checkpoint once
    Run {
        section: String,
        name: String,

        /// Input variable (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Run the scheduler until Ctrl-C
    Serve,

    /// Manage credential identities
    Identities {
        #[command(subcommand)]
        command: IdentityCommands,
    },

    /// Show resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum IdentityCommands {
    /// List identities
    List,

    /// Add an identity
    Add {
        username: String,

        /// Keychain handle for the secret
        #[arg(long)]
        credential: String,

        #[arg(short, long, default_value = "default")]
        group: String,

        #[arg(short, long, default_value = "")]
        comment: String,
    },

    /// Remove an identity by id
    Remove { id: Uuid },
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::List { section } => list_checkpoints(&services()?, section.as_deref()),
            Commands::Import { file } => import_checkpoint(&services()?, &file),
            Commands::Remove { section, name } => {
                remove_checkpoint(&services()?, &section, &name)
            }
            Commands::Run {
                section,
                name,
                vars,
            } => run_checkpoint(&services()?, &section, &name, vars.into_iter().collect()).await,
            Commands::Serve => serve(&services()?).await,
            Commands::Identities { command } => manage_identities(&services()?, command),
            Commands::Config => show_config(),
        }
    }
}

/// Build the service graph from the resolved configuration
fn services() -> Result<Services> {
    let config = load_config()?;
    Services::build(config, Handle::current())
}

fn list_checkpoints(services: &Services, section: Option<&str>) -> Result<()> {
    let checkpoints = match section {
        Some(section) => services.checkpoints.in_section(section),
        None => services.checkpoints.list(),
    };

    if checkpoints.is_empty() {
        println!("No checkpoints found. Use 'stepwise import <file.yaml>' to add one.");
        return Ok(());
    }

    println!("{:<20} {:<28} {:<16} {:<6}", "SECTION", "NAME", "TRIGGER", "STEPS");
    println!("{}", "-".repeat(72));
    for checkpoint in &checkpoints {
        let trigger = match checkpoint.trigger.represented_value.as_str() {
            "" => format!("{:?}", checkpoint.trigger.kind),
            value => format!("{:?}({value})", checkpoint.trigger.kind),
        };
        println!(
            "{:<20} {:<28} {:<16} {:<6}",
            checkpoint.section,
            checkpoint.name,
            trigger,
            checkpoint.steps.len()
        );
    }
    println!("\nTotal: {} checkpoints", checkpoints.len());
    Ok(())
}

fn import_checkpoint(services: &Services, file: &std::path::Path) -> Result<()> {
    let checkpoint = Checkpoint::from_file(file)?;
    checkpoint
        .validate()
        .with_context(|| format!("Invalid checkpoint in {}", file.display()))?;

    let label = checkpoint.qualified_name();
    let replaced = services.checkpoints.replace(checkpoint).is_some();
    services.flush()?;

    if replaced {
        eprintln!("Replaced checkpoint {label}");
    } else {
        eprintln!("Imported checkpoint {label}");
    }
    Ok(())
}

fn remove_checkpoint(services: &Services, section: &str, name: &str) -> Result<()> {
    if services.checkpoints.remove(section, name).is_none() {
        anyhow::bail!("Checkpoint {section}/{name} not found");
    }
    services.flush()?;
    eprintln!("Removed checkpoint {section}/{name}");
    Ok(())
}

async fn run_checkpoint(
    services: &Services,
    section: &str,
    name: &str,
    vars: Variables,
) -> Result<()> {
    let checkpoint = services
        .checkpoints
        .get(section, name)
        .with_context(|| format!("Checkpoint {section}/{name} not found"))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current step");
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let total = checkpoint.steps.len();
    let hooks = RunHooks::silent()
        .with_terminate(move || interrupted.load(Ordering::SeqCst))
        .with_output(|text| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        })
        .with_progress(move |index, name| eprintln!("[{name}] step {}/{total}", index + 1));

    let report = services
        .runner
        .run(&checkpoint, ExecuteEnvironment::new(vars), &hooks)
        .await;

    match &report.run.state {
        RunState::Completed => {
            eprintln!(
                "\n[Run {} completed with code {}]",
                report.run.id, report.recipe.code
            );
            Ok(())
        }
        RunState::Aborted { reason } => {
            eprintln!("\n[Run {} aborted: {}]", report.run.id, reason);
            anyhow::bail!("Checkpoint {} aborted", checkpoint.qualified_name())
        }
        RunState::Running { .. } => {
            anyhow::bail!("Run {} ended in state {:?}", report.run.id, report.run.state)
        }
    }
}

async fn serve(services: &Services) -> Result<()> {
    let bound = bind_checkpoints(
        &services.scheduler,
        &services.checkpoints,
        &services.runner,
        &services.handle,
    );
    info!(bound = bound.len(), "Trigger bindings ready");

    services.scheduler.initialize()?;
    eprintln!("Serving {} scheduled checkpoints. Press Ctrl-C to stop.", bound.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tokio::task::block_in_place(|| services.scheduler.teardown())?;
    services.flush()?;
    eprintln!("Stopped.");
    Ok(())
}

fn manage_identities(services: &Services, command: IdentityCommands) -> Result<()> {
    match command {
        IdentityCommands::List => {
            let identities = services.identities.list();
            if identities.is_empty() {
                println!("No identities found.");
                return Ok(());
            }

            println!("{:<38} {:<16} {:<16} {:<30}", "ID", "GROUP", "USERNAME", "COMMENT");
            println!("{}", "-".repeat(100));
            for identity in &identities {
                println!(
                    "{:<38} {:<16} {:<16} {:<30}",
                    identity.id, identity.group, identity.username, identity.comment
                );
            }
            Ok(())
        }
        IdentityCommands::Add {
            username,
            credential,
            group,
            comment,
        } => {
            let identity = Identity::new(username, credential)
                .in_group(&group)
                .with_comment(comment);
            let id = identity.id;
            services.identities.add(identity)?;
            services.flush()?;
            println!("{id}");
            Ok(())
        }
        IdentityCommands::Remove { id } => {
            let identity = services
                .identities
                .find_by_id(id)
                .with_context(|| format!("Identity {id} not found"))?;
            services
                .identities
                .remove(&identity.group, &identity.id.to_string());
            services.flush()?;
            eprintln!("Removed identity {id}");
            Ok(())
        }
    }
}

fn show_config() -> Result<()> {
    let config = load_config()?;
    let rendered = serde_yaml::to_string(&config).context("Failed to render configuration")?;

    println!("stepwise configuration");
    println!("{}", "-".repeat(40));
    print!("{rendered}");
    Ok(())
}
