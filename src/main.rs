mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use chrono::TimeDelta;
use clap::Parser;
use pk_auth::{
    AccountLabel, CredentialStore, DeviceCodeNotice, FileCredentialStore, RefreshCoordinator,
    TokenState,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::HostConfig;

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => HostConfig::default_path()?,
    };
    let config = HostConfig::load(&config_path).await?;

    let credentials_dir = config.credentials_dir()?;
    let store = FileCredentialStore::new(&credentials_dir)
        .await
        .with_context(|| format!("Failed to open credentials directory {}", credentials_dir.display()))?;
    let coordinator = RefreshCoordinator::new(&config.auth_config(), Arc::new(store))
        .context("Failed to set up the credential engine")?;

    match cli.command {
        Commands::Check { label } => check(&coordinator, &AccountLabel::new(label)).await,
        Commands::Refresh { label } => refresh(&coordinator, &AccountLabel::new(label)).await,
        Commands::New { label } => new_account(&coordinator, &AccountLabel::new(label)).await,
        Commands::List => list(&coordinator).await,
    }
}

async fn check(coordinator: &RefreshCoordinator, label: &AccountLabel) -> anyhow::Result<()> {
    let status = coordinator
        .check(label)
        .await
        .with_context(|| format!("Failed to check account '{label}'"))?;

    println!(
        "{}: logged in as {} ({})",
        status.label, status.identity.display_name, status.identity.unique_id
    );
    println!("  primary token: {}", describe(status.primary));
    println!("  game token:    {}", describe(status.game));
    if !status.is_fully_valid() {
        println!("Run `pearlkeeper refresh {}` to renew it.", status.label);
    }
    Ok(())
}

async fn refresh(coordinator: &RefreshCoordinator, label: &AccountLabel) -> anyhow::Result<()> {
    let outcome = coordinator
        .ensure_valid_for(label)
        .await
        .with_context(|| format!("Failed to refresh account '{label}'"))?;

    if outcome.changed() {
        println!(
            "{}: refreshed, logged in as {} until {}",
            label,
            outcome.record.identity.display_name,
            outcome.record.game.expires_at.to_rfc3339()
        );
    } else {
        println!("{label}: already valid, nothing to refresh");
    }
    Ok(())
}

async fn new_account(coordinator: &RefreshCoordinator, label: &AccountLabel) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let record = coordinator
        .authenticate_new(label, print_notice, &cancel)
        .await
        .with_context(|| format!("Failed to sign in account '{label}'"))?;

    info!("Stored new credentials for {}", label);
    println!(
        "{}: logged in as {} ({})",
        label, record.identity.display_name, record.identity.unique_id
    );
    Ok(())
}

fn print_notice(notice: DeviceCodeNotice) {
    match notice.message {
        Some(message) => println!("{message}"),
        None => println!(
            "To sign in, open {} and enter the code {}",
            notice.verification_uri, notice.user_code
        ),
    }
    println!(
        "The code expires in {} minutes. Press Ctrl-C to give up.",
        notice.expires_in_secs.div_ceil(60)
    );
}

async fn list(coordinator: &RefreshCoordinator) -> anyhow::Result<()> {
    let labels = coordinator
        .store()
        .list_labels()
        .await
        .context("Failed to list stored accounts")?;

    if labels.is_empty() {
        println!("No stored accounts. Use `pearlkeeper new <label>` to add one.");
    }
    for label in labels {
        match coordinator.check(&label).await {
            Ok(status) => println!(
                "{}\t{}\t{}",
                label,
                status.identity.display_name,
                if status.is_fully_valid() { "valid" } else { "needs refresh" }
            ),
            Err(e) => println!("{label}\t-\t{e}"),
        }
    }
    Ok(())
}

fn describe(state: TokenState) -> String {
    match state {
        TokenState::Valid { remaining } => format!("valid for {}", format_span(remaining)),
        TokenState::Expired { expired_at } => format!("expired at {}", expired_at.to_rfc3339()),
    }
}

fn format_span(span: TimeDelta) -> String {
    let hours = span.num_hours();
    let minutes = span.num_minutes() % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {}s", span.num_seconds() % 60)
    }
}
