use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use cli::render::render_snapshot;
use cli::tasks::load_tasks;
use minerd::Scheduler;
use minerd::config::{GlobalConfig, load_config};
use minerd::driver::SimulatedDriver;

fn setup_logging(level: Option<&str>) -> Result<PathBuf> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("minerd")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("minerd.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // RUST_LOG wins over the configured level
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(log_file)
}

async fn run_application(cli: &Cli, config: GlobalConfig) -> Result<()> {
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run { tasks, every, json } => handle_run_command(tasks, *every, *json, config).await,
        Commands::Config => handle_config_command(&config),
        Commands::Tasks { file } => handle_tasks_command(file),
    }
}

async fn handle_run_command(tasks: &Path, every: u64, json: bool, config: GlobalConfig) -> Result<()> {
    let entries = load_tasks(tasks)?;
    info!("Loaded {} tasks from {}", entries.len(), tasks.display());

    let driver = Arc::new(SimulatedDriver::new(&config.simulation));
    let scheduler = Scheduler::new(config, driver);
    for entry in &entries {
        scheduler.add_task(entry.id, &entry.address).await;
    }

    scheduler.start().await.context("Failed to start scheduler")?;
    println!(
        "{} {} tasks, press Ctrl-C to stop",
        "Scheduler started:".green(),
        entries.len()
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => print_snapshot(&scheduler, json).await?,
        }
    }

    println!("{}", "Stopping scheduler...".cyan());
    scheduler.stop().await.context("Failed to stop scheduler")?;
    print_snapshot(&scheduler, json).await
}

async fn print_snapshot(scheduler: &Scheduler<SimulatedDriver>, json: bool) -> Result<()> {
    let snapshot = scheduler.status().await;
    if json {
        println!("{}", serde_json::to_string(&snapshot).context("Failed to serialize snapshot")?);
    } else {
        println!("{}", render_snapshot(&snapshot));
    }
    Ok(())
}

fn handle_config_command(config: &GlobalConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}

fn handle_tasks_command(file: &Path) -> Result<()> {
    let entries = load_tasks(file)?;
    println!("{} {} tasks in {}", "Valid:".green(), entries.len(), file.display());
    if let (Some(first), Some(last)) = (entries.iter().map(|e| e.id).min(), entries.iter().map(|e| e.id).max()) {
        println!("  ids {}..={}", first, last);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration; its log level seeds the logger
    let config = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(config.log_level.as_deref()).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, config).await.context("Application failed")?;

    Ok(())
}
