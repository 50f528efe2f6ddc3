//! Backup Orchestration Service
//!
//! Provides CLI interface for running the backup scheduler, triggering
//! on-demand backups, retention cleanup, and email configuration checks.

// backuptool/src/main.rs
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use backuptool::config::Config;
use backuptool::service::BackupService;

/// Main entry point for the backup service
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    let service = Arc::new(BackupService::new(config));

    match choice.as_str() {
        "1" | "serve" => {
            println!("🚀 Starting backup scheduler...");
            let scheduler = service.scheduler();
            scheduler.start().context("Failed to start scheduler")?;
            println!("✅ Cron jobs started successfully");
            for job in service.status() {
                println!(
                    "   - {}: {}",
                    job.name,
                    if job.running { "running" } else { "stopped" }
                );
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for shutdown signal")?;
            println!("\n🛑 Shutting down scheduler...");
            scheduler.stop();
        }
        "2" | "backup" => {
            println!("🚀 Starting manual backup...");
            let outcome = service
                .trigger_backup()
                .await
                .context("Backup process failed")?;
            println!("📦 Archive: {}", outcome.backup.zip_path.display());
            match outcome.email {
                Some(email) if email.delivered => {
                    println!("📧 Notification sent to {}", email.recipient.unwrap_or_default());
                }
                Some(email) => println!("⚠️ Notification skipped: {}", email.message),
                None => {}
            }
        }
        "3" | "clean" => {
            println!("🧹 Cleaning old backup files...");
            let removed = service
                .run_cleanup()
                .await
                .context("Backup cleanup failed")?;
            println!("🧹 Removed {} expired backup file(s)", removed);
        }
        "4" | "test-email" => {
            println!("📧 Sending test email...");
            let outcome = service.test_email().await.context("Test email failed")?;
            println!("📧 {}", outcome.message);
        }
        _ => {
            println!(
                "❌ Invalid choice. Please enter '1' (serve), '2' (backup), '3' (clean), or '4' (test-email)."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Run Scheduler (or type 'serve')");
    println!("2. Trigger Backup Now (or type 'backup')");
    println!("3. Clean Old Backups (or type 'clean')");
    println!("4. Send Test Email (or type 'test-email')");
    print!("Enter your choice: ");
    let _ = stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
