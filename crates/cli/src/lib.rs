pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "threadline",
    about = "Threadline operator CLI",
    long_about = "Operate Threadline migrations, readiness checks, config inspection, and one-shot feed syncs.",
    after_help = "Examples:\n  threadline doctor --json\n  threadline config\n  threadline sync --account acct-123 --sync-type manual"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, provider token readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one synchronization pass against the provider feed and wait for it")]
    Sync {
        #[arg(long, help = "External account id to sync")]
        account: String,
        #[arg(long, default_value = "incremental", help = "initial | incremental | manual")]
        sync_type: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Sync { account, sync_type } => commands::sync::run(&account, &sync_type),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
