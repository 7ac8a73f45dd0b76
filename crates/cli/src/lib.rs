pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "fleetrun",
    about = "Fleetrun execution engine operator CLI",
    long_about = "Operate the execution engine: migrations, timeout-policy seeding, readiness \
                  checks, and dead-letter queue disposition.",
    after_help = "Examples:\n  fleetrun doctor --json\n  fleetrun migrate\n  fleetrun dlq list"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Seed the timeout-policy matrix (idempotent; existing cells untouched)")]
    Seed,
    #[command(about = "Validate config, database connectivity, schema, and queue reachability")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect and disposition the dead-letter queue")]
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    #[command(about = "List dead-letter items, newest first")]
    List {
        #[arg(long, help = "Tenant to list for (omit for all tenants)")]
        tenant: Option<String>,
        #[arg(long, help = "Include archived items")]
        include_archived: bool,
        #[arg(long, default_value_t = 50, help = "Maximum items to show")]
        limit: u32,
    },
    #[command(about = "Put a dead-letter item back on the queue with fresh attempts")]
    Requeue {
        #[arg(help = "Dead-letter item id")]
        id: String,
    },
    #[command(about = "Archive a dead-letter item without requeueing it")]
    Archive {
        #[arg(help = "Dead-letter item id")]
        id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Dlq { command } => match command {
            DlqCommand::List { tenant, include_archived, limit } => {
                commands::dlq::run_list(tenant, include_archived, limit)
            }
            DlqCommand::Requeue { id } => commands::dlq::run_requeue(id),
            DlqCommand::Archive { id } => commands::dlq::run_archive(id),
        },
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
