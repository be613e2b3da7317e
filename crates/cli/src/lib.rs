pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa operator CLI",
    long_about = "Apply migrations, inspect configuration, evaluate approval workflows and validate receipt extraction replies.",
    after_help = "Examples:\n  expensa migrate\n  expensa evaluate --rule rule.json --log decisions.json\n  expensa parse-receipt --payload reply.json"
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
    #[command(about = "Evaluate a decision log against an approval rule without touching storage")]
    Evaluate {
        #[arg(long, help = "Rule document (JSON, or TOML when the extension is .toml)")]
        rule: PathBuf,
        #[arg(long, help = "Decision log document (JSON, or TOML when the extension is .toml)")]
        log: PathBuf,
    },
    #[command(about = "Validate a receipt extraction reply into expense drafts")]
    ParseReceipt {
        #[arg(long, help = "File holding the extraction model's raw reply")]
        payload: PathBuf,
        #[arg(long, default_value = "USD", help = "Currency for items that do not name one")]
        currency: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    logging::init_from_env();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Evaluate { rule, log } => commands::evaluate::run(&rule, &log),
        Command::ParseReceipt { payload, currency } => {
            commands::parse_receipt::run(&payload, &currency)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
