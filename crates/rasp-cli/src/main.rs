use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use rasp_core::types::CheckType;

mod commands;
mod logging;

#[derive(Parser, Debug)]
#[command(
    name = "rasp",
    version,
    about = "Runtime self-protection policy engine"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config and policy
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    Config {
        #[arg(long)]
        print: bool,
    },
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },
    /// Decide a single call and print the decision
    Check {
        #[arg(long = "type")]
        check_type: CheckType,
        #[arg(long)]
        policy: Option<PathBuf>,
        args: Vec<String>,
    },
    /// Run recorded calls through the engine and summarize
    Replay {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Validate a policy file
    Check { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    match cli.command {
        Commands::Init { path, force } => commands::init::execute(path, force),
        Commands::Config { print } => {
            if print {
                commands::config::print_effective(cli.config)
            } else {
                Ok(())
            }
        }
        Commands::Policy { action } => match action {
            PolicyCommand::Check { file } => commands::policy::check(&file),
        },
        Commands::Check {
            check_type,
            policy,
            args,
        } => commands::check::execute(commands::check::CheckInputs {
            config_path: cli.config,
            policy,
            check_type,
            args,
        }),
        Commands::Replay {
            input,
            policy,
            json,
        } => commands::replay::execute(cli.config, policy, &input, json),
    }
}
