//! Entry point: parse arguments, initialize logging, dispatch the command,
//! and report errors consistently.

use clap::Parser;

mod azure;
mod cli;
mod commands;
mod engine;
mod environments;
mod errors;
mod logging;
mod markdown;
mod outputs;
mod prereq;
mod scenario;
mod shell;
mod state;
mod ui;
mod validation;

fn main() {
    let args = cli::RootArgs::parse();
    logging::init(args.global.log_level, &args.global.log_path);

    // Captured before any command can change directories, so documents are
    // resolved relative to where the user ran the CLI.
    let invocation_directory = std::env::current_dir().ok();

    let result = match &args.command {
        cli::Command::Execute(execution) => {
            commands::execute(execution, &args.global, invocation_directory.as_deref())
        }
        cli::Command::Test(test) => commands::test(test, &args.global),
        cli::Command::Interactive(execution) => {
            commands::interactive(execution, &args.global, invocation_directory.as_deref())
        }
        cli::Command::Inspect(execution) => commands::inspect(execution, &args.global),
        cli::Command::ToBash(to_bash) => commands::to_bash(to_bash, &args.global),
        cli::Command::EnvConfig(env_config) => commands::env_config(env_config),
        cli::Command::ClearEnv(clear_env) => commands::clear_env(clear_env),
    };

    if let Err(err) = result {
        log::error!("{err:#}");
        eprintln!("Error: {err}");
        for cause in err.chain().skip(1) {
            for line in cause.to_string().lines() {
                let line = line.trim();
                if !line.is_empty() {
                    eprintln!("  {line}");
                }
            }
        }
        std::process::exit(1);
    }
}
