use crate::environments::Environment;
use crate::logging;
use crate::state;
use clap::{ArgAction, Args, Parser, Subcommand};

/// CLI arguments for the executable documentation engine.
#[derive(Parser, Debug)]
#[command(
    name = "ie",
    version,
    about = "The executable documentation engine: run, test, and lint markdown tutorials.",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Set file logging level. Controls entries written to ie.log; --verbose
    /// enriches the interactive console separately
    #[arg(long, global = true, value_enum, default_value = "debug")]
    pub log_level: logging::Level,

    /// Path of the rotating log file
    #[arg(
        long,
        global = true,
        env = "IE_LOG_PATH",
        default_value = logging::DEFAULT_LOG_FILE
    )]
    pub log_path: String,

    /// The environment that the CLI is running in. For a standard terminal,
    /// local works fine; inside a github action, use github-action
    #[arg(long, global = true, value_enum, default_value = "local")]
    pub environment: Environment,

    /// Enables the specified feature. Format: --feature <feature>
    #[arg(long = "feature", global = true, value_name = "NAME")]
    pub features: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute the commands in an executable document
    Execute(ExecutionArgs),
    /// Test document commands against their expected outputs
    Test(TestArgs),
    /// Execute a document in interactive mode
    Interactive(ExecutionArgs),
    /// Lint an executable document without running code blocks
    #[command(
        long_about = "inspect performs structural linting against a document before you run it. \
It validates language tags, prerequisite expected_results blocks (with exceptions for \
export-only code), environment variable prefixes, and usage (unused exports become warnings, \
undefined uppercase variables become errors). It never executes the fenced code blocks - use \
inspect as a safe preflight step before interactive, execute, or test modes."
    )]
    Inspect(ExecutionArgs),
    /// Convert a markdown scenario into a bash script
    ToBash(ToBashArgs),
    /// Print stored environment variables as source-able exports
    #[command(
        long_about = "Reads the persisted environment state file (default /tmp/ie-env-vars) and \
renders its contents as export statements. Capture the output and source it later to \
reproduce the environment from a previous run.\n\nExamples:\n  \
ie env-config                            # Dump all persisted variables\n  \
ie env-config --prefix EV_               # Limit output to EV_ prefixed vars\n  \
ie env-config --state-file /tmp/custom   # Use a custom state file"
    )]
    EnvConfig(EnvConfigArgs),
    /// Clear the stored environment variables and optionally working
    /// directory state
    #[command(
        long_about = "Removes the environment state file that stores variables between command \
executions. By default only environment variables are cleared; the flags also clear working \
directory state.\n\nExamples:\n  \
ie clear-env                    # Clear only environment variables\n  \
ie clear-env --working-dir      # Clear env vars and working directory\n  \
ie clear-env --all              # Clear both env vars and working directory\n  \
ie clear-env --force            # Clear without confirmation"
    )]
    ClearEnv(ClearEnvArgs),
}

#[derive(Args, Debug)]
pub struct ExecutionArgs {
    /// Path or URL of the markdown document
    #[arg(value_name = "MARKDOWN_FILE")]
    pub markdown_file: String,

    /// Show extra console context (working dirs, full command output). For
    /// deeper persisted diagnostics use --log-level
    #[arg(long)]
    pub verbose: bool,

    /// Do not delete the Azure resources created by the executed commands
    #[arg(long)]
    pub do_not_delete: bool,

    /// Stream command output in real-time as it is generated (default). Use
    /// --stream-output=false to show a spinner and display output after
    /// completion
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub stream_output: bool,

    /// Subscription ID used by the scenario's azure-cli commands. Relies on
    /// the default subscription if not set
    #[arg(long, default_value = "")]
    pub subscription: String,

    /// Correlation ID added to the user agent of azure-cli commands
    #[arg(long, default_value = "")]
    pub correlation_id: String,

    /// Working directory for the engine to operate out of. The current
    /// working directory is restored when finished
    #[arg(long, default_value = ".")]
    pub working_directory: String,

    /// Set an environment variable for the scenario. Format: --var <key>=<value>
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TestArgs {
    #[command(flatten)]
    pub execution: ExecutionArgs,

    /// Path for a JSON report of the scenario execution. Only generated when
    /// this flag is set
    #[arg(long, value_name = "PATH")]
    pub report: Option<String>,
}

#[derive(Args, Debug)]
pub struct ToBashArgs {
    /// Path or URL of the markdown document
    #[arg(value_name = "MARKDOWN_FILE")]
    pub markdown_file: String,

    /// Set an environment variable for the scenario. Format: --var <key>=<value>
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

#[derive(Args, Debug)]
pub struct EnvConfigArgs {
    /// Path to the environment state file to read
    #[arg(long, default_value = state::DEFAULT_ENV_STATE_FILE)]
    pub state_file: String,

    /// Only emit variables that begin with the supplied prefix
    #[arg(long, default_value = "")]
    pub prefix: String,
}

#[derive(Args, Debug)]
pub struct ClearEnvArgs {
    /// Clear both environment variables and working directory state
    #[arg(long)]
    pub all: bool,

    /// Also clear the working directory state
    #[arg(long)]
    pub working_dir: bool,

    /// Force clear without confirmation prompt
    #[arg(long)]
    pub force: bool,
}
