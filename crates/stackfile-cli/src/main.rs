//! Stackfile CLI - Declarative release orchestration over helm

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;
mod error;
mod exit_codes;
mod helmexec;

use error::Result;

#[derive(Parser)]
#[command(name = "stackfile")]
#[command(author = "Stackfile Contributors")]
#[command(version)]
#[command(about = "Declaratively deploy sets of helm releases", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// State file to load
    #[arg(short = 'f', long = "file", global = true, default_value = "stackfile.yaml")]
    pub file: PathBuf,

    /// Environment to bind the state to
    #[arg(
        short = 'e',
        long,
        global = true,
        env = "STACKFILE_ENVIRONMENT",
        default_value = "default"
    )]
    pub environment: String,

    /// Only act on releases matching this label selector (k=v,k!=v); repeatable
    #[arg(short = 'l', long = "selector", global = true)]
    pub selectors: Vec<String>,

    /// Override the namespace of every release
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Override the kube context of every release
    #[arg(long, global = true)]
    pub kube_context: Option<String>,

    /// Override the chart of every release
    #[arg(long, global = true)]
    pub chart: Option<String>,

    /// Maximum number of concurrent helm processes, 0 for unbounded
    #[arg(long, global = true, default_value_t = 0)]
    pub concurrency: usize,

    /// Set state values on the command line (key=value)
    #[arg(long = "state-values-set", global = true)]
    pub state_values_set: Vec<String>,

    /// State values file(s) merged over the environment values
    #[arg(long = "state-values-file", global = true)]
    pub state_values_file: Vec<PathBuf>,

    /// Path to the helm binary
    #[arg(long, global = true, env = "STACKFILE_HELM_BINARY")]
    pub helm_binary: Option<String>,

    /// Also select every release the selected releases need
    #[arg(long, global = true)]
    pub include_transitive_needs: bool,

    /// Do not build chart dependencies
    #[arg(long, global = true)]
    pub skip_deps: bool,

    /// Reject unknown fields in state files
    #[arg(long, global = true)]
    pub strict: bool,

    /// Accept environments the state file does not declare
    #[arg(long, global = true)]
    pub allow_undefined_environment: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the loaded state after environment and template resolution
    Build,

    /// List the selected releases
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Install, upgrade or delete releases to match the state
    Sync,

    /// Show what a sync would change
    Diff {
        /// Exit with code 2 when there are changes
        #[arg(long)]
        detailed_exitcode: bool,
    },

    /// Render the manifests of every selected release
    Template,

    /// Lint the chart of every selected release
    Lint,

    /// Show the status of every selected release
    Status,

    /// Run the tests of every selected release
    Test {
        /// Delete test pods after the run (helm 2)
        #[arg(long)]
        cleanup: bool,
    },

    /// Delete every selected release, dependents first
    Destroy,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let global = &cli.global;
    match cli.command {
        Commands::Build => commands::build::run(global).await,
        Commands::List { json } => commands::list::run(global, json).await,
        Commands::Sync => commands::sync::run(global).await,
        Commands::Diff { detailed_exitcode } => commands::diff::run(global, detailed_exitcode).await,
        Commands::Template => commands::template::run(global).await,
        Commands::Lint => commands::lint::run(global).await,
        Commands::Status => commands::status::run(global).await,
        Commands::Test { cleanup } => commands::test::run(global, cleanup).await,
        Commands::Destroy => commands::destroy::run(global).await,
    }
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.global.debug);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
