mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, inbox::InboxSubcommand, registration::RegistrationSubcommand,
    user::UserSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hopper",
    about = "Buffer files per topic and hand them to containers in batches",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, env = "HOPPER_CONFIG", default_value = "hopper.yaml")]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, orchestrator and container agent
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Add files to a topic or inspect what is buffered
    Inbox {
        #[command(subcommand)]
        subcommand: InboxSubcommand,
    },

    /// Manage topic registrations
    Registration {
        #[command(subcommand)]
        subcommand: RegistrationSubcommand,
    },

    /// Manage API users
    User {
        #[command(subcommand)]
        subcommand: UserSubcommand,
    },

    /// Create or check the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve { port } => cmd::serve::run(&cli.config, port),
        Commands::Inbox { subcommand } => cmd::inbox::run(&cli.config, subcommand, cli.json),
        Commands::Registration { subcommand } => {
            cmd::registration::run(&cli.config, subcommand, cli.json)
        }
        Commands::User { subcommand } => cmd::user::run(&cli.config, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
