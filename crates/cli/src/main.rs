use anyhow::Result;
use clap::{CommandFactory, Parser};
use color_eyre::config::HookBuilder;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod handlers;
mod wizard;

/// dropline - Dropbox transfers from your terminal
#[derive(Parser, Debug)]
#[command(name = "dropline")]
#[command(version)]
#[command(about = "Resilient Dropbox uploads, downloads and shared links", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/dropline/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read the access token from this file
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Initial setup (interactive wizard)
    Init,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Download a file, or a folder as a zip archive
    Download {
        /// Remote path
        remote: String,
        /// Local destination (defaults to the remote basename)
        dest: Option<PathBuf>,
        /// Download a folder as a zip archive
        #[arg(short, long)]
        folder: bool,
    },

    /// Download the file behind a shared link
    Fetch {
        /// Shared link URL
        link: String,
        /// Local destination (defaults to the link's file name)
        dest: Option<PathBuf>,
    },

    /// Upload files and directories
    Upload {
        /// Local files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Remote folder to upload into
        #[arg(short, long, default_value = "/")]
        to: String,
        /// Upload each file in its own request instead of a batch
        #[arg(long)]
        single: bool,
        /// Write mode: add, overwrite or update:<rev>
        #[arg(short, long)]
        mode: Option<String>,
        /// Let the server rename on conflict
        #[arg(long)]
        autorename: bool,
        /// Do not notify the user's devices
        #[arg(long)]
        mute: bool,
        /// Seconds between batch job checks
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Give up waiting for the batch job after this many seconds
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// Create (or reuse) a shared link for a remote path
    Share {
        /// Remote path
        path: String,
    },

    /// Show metadata of a shared link
    LinkInfo {
        /// Shared link URL
        url: String,
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Shell completion
    Completion {
        /// Shell type (bash, zsh, fish, elvish, powershell)
        shell: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the current configuration
    Show,
    /// Validate the configuration and the token
    Validate,
    /// Print the configuration file path
    Path,
}

/// RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, configured: Option<String>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug".to_string()
        } else {
            configured.unwrap_or_else(|| "info".to_string())
        };
        EnvFilter::new(format!("dropline={level},dropline_core={level}"))
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup error handling
    if let Err(e) = HookBuilder::default().install() {
        eprintln!("Warning: Failed to install error handler: {}", e);
    }

    // Parse CLI arguments
    let cli = Cli::parse();

    let ctx = handlers::Context::new(cli.config, cli.token_file);
    init_logging(cli.verbose, ctx.load_config().ok().map(|c| c.log_level()));

    // Execute command
    match cli.command {
        Commands::Init => handlers::handle_init(&ctx).await,
        Commands::Config { action } => {
            let action_str = match action {
                ConfigAction::Show => "show",
                ConfigAction::Validate => "validate",
                ConfigAction::Path => "path",
            };
            handlers::handle_config(&ctx, action_str).await
        }
        Commands::Download { remote, dest, folder } => {
            handlers::handle_download(&ctx, &remote, dest.as_deref(), folder).await
        }
        Commands::Fetch { link, dest } => {
            handlers::handle_fetch(&ctx, &link, dest.as_deref()).await
        }
        Commands::Upload {
            paths,
            to,
            single,
            mode,
            autorename,
            mute,
            poll_interval,
            deadline,
        } => {
            let args = handlers::UploadArgs {
                paths,
                to,
                single,
                mode,
                autorename,
                mute,
                poll_interval,
                deadline,
            };
            handlers::handle_upload(&ctx, args).await
        }
        Commands::Share { path } => handlers::handle_share(&ctx, &path).await,
        Commands::LinkInfo { url, output } => {
            handlers::handle_link_info(&ctx, &url, &output).await
        }
        Commands::Completion { shell } => {
            handlers::handle_completion(&shell, &mut Cli::command()).await
        }
    }
}
