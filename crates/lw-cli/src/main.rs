//! LeakWatch CLI
//!
//! CLI tool for replaying recorded browser event traces through the session
//! monitor and for inspecting URL classification and SURT keys.

mod replay;
mod rules;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use lw_core::{classify, to_surt_exact, to_surt_prefix, BoundaryPrefixes};
use lw_monitor::config::DEFAULT_BOUNDARY_PREFIX;

use crate::replay::ReplayOptions;

#[derive(Parser)]
#[command(name = "lw-cli")]
#[command(about = "LeakWatch archival replay leak monitor tools")]
struct Cli {
    /// Log at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a URL against the replay boundary
    Classify {
        /// URL to classify
        #[arg(short, long)]
        url: String,

        /// Boundary prefixes (defaults to the Archive-It replay prefix)
        #[arg(short, long)]
        prefix: Vec<String>,
    },

    /// Print the SURT key of a URL
    Surt {
        /// URL to canonicalize
        #[arg(short, long)]
        url: String,

        /// Emit the host wildcard form (`...)/%`) instead of the exact form
        #[arg(long)]
        prefix_form: bool,

        /// Boundary prefixes used to unwrap replay URLs
        #[arg(short, long)]
        prefix: Vec<String>,
    },

    /// Feed a JSON-lines event trace through the monitor
    Replay {
        /// Trace file, one event per line
        #[arg(short, long)]
        input: PathBuf,

        /// Monitor config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// State file to rehydrate from and mirror into
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Skip policy lookups
        #[arg(long)]
        offline: bool,

        /// Print sessions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query the policy service for the rules matching a page
    Rules {
        /// Page URL (replay URLs are unwrapped)
        #[arg(short, long)]
        url: String,

        /// Monitor config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let result = match cli.command {
        Commands::Classify { url, prefix } => cmd_classify(&url, prefix),
        Commands::Surt {
            url,
            prefix_form,
            prefix,
        } => cmd_surt(&url, prefix_form, prefix),
        Commands::Replay {
            input,
            config,
            state,
            offline,
            json,
        } => replay::run_replay(ReplayOptions {
            input,
            config,
            state,
            offline,
            json,
            verbose: cli.verbose,
        }),
        Commands::Rules { url, config } => rules::run_rules(&url, config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn prefixes_or_default(prefixes: Vec<String>) -> BoundaryPrefixes {
    if prefixes.is_empty() {
        BoundaryPrefixes::new([DEFAULT_BOUNDARY_PREFIX])
    } else {
        BoundaryPrefixes::new(prefixes)
    }
}

fn cmd_classify(url: &str, prefixes: Vec<String>) -> Result<(), String> {
    let prefixes = prefixes_or_default(prefixes);
    println!("{}", classify(url, &prefixes).as_str());
    Ok(())
}

fn cmd_surt(url: &str, prefix_form: bool, prefixes: Vec<String>) -> Result<(), String> {
    let prefixes = prefixes_or_default(prefixes);
    let key = if prefix_form {
        to_surt_prefix(url, &prefixes)
    } else {
        to_surt_exact(url, &prefixes)
    };
    let key = key.map_err(|e| e.to_string())?;
    println!("{}", key);
    Ok(())
}
