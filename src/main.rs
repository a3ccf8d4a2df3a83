//! Stackup: starts a local development stack.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the configuration and hands the requested services to the
//! orchestrator.

use std::path::PathBuf;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser};

use stackup::config::{Config, DEFAULT_CONFIG_FILE};
use stackup::output::format_tool_message;
use stackup::{load_config, logging, Orchestrator};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "stackup",
    version,
    about = "Start services and their dependencies in order",
    styles = help_styles()
)]
struct Cli {
    /// Path to the stackup.toml configuration file.
    #[arg(short, long, env = "STACKUP_FILE", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Exit successfully once all given services have finished.
    #[arg(short, long)]
    wait: bool,
    /// Print internal diagnostics to stderr.
    #[arg(long, env = "STACKUP_DEBUG")]
    debug: bool,
    /// Services to start; dependencies are started automatically.
    services: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug || legacy_debug());

    if let Err(err) = run(cli).await {
        // Run errors already name their cause; config errors need the chain.
        let message = match err.downcast_ref::<stackup::Error>() {
            Some(err) => err.to_string(),
            None => format!("{:#}", err),
        };
        eprintln!("{}", format_tool_message(&format!("error: {}", message)));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    if cli.services.is_empty() {
        let usage = Cli::command().render_usage();
        eprintln!("{}\n\n{}", usage, service_listing(&config));
        std::process::exit(1);
    }

    let orchestrator = Orchestrator::new(&config, &cli.services)?;
    if cli.wait {
        orchestrator.run_bounded(&cli.services).await?;
    } else {
        orchestrator.run().await?;
    }
    Ok(())
}

// `DEBUG` is still honored for older setups.
fn legacy_debug() -> bool {
    std::env::var_os("DEBUG").is_some_and(|value| !value.is_empty())
}

fn service_listing(config: &Config) -> String {
    if config.services.is_empty() {
        return "No services defined.".to_string();
    }
    let mut listing = String::from("Services:");
    for name in config.services.keys() {
        listing.push_str("\n  ");
        listing.push_str(name);
    }
    listing
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
