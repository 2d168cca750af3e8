//! Persona Guard - operator CLI for the tool-call resilience layer
//!
//! Validates configuration, issues and verifies capability tokens, and
//! exercises the fuzzy name matcher.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use persona_guard::{
    cli::{Cli, Command, TokenCommand},
    config::Config,
    failsafe::Failsafe,
    matching::{self, Resolution},
    setup_tracing,
    token::TokenSigner,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command {
        Command::CheckConfig => run_check_config(&cli).await,
        Command::Token(ref cmd) => run_token_command(&cli, cmd),
        Command::Match {
            ref query,
            ref candidates,
            min_score,
        } => {
            run_match(query, candidates, min_score);
            Ok(ExitCode::SUCCESS)
        }
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    Config::load(cli.config.as_deref()).context("Failed to load configuration")
}

/// Build every guard from configuration and print the effective settings
async fn run_check_config(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;
    TokenSigner::from_config(&config.token, config.environment).context("Invalid token configuration")?;

    let failsafe = Failsafe::from_config(&config.failsafe);
    let sweeper = failsafe.spawn_sweeper();
    sweeper.shutdown().await;

    info!(
        environment = ?config.environment,
        dependencies = config.failsafe.dependencies.len(),
        "Configuration OK"
    );

    let mut printable = config;
    if printable.token.secret.is_some() {
        printable.token.secret = Some("<redacted>".to_string());
    }
    print!("{}", serde_yaml::to_string(&printable).context("Failed to render configuration")?);
    Ok(ExitCode::SUCCESS)
}

fn run_token_command(cli: &Cli, cmd: &TokenCommand) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;
    let signer = TokenSigner::from_config(&config.token, config.environment)?;

    match cmd {
        TokenCommand::Issue { principal } => {
            let token = signer.issue(principal).context("Cannot issue token")?;
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
        TokenCommand::Verify { token } => match signer.verify(token) {
            Ok(principal) => {
                println!("{principal}");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("Token rejected: {e}");
                Ok(ExitCode::FAILURE)
            }
        },
    }
}

fn run_match(query: &str, candidates: &[String], min_score: f64) {
    match matching::resolve(query, candidates, String::as_str, min_score) {
        Resolution::Found(m) => println!("{} ({:.1})", m.candidate, m.score),
        Resolution::NotFound { query, candidates } => {
            println!("No match for '{query}' (minimum score {min_score:.1}). Candidates:");
            for m in matching::rank(&query, &candidates, |c| c.as_str()) {
                println!("  {} ({:.1})", m.candidate, m.score);
            }
        }
    }
}
