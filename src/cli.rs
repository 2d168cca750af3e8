//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Persona Guard - resilience layer for persona tool calls
#[derive(Parser, Debug)]
#[command(name = "persona-guard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PERSONA_GUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "PERSONA_GUARD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PERSONA_GUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate configuration, then print the effective settings
    CheckConfig,

    /// Capability token commands
    #[command(subcommand)]
    Token(TokenCommand),

    /// Resolve a name against candidates with the fuzzy matcher
    Match {
        /// Name to resolve
        #[arg(required = true)]
        query: String,

        /// Candidate names
        #[arg(required = true, num_args = 1..)]
        candidates: Vec<String>,

        /// Minimum acceptable score (0-100)
        #[arg(long, default_value_t = 60.0)]
        min_score: f64,
    },
}

/// Token subcommands
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Issue a token for a principal
    Issue {
        /// Principal id
        #[arg(required = true)]
        principal: String,
    },

    /// Verify a token and print its principal
    Verify {
        /// Token to verify
        #[arg(required = true)]
        token: String,
    },
}
