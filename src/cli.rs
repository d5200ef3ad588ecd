//! Command-line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Protocol gateway for external platform APIs
#[derive(Parser, Debug)]
#[command(name = "platform-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PLATFORM_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "PLATFORM_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PLATFORM_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List configured platforms and their tools
    Tools {
        /// Only this platform
        #[arg(short, long)]
        platform: Option<String>,
    },

    /// Execute a tool and print the result as JSON
    Invoke {
        /// Platform name
        platform: String,

        /// Tool name
        tool: String,

        /// JSON arguments
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Print the OAuth2 authorization URL for a platform
    AuthUrl {
        /// Platform name
        platform: String,
    },

    /// Run the OAuth2 code flow interactively, then optionally a tool.
    ///
    /// Prints the authorization URL and reads the redirect URL (or the bare
    /// code) from stdin. The session lives only as long as this process.
    ExchangeCode {
        /// Platform name
        platform: String,

        /// Tool to run once the session is established
        #[arg(long)]
        tool: Option<String>,

        /// JSON arguments for `--tool`
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Verify a webhook payload file against a signature
    VerifyWebhook {
        /// Platform name
        platform: String,

        /// Event type the payload belongs to
        #[arg(short, long)]
        event: String,

        /// Signature header value
        #[arg(short, long)]
        signature: String,

        /// File holding the raw payload
        payload: PathBuf,
    },

    /// Receive webhooks for every enabled platform
    ServeWebhooks {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8787", env = "PLATFORM_GATEWAY_WEBHOOK_ADDR")]
        bind: SocketAddr,
    },

    /// Print gateway stats (state, windows, quotas) as JSON
    Stats {
        /// Only this platform
        #[arg(short, long)]
        platform: Option<String>,
    },
}
