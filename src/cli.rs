use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "skyrelay", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the real-time relay
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Bind port, 1024-49151 (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Order/drone store endpoint (overrides config)
        #[arg(long, value_name = "URL")]
        store_endpoint: Option<String>,

        /// Verbose logging for the relay crates
        #[arg(long)]
        dev: bool,
    },

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
