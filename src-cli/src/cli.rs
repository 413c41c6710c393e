use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bili-flvplay")]
#[command(author, version, about = "Play segmented FLV videos over HTTP range requests")]
pub struct Cli {
    /// Path to a TOML player config
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log every fetch and append
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show which platform handles a url and the media it resolves to
    Resolve {
        #[arg(required = true)]
        url: String,
    },

    /// Build the full seek index and print it
    Probe {
        #[arg(required = true)]
        url: String,
    },

    /// Play into a simulated real-time sink and report progress
    Play {
        #[arg(required = true)]
        url: String,

        /// Seek here once playback started, in seconds
        #[arg(long)]
        seek: Option<f64>,

        /// Wall-clock seconds to play before stopping
        #[arg(long = "for", default_value_t = 30.0)]
        play_for: f64,

        /// Playback rate of the simulated clock
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}
