use std::path::PathBuf;

use clap::{Parser, Subcommand};
use electra_engine::StreamType;

#[derive(Parser, Debug)]
#[command(
    name = "electra",
    author,
    version,
    about = "Probe media segments and play them back through the Electra decode pipeline"
)]
pub struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, global = true, env = "ELECTRA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Identify a segment's container and list its tracks
    Probe {
        /// Segment file
        file: PathBuf,

        /// Initialization segment for fragmented MP4
        #[arg(long)]
        init: Option<PathBuf>,

        /// Also walk every sample and print per-track timing
        #[arg(long)]
        samples: bool,
    },

    /// Demultiplex segments in order and run them through a passthrough decoder
    Play {
        /// Segment files, in playback order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Initialization segment shared by every file
        #[arg(long)]
        init: Option<PathBuf>,

        /// Primary stream type (video, audio, subtitle)
        #[arg(short = 't', long, visible_alias = "stream", default_value = "video")]
        stream_type: StreamType,

        /// Also decode the audio of muxed segments
        #[arg(long)]
        with_audio: bool,

        /// Nominal segment duration used for the request timeline
        #[arg(short = 'd', long, default_value_t = 6_000)]
        segment_duration_ms: u64,

        /// Files that cannot be read are covered with filler instead of failing
        #[arg(long)]
        allow_missing: bool,
    },
}
