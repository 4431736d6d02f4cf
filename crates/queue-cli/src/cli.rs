use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "queue-cli", version)]
pub struct Args {
    /// Optional so `--list-devices` works without a subcommand.
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Stream sample rate in Hz
    #[arg(long, default_value_t = 48_000)]
    pub sample_rate: u32,

    /// Channel count of the generated stream
    #[arg(long, default_value_t = 2)]
    pub channels: u16,

    /// Sample depth in bits (8 or 16)
    #[arg(long, default_value_t = 16)]
    pub bits: u16,

    /// Hardware buffer duration in milliseconds
    #[arg(long, default_value_t = 250)]
    pub buffer_ms: u64,

    /// Player volume, 0.0 to 1.0
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a single sine tone
    Tone {
        /// Frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        freq: f32,

        /// Playback length in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
    },

    /// Play a three-note chord on concurrent players
    Chord {
        /// Root frequency in Hz; the third and fifth are derived from it
        #[arg(long, default_value_t = 261.63)]
        root: f32,

        /// Playback length in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
    },
}
