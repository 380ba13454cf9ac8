use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_ATTEMPTS: u32 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    about = "Verify a person against their approved photo and keep monitoring the camera",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Verify a subject at the camera, then monitor the session
    Monitor(MonitorArgs),
    /// Compare a probe image against a reference photo once
    Compare(CompareArgs),
}

#[derive(Debug, Clone, Args)]
pub struct MonitorArgs {
    /// Subject id whose approved reference photo is used
    #[arg(long)]
    pub subject: String,

    /// Video device path (e.g. /dev/video2) or index (e.g. 0)
    #[arg(long)]
    pub device: Option<String>,

    /// Requested pixel format FourCC (e.g. YUYV, GREY)
    #[arg(long)]
    pub pixel_format: Option<String>,

    /// Number of warm-up frames to discard before each sample
    #[arg(long)]
    pub warmup_frames: Option<u32>,

    /// Directory holding approved reference photos (falls back to $VIGIL_REFERENCE_DIR)
    #[arg(long)]
    pub reference_dir: Option<PathBuf>,

    /// Optional path to the dlib landmark predictor model (falls back to $DLIB_LANDMARK_MODEL)
    #[arg(long)]
    pub landmark_model: Option<PathBuf>,

    /// Optional path to the dlib face recognition network (falls back to $DLIB_ENCODER_MODEL)
    #[arg(long)]
    pub encoder_model: Option<PathBuf>,

    /// Maximum distance that still counts as the same person
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Verification attempts before giving up
    #[arg(long, default_value_t = DEFAULT_ATTEMPTS)]
    pub attempts: u32,

    /// Stop monitoring after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long)]
    pub duration: Option<u64>,

    /// Append per-detection audit records to this JSON Lines file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CompareArgs {
    /// Reference photo containing exactly one face
    #[arg(long)]
    pub reference: PathBuf,

    /// Probe image containing exactly one face
    #[arg(long)]
    pub probe: PathBuf,

    /// Optional path to the dlib landmark predictor model (falls back to $DLIB_LANDMARK_MODEL)
    #[arg(long)]
    pub landmark_model: Option<PathBuf>,

    /// Optional path to the dlib face recognition network (falls back to $DLIB_ENCODER_MODEL)
    #[arg(long)]
    pub encoder_model: Option<PathBuf>,

    /// Maximum distance that still counts as the same person
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Number of image jitters to run before encoding
    #[arg(long)]
    pub jitters: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl From<bool> for OutputMode {
    fn from(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from(self.json)
    }
}
