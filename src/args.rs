use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "gamedub", version, about = "Narrate scripts over gameplay footage")]
pub struct Args {
    /// JSON config file (defaults to ./config/dub.json when present)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Produce a dubbed video from a script
    Dub(DubArgs),
    /// Add a clip to the background library
    Add(AddArgs),
    /// List library clips
    Videos(VideosArgs),
    /// List the voices the configured engine offers
    Voices,
}

#[derive(ClapArgs, Debug)]
pub struct DubArgs {
    /// Script text; split into segments at sentence boundaries
    #[clap(long, conflicts_with = "script_file", required_unless_present = "script_file")]
    pub text: Option<String>,

    /// File with one segment per non-empty line
    #[clap(long)]
    pub script_file: Option<PathBuf>,

    #[clap(long, default_value = "default", conflicts_with = "voice_sample")]
    pub voice: String,

    /// Reference recording to clone the narration voice from
    #[clap(long)]
    pub voice_sample: Option<PathBuf>,

    /// Comma separated background tags; any match qualifies
    #[clap(long, default_value = "")]
    pub tags: String,

    /// Minimum background length in seconds
    #[clap(long, default_value_t = 0.0)]
    pub min_duration: f64,

    #[clap(long)]
    pub out_dir: Option<PathBuf>,

    #[clap(long)]
    pub chunk_chars: Option<usize>,

    #[clap(long)]
    pub speed: Option<f64>,

    /// Fail instead of repeating footage that is shorter than the speech
    #[clap(long)]
    pub no_loop: bool,

    /// Always encode a fresh artifact
    #[clap(long)]
    pub no_reuse: bool,

    #[clap(long)]
    pub no_subtitles: bool,

    /// Print the job report as JSON
    #[clap(long)]
    pub json: bool,
}

#[derive(ClapArgs, Debug)]
pub struct AddArgs {
    pub video: PathBuf,

    #[clap(long, default_value = "")]
    pub tags: String,

    /// Public base URL the preview will be served from
    #[clap(long)]
    pub url: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct VideosArgs {
    #[clap(long, default_value = "")]
    pub tags: String,

    #[clap(long, default_value_t = 1)]
    pub page: usize,

    #[clap(long, default_value_t = 12)]
    pub page_size: usize,

    #[clap(long)]
    pub json: bool,
}
