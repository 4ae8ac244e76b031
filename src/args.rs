use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Camera index (overrides the config file)
    #[arg(short, long)]
    pub cam_index: Option<u32>,

    /// List available cameras
    #[arg(long)]
    pub list: bool,

    /// Use the synthetic frame source instead of a camera
    #[arg(long)]
    pub synthetic: bool,

    /// Run detection on the main loop instead of the background worker
    #[arg(long)]
    pub single_thread: bool,

    /// Configuration file path
    #[arg(long, default_value = "config.json")]
    pub config: String,
}
