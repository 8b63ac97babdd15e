use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "skep actor runtime node")]
pub struct Args {
    /// Path to the node config file (a JSON array of node objects)
    #[clap(short = 'c', long, value_name = "PATH", env = "SKEP_CONFIG")]
    pub config: Option<String>,

    /// Which node entry of the config file to run
    #[clap(short = 's', long, value_name = "SID", env = "SKEP_SID", default_value_t = 1)]
    pub sid: u16,

    /// Override the configured worker thread count
    #[clap(short = 'j', long, value_name = "N", env = "SKEP_NUM_THREADS")]
    pub thread: Option<usize>,

    /// Port of the ad-hoc echo node used when no config file is given
    #[clap(short = 'p', long, value_name = "PORT", env = "SKEP_PORT", default_value_t = 8176)]
    pub port: u16,

    /// How often (in seconds) to log operational counters
    #[clap(long, value_name = "SECONDS", env = "SKEP_STATS_INTERVAL", default_value_t = 60)]
    pub stats_interval: u64,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    /// Output more detail; specify multiple times for more
    #[clap(short = 'v', long, conflicts_with = "quiet", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
