use clap::Parser;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "storfand",
    version,
    about = "Chassis fan control driven by hard-drive temperatures"
)]
pub struct Opt {
    /// Path to the configuration file
    #[clap(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<String>,

    /// Log debug output (per-drive reads, raw ipmitool commands)
    #[clap(long)]
    pub debug: bool,
}

impl Opt {
    pub fn log_level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}
