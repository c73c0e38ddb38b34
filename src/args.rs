use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
pub struct Args {
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    /// Path to the broker configuration, or `-` to read it from stdin.
    #[clap(short, long, default_value = "mqttd.toml")]
    pub config: PathBuf,
}

#[derive(clap::ValueEnum, Debug, Copy, Clone)]
pub enum LogFormat {
    Full,
    Compact,
    Pretty,
    Json,
}
