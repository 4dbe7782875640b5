use clap::Parser;
use tracing_subscriber::EnvFilter;

use vessel::config::Configuration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Opt {
    /// Additional configuration files, applied in order over the defaults
    #[clap(short, long, value_parser)]
    pub config: Vec<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = Opt::parse();

    let config = Configuration::config(Configuration::figment(options.config))?;

    vessel::launch(config).await
}
