#[macro_use]
extern crate lazy_static;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use resources::config::ClusterConfig;

mod general;
mod metrics;
mod replica_calculator;
mod scalercore;
mod utils;
mod validation;

lazy_static! {
    pub static ref CONFIG: ClusterConfig = Config::builder()
        .add_source(File::with_name("/etc/rgpa/gpa-controller.yaml").required(false))
        .add_source(Environment::default())
        .build()
        .unwrap_or_default()
        .try_deserialize::<ClusterConfig>()
        .with_context(|| "Failed to parse config".to_string())
        .unwrap_or_default();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut controller = general::GeneralController::new();
    controller.run().await?;
    Ok(())
}
