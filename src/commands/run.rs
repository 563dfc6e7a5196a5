//! Run a composition until it is shut down

use std::path::Path;

use composed::config::CompositeConfig;
use composed::manager::Orchestrator;

use super::init_logging;

/// Returns the exit code for the process
pub async fn run(path: &Path, log_level: Option<&str>) -> Result<i32, Box<dyn std::error::Error>> {
    let config = CompositeConfig::load(path).await?;
    init_logging(log_level.or(config.log_level.as_deref()));
    log::debug!("Config: {:#?}", config);

    let (graph, options) = config.into_graph()?;
    let orchestrator = Orchestrator::new(graph, options);
    Ok(orchestrator.run().await?)
}
