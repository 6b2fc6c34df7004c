use std::path::Path;

use super::load_config;

pub fn run(config_path: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!(
        config = %config_path.display(),
        host = %config.server.host,
        port = config.server.port,
        "starting hopper"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(hopper_server::serve(config, config_path))
}
