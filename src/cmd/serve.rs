//! `vds serve` and `vds init-db`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use vds::config::VdsConfig;
use vds::server::{ServerConfig, start_server};

use super::{open_store, project_path};

pub async fn cmd_serve(
    project_dir: &Path,
    mut config: VdsConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
    no_resume: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    if dev {
        config.server.dev_mode = true;
    }
    if no_resume {
        config.server.resume_on_startup = false;
    }
    config.server.db_path = project_path(project_dir, &config.server.db_path);
    if let Some(dir) = config.audit.export_dir.take() {
        config.audit.export_dir = Some(project_path(project_dir, &dir));
    }

    start_server(ServerConfig::from_config(&config), &config).await
}

pub fn cmd_init_db(project_dir: &Path, config: &VdsConfig) -> Result<()> {
    open_store(project_dir, config)?;
    println!(
        "Session database ready at {}",
        project_path(project_dir, &config.server.db_path).display()
    );
    Ok(())
}
