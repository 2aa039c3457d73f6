//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                         |
//! |------------|------------------------------------------|
//! | `serve`    | `Serve`, `InitDb`                        |
//! | `run`      | `Run`                                    |
//! | `session`  | `Approve`, `Status`, `Messages`, `Audit` |
//! | `workflow` | `Workflow`                               |
//! | `config`   | `Config`                                 |

pub mod config;
pub mod run;
pub mod serve;
pub mod session;
pub mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use vds::capability::CapabilityRegistry;
use vds::config::VdsConfig;
use vds::store::DbHandle;
use vds::supervisor::{Orchestrator, SupervisorSettings};

pub use config::cmd_config;
pub use run::cmd_run;
pub use serve::{cmd_init_db, cmd_serve};
pub use session::{cmd_approve, cmd_audit, cmd_messages, cmd_status};
pub use workflow::cmd_workflow_run;

/// Relative paths in config are taken from the project dir.
pub(crate) fn project_path(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

pub(crate) fn open_store(project_dir: &Path, config: &VdsConfig) -> Result<DbHandle> {
    let path = project_path(project_dir, &config.server.db_path);
    DbHandle::open(&path).with_context(|| format!("Failed to open session database {}", path.display()))
}

pub(crate) fn build_orchestrator(
    project_dir: &Path,
    store: DbHandle,
    config: &VdsConfig,
) -> Result<Orchestrator> {
    let registry = CapabilityRegistry::from_config(&config.capabilities)?;
    let mut settings = SupervisorSettings::from_config(config);
    if let Some(dir) = settings.audit.export_dir.take() {
        settings.audit.export_dir = Some(project_path(project_dir, &dir));
    }
    Orchestrator::new(Arc::new(store), registry, settings)
        .context("Configure a capability for every step under [capabilities] in vds.toml")
}
