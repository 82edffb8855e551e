use std::{fs, path::Path};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Calling it again is a no-op.
pub fn init() -> anyhow::Result<()> {
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    // Ignore error if the handle was already set; this should only be called once.
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub fn render() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}

/// Write the current metrics in Prometheus text format for node_exporter's
/// textfile collector. Does nothing if the recorder was never installed.
pub fn write_textfile(path: &Path) -> anyhow::Result<()> {
    let Some(body) = render() else {
        return Ok(());
    };

    // Rename into place so the collector never reads a half-written file.
    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to move metrics into {}", path.display()))?;

    tracing::debug!(path = %path.display(), "wrote metrics textfile");
    Ok(())
}
