//! Container manifests carried inside image archives.
//!
//! An unpacked image may place a `config.json` beside its rootfs naming the
//! entry process to fork once the container's initd is up. Images without a
//! manifest run with an empty process table until a caller forks into them.

use std::path::Path;

use gantry_api::ProcessSpec;
use serde::Deserialize;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {detail}")]
    Read { path: String, detail: String },

    #[error("invalid container manifest {path}: {detail}")]
    Parse { path: String, detail: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerManifest {
    pub process: ProcessSpec,
}

/// Load the manifest from a container workdir, if one exists.
pub fn load(workdir: &Path) -> Result<Option<ContainerManifest>, ManifestError> {
    let path = workdir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(&path).map_err(|e| ManifestError::Read {
        path: path.display().to_string(),
        detail: e.to_string(),
    })?;

    let manifest: ContainerManifest =
        serde_json::from_str(&raw).map_err(|e| ManifestError::Parse {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;

    Ok(Some(manifest))
}
