use crate::core::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    #[serde(default)]
    has_rebalanced: bool,
}

/// Durable "has the user ever completed a rebalance" flag.
///
/// Read once when the store is opened, written once on the first successful
/// outcome. It only switches first-run copy; nothing else depends on it.
#[derive(Debug)]
pub struct FlagStore {
    path: PathBuf,
    has_rebalanced: AtomicBool,
}

impl FlagStore {
    /// A missing or unreadable file means "never rebalanced".
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let has_rebalanced = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<PersistedState>(&text) {
                Ok(state) => state.has_rebalanced,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt state file");
                    false
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read state file");
                false
            }
        };

        Self {
            path,
            has_rebalanced: AtomicBool::new(has_rebalanced),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_rebalanced(&self) -> bool {
        self.has_rebalanced.load(Ordering::SeqCst)
    }

    /// Persist the flag if it is not set yet. Returns `true` when this call
    /// wrote it.
    pub fn mark_rebalanced(&self) -> Result<bool, AppError> {
        if self.has_rebalanced.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(e) = self.write() {
            self.has_rebalanced.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(path = %self.path.display(), "first rebalance recorded");
        Ok(true)
    }

    fn write(&self) -> Result<(), AppError> {
        let body = serde_json::to_string_pretty(&PersistedState {
            has_rebalanced: true,
        })?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
