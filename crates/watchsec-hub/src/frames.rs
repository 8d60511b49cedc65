//! Screenshot volume: `<root>/<agent_id>/<yyyyMMdd>/<filename>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use watchsec_core::agent_id::validate_agent_id;

use crate::error::PersistError;
use crate::ports::FrameStore;

pub struct FsFrameStore {
    root: PathBuf,
}

impl FsFrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn frame_path(&self, agent_id: &str, date: &str, filename: &str) -> Result<PathBuf, PersistError> {
        if !validate_agent_id(agent_id) {
            return Err(PersistError::InvalidAgentId(agent_id.to_string()));
        }
        for part in [date, filename] {
            if part.is_empty() || part.contains(['/', '\\']) || part == ".." {
                return Err(PersistError::Unavailable(format!("bad frame path segment {part:?}")));
            }
        }
        Ok(self.root.join(agent_id).join(date).join(filename))
    }
}

#[async_trait]
impl FrameStore for FsFrameStore {
    async fn save_frame(
        &self,
        agent_id: &str,
        date: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PersistError> {
        let path = self.frame_path(agent_id, date, filename)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}
