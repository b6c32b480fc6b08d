//! Per-request scratch directories.
//!
//! A [`Workspace`] owns one uniquely named directory under the configured
//! root. The directory and everything in it is removed when the guard is
//! dropped, whichever way the request ends.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DIR_PREFIX: &str = "dots_ocr_";
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Scoped temporary directory for a single request.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    session_id: String,
}

impl Workspace {
    /// Allocate `<root>/dots_ocr_<session_id>`.
    ///
    /// The leaf is created with `create_dir`, so an identifier collision shows
    /// up as `AlreadyExists` and a fresh identifier is drawn.
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let session_id = new_session_id();
            let dir = root.join(format!("{}{}", DIR_PREFIX, session_id));
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    debug!("Workspace created: {:?}", dir);
                    return Ok(Self { dir, session_id });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "could not allocate a unique workspace under {:?} after {} attempts",
                root, MAX_CREATE_ATTEMPTS
            ),
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write the uploaded bytes to `upload<ext>` inside the workspace.
    pub async fn persist_upload(&self, ext: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.join(format!("upload{}", ext.to_lowercase()));
        tokio::fs::write(&path, data).await?;
        debug!("Persisted upload to {:?} ({} bytes)", path, data.len());
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Workspace removed: {:?}", self.dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {:?}: {}", self.dir, e),
        }
    }
}

/// Short random token: first 8 hex chars of a v4 UUID.
fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
