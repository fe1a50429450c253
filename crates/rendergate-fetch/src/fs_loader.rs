//! File-system resource loader, used for local bundles and tests.

use crate::error::FetchError;
use crate::loader::{scripts_only, LoadOperation, LoaderState, ResourceFilter, ResourceLoader};
use bytes::Bytes;
use rendergate_common::{AbortableOperation, Closeable};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Serves files beneath a root directory. Never caches.
///
/// Accepted locations: `file://` URLs, absolute paths and paths relative to
/// the root. Absolute paths outside the root are re-rooted beneath it; any
/// path that still escapes the root (via `..`) is rejected.
pub struct FileResourceLoader {
    root: PathBuf,
    state: Arc<LoaderState>,
    filter: ResourceFilter,
}

impl FileResourceLoader {
    /// Fails if `root` is not an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, FetchError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(FetchError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("loader root '{}' does not exist", root.display()),
            )));
        }

        Ok(Self {
            root: root.canonicalize()?,
            state: LoaderState::new(),
            filter: scripts_only(),
        })
    }

    pub fn with_filter(mut self, filter: ResourceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a location to a path under the root.
    pub fn resolve(&self, location: &str) -> Result<PathBuf, FetchError> {
        let requested = if location.starts_with("file://") {
            Url::parse(location)?
                .to_file_path()
                .map_err(|_| FetchError::InvalidUrl(location.to_string()))?
        } else {
            PathBuf::from(location)
        };

        let relative = if requested.starts_with(&self.root) {
            requested.strip_prefix(&self.root).map(Path::to_path_buf).unwrap_or_default()
        } else {
            requested
        };

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root) {
                        return Err(FetchError::OutsideRoot(location.to_string()));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        if !resolved.starts_with(&self.root) {
            return Err(FetchError::OutsideRoot(location.to_string()));
        }
        Ok(resolved)
    }
}

impl ResourceLoader for FileResourceLoader {
    fn fetch(&self, url: &str) -> LoadOperation {
        if let Some(done) = self.state.short_circuit(url, &self.filter) {
            return done;
        }

        let path = match self.resolve(url) {
            Ok(path) => path,
            Err(e) => return AbortableOperation::ready(Err(e)),
        };

        let op = AbortableOperation::new(
            async move {
                let content = tokio::fs::read(&path).await?;
                tracing::debug!(path = %path.display(), bytes = content.len(), "Read resource");
                Ok::<_, FetchError>(Bytes::from(content))
            },
            || Err(FetchError::Aborted),
        );
        self.state.track(op)
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn into_closeable(self: Arc<Self>) -> Arc<dyn Closeable> {
        self
    }
}

impl Closeable for FileResourceLoader {
    fn name(&self) -> &str {
        "file-loader"
    }

    fn close(&self) -> rendergate_common::Result<()> {
        if self.state.close() {
            tracing::debug!(root = %self.root.display(), "File loader closed");
        }
        Ok(())
    }
}
