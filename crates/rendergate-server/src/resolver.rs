//! File-list resolvers
//!
//! A resolver decides which program files a render executes, in order.

use async_trait::async_trait;
use rendergate_common::{RenderApi, RenderError, Result};
use std::sync::Arc;
use url::Url;

#[async_trait]
pub trait FileListResolver: Send + Sync {
    /// Returns the file locations to execute for `url`, in execution order.
    async fn resolve(&self, url: &str, api: &dyn RenderApi) -> Result<Vec<String>>;
}

/// The same configured list for every URL.
///
/// Entries that parse as absolute URLs are used as-is. Other entries are
/// joined onto `base` when one is set, and passed through untouched
/// otherwise (the file-system loader accepts plain paths).
#[derive(Debug, Clone)]
pub struct StaticFileList {
    files: Vec<String>,
}

impl StaticFileList {
    pub fn new(files: Vec<String>, base: Option<&Url>) -> Result<Self> {
        let files = files
            .into_iter()
            .map(|entry| resolve_entry(&entry, base))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { files })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }
}

fn resolve_entry(entry: &str, base: Option<&Url>) -> Result<String> {
    if Url::parse(entry).is_ok() {
        return Ok(entry.to_string());
    }
    match base {
        Some(base) => base
            .join(entry)
            .map(String::from)
            .map_err(|e| RenderError::Config(format!("Cannot resolve script '{}': {}", entry, e))),
        None => Ok(entry.to_string()),
    }
}

#[async_trait]
impl FileListResolver for StaticFileList {
    async fn resolve(&self, _url: &str, _api: &dyn RenderApi) -> Result<Vec<String>> {
        Ok(self.files.clone())
    }
}

type ResolveFn = dyn Fn(&str, &dyn RenderApi) -> Result<Vec<String>> + Send + Sync;

/// Resolver backed by a closure.
#[derive(Clone)]
pub struct FnFileList {
    resolve: Arc<ResolveFn>,
}

impl FnFileList {
    pub fn new<F>(resolve: F) -> Self
    where
        F: Fn(&str, &dyn RenderApi) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self {
            resolve: Arc::new(resolve),
        }
    }
}

#[async_trait]
impl FileListResolver for FnFileList {
    async fn resolve(&self, url: &str, api: &dyn RenderApi) -> Result<Vec<String>> {
        (self.resolve)(url, api)
    }
}

impl std::fmt::Debug for FnFileList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFileList").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendergate_common::RequestRenderApi;

    #[tokio::test]
    async fn test_static_list_resolves_relative_entries() {
        let base = Url::parse("https://cdn.test/assets/").unwrap();
        let list = StaticFileList::new(
            vec![
                "vendor.js".into(),
                "/root.js".into(),
                "https://other.test/app.js".into(),
            ],
            Some(&base),
        )
        .unwrap();

        let files = list
            .resolve("https://shop.test/", &RequestRenderApi::new())
            .await
            .unwrap();
        assert_eq!(
            files,
            vec![
                "https://cdn.test/assets/vendor.js",
                "https://cdn.test/root.js",
                "https://other.test/app.js",
            ]
        );
    }

    #[tokio::test]
    async fn test_static_list_without_base_keeps_paths() {
        let list = StaticFileList::new(vec!["a.js".into(), "lib/b.js".into()], None).unwrap();
        assert_eq!(list.files(), ["a.js", "lib/b.js"]);
    }

    #[tokio::test]
    async fn test_fn_list_sees_url_and_headers() {
        let resolver = FnFileList::new(|url, api| {
            let locale = api.header("accept-language").unwrap_or_else(|| "en".into());
            Ok(vec![format!("{}#{}", url, locale)])
        });
        let api = RequestRenderApi::from_headers([("Accept-Language", "fr")]);

        let files = resolver.resolve("https://shop.test/", &api).await.unwrap();
        assert_eq!(files, vec!["https://shop.test/#fr"]);
    }
}
