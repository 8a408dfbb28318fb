//! Resource loading seam used while settling a reconstruction
//!
//! Frames load a same-origin placeholder before their stored content is
//! replayed, and external style sheets are fetched so the preview can apply
//! them. Both go through a [`ResourceLoader`] so embedders decide whether the
//! network is touched at all.

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;

use crate::{Error, Result};

/// Async loader for frame placeholders and style sheet assets
pub trait ResourceLoader: Send + Sync {
    /// Resolve once the placeholder document at `placeholder` has loaded.
    fn load_frame<'a>(&'a self, placeholder: &'a str) -> BoxFuture<'a, Result<()>> {
        let _ = placeholder;
        Box::pin(async { Ok(()) })
    }

    /// Fetch the text of an external style sheet.
    fn fetch_stylesheet<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Loader that never touches the network: frames load instantly, fetches fail
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetworkLoader;

impl ResourceLoader for NoNetworkLoader {
    fn fetch_stylesheet<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Err(Error::LoadError(format!("{} (network disabled)", url))) })
    }
}

/// In-memory loader for offline previews and tests
#[derive(Debug, Default, Clone)]
pub struct MemoryLoader {
    sheets: HashMap<String, String>,
    failing_frames: HashSet<String>,
    stall_frames: bool,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, url: &str, css: &str) -> Self {
        self.sheets.insert(url.to_string(), css.to_string());
        self
    }

    /// Frames loading `placeholder` fail instead of loading.
    pub fn with_failing_frame(mut self, placeholder: &str) -> Self {
        self.failing_frames.insert(placeholder.to_string());
        self
    }

    /// Frame loads never complete.
    pub fn stalling_frames(mut self) -> Self {
        self.stall_frames = true;
        self
    }
}

impl ResourceLoader for MemoryLoader {
    fn load_frame<'a>(&'a self, placeholder: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.stall_frames {
                futures::future::pending::<()>().await;
            }
            if self.failing_frames.contains(placeholder) {
                return Err(Error::LoadError(format!("frame {}", placeholder)));
            }
            Ok(())
        })
    }

    fn fetch_stylesheet<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.sheets
                .get(url)
                .cloned()
                .ok_or_else(|| Error::LoadError(format!("{} (not found)", url)))
        })
    }
}

#[cfg(feature = "http")]
pub use http::HttpLoader;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use reqwest::Client;

    use super::ResourceLoader;
    use crate::{Error, Result, SessionConfig};

    /// Fetches style sheets over HTTP(S)
    pub struct HttpLoader {
        client: Client,
    }

    impl HttpLoader {
        pub fn new(config: &SessionConfig) -> Result<Self> {
            let client = Client::builder()
                .timeout(Duration::from_millis(config.asset_timeout_ms))
                .build()
                .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Self { client })
        }
    }

    impl ResourceLoader for HttpLoader {
        fn fetch_stylesheet<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| Error::LoadError(format!("{}: {}", url, e)))?;
                if !resp.status().is_success() {
                    return Err(Error::LoadError(format!("{}: HTTP {}", url, resp.status())));
                }
                resp.text()
                    .await
                    .map_err(|e| Error::LoadError(format!("{}: failed to read body: {}", url, e)))
            })
        }
    }
}
