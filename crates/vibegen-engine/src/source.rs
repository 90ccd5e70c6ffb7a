use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;

use crate::truncate_text;

/// The I/O the normalizer is allowed to perform on a candidate reference.
pub trait ImageSource: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

impl<T: ImageSource + ?Sized> ImageSource for &T {
    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        (**self).read_file(path)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch(url)
    }
}

/// Local filesystem plus a blocking HTTP client.
#[derive(Debug, Clone)]
pub struct SystemImageSource {
    http: HttpClient,
    download_timeout: Duration,
}

impl SystemImageSource {
    pub fn new(download_timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            download_timeout,
        }
    }
}

impl ImageSource for SystemImageSource {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("failed reading {}", path.display()))
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!("image download failed ({code}): {}", truncate_text(&body, 512));
        }
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec();
        Ok(bytes)
    }
}

/// Only plain `http://` and `https://` addresses are fetched.
pub fn is_network_address(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}
