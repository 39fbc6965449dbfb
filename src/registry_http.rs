use crate::registry::{RegistryManifest, MANIFEST_FILE};
use crate::{Error, Result};
use std::time::Duration;

pub struct HttpRegistryClient {
    name: String,
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpRegistryClient {
    pub fn new(name: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid registry URL '{}': {}", base_url, e)))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("forgepm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a content URI against the registry root
    fn url_for(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else {
            format!("{}/{}", self.base_url, uri.trim_start_matches('/'))
        }
    }

    fn get(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_connect() {
                Error::Network(format!(
                    "Cannot connect to registry '{}' at {}",
                    self.name, self.base_url
                ))
            } else if e.is_timeout() {
                Error::Network(format!("Request to registry '{}' timed out: {}", self.name, url))
            } else {
                Error::Network(format!("Request to registry '{}' failed: {}", self.name, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = match status.as_u16() {
                404 => format!("{} not found on registry '{}'", url, self.name),
                500 | 502 | 503 | 504 => format!(
                    "Registry '{}' server error (HTTP {})",
                    self.name,
                    status.as_u16()
                ),
                code => format!("Registry '{}' returned HTTP {} for {}", self.name, code, url),
            };
            return Err(Error::Network(message));
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::Network(format!("Failed to read response from {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    pub fn fetch_manifest(&self) -> Result<RegistryManifest> {
        let body = self.get(&self.url_for(MANIFEST_FILE))?;
        let manifest: RegistryManifest =
            serde_json::from_slice(&body).map_err(|e| Error::InvalidManifest {
                registry: self.name.clone(),
                reason: e.to_string(),
            })?;
        manifest.validate(&self.name)?;
        Ok(manifest)
    }

    pub fn fetch_content(&self, uri: &str) -> Result<Vec<u8>> {
        self.get(&self.url_for(uri))
    }
}
