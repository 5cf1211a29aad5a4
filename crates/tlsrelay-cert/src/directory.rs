//! Resolver backed by certificate files on disk
//!
//! For a server name `api.example.com` the resolver looks for, in order:
//! - `<dir>/api.example.com.json` holding a `{"cert": ..., "key": ...}` payload
//! - `<dir>/api.example.com.crt` and `<dir>/api.example.com.key` PEM files
//!
//! and then the same two forms for the configured default name. Files are read
//! on every call so certificates can be rotated without a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::resolver::{CertificateResolver, ResolverError};
use crate::CertificatePayload;

pub struct DirectoryResolver {
    dir: PathBuf,
    default_name: Option<String>,
}

impl DirectoryResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default_name: None,
        }
    }

    /// Use `<dir>/<name>.*` when no file matches the requested server name
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_name = Some(name.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the payload stored under `name`, `None` if no file exists
    async fn load(&self, name: &str) -> Result<Option<CertificatePayload>, ResolverError> {
        let json_path = self.dir.join(format!("{}.json", name));
        if let Some(data) = read_optional(&json_path).await? {
            debug!(path = %json_path.display(), "Loaded certificate payload");
            return Ok(Some(CertificatePayload::from_json(&data)?));
        }

        let cert_path = self.dir.join(format!("{}.crt", name));
        let Some(cert) = read_optional(&cert_path).await? else {
            return Ok(None);
        };
        let key = read_optional(&self.dir.join(format!("{}.key", name))).await?;

        debug!(path = %cert_path.display(), "Loaded certificate files");
        // A missing key file surfaces as a missing `key` field downstream
        Ok(Some(CertificatePayload { cert: Some(cert), key }))
    }
}

#[async_trait]
impl CertificateResolver for DirectoryResolver {
    async fn resolve(&self, server_name: &str) -> Result<CertificatePayload, ResolverError> {
        if !server_name.is_empty() {
            let name = server_name.to_ascii_lowercase();
            validate_file_name(&name)?;

            if let Some(payload) = self.load(&name).await? {
                return Ok(payload);
            }
        }

        if let Some(default_name) = &self.default_name {
            validate_file_name(default_name)?;
            if let Some(payload) = self.load(default_name).await? {
                return Ok(payload);
            }
        }

        Err(ResolverError::NotFound(server_name.to_string()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ResolverError> {
    match fs::read_to_string(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Server names become file names, so keep them from leaving the directory
fn validate_file_name(name: &str) -> Result<(), ResolverError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(ResolverError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertError;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tlsrelay-cert-{}-{}-{}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("api.example.com").is_ok());
        assert!(validate_file_name("my_host-1.local").is_ok());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name(".hidden").is_err());
        assert!(validate_file_name("").is_err());
    }

    #[tokio::test]
    async fn test_resolve_json_payload() {
        let dir = temp_dir("json");
        std::fs::write(
            dir.join("api.example.com.json"),
            r#"{"cert": "CERT", "key": "KEY"}"#,
        )
        .unwrap();

        let resolver = DirectoryResolver::new(&dir);
        let payload = resolver.resolve("API.example.com").await.unwrap();
        assert_eq!(payload, CertificatePayload::new("CERT", "KEY"));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_resolve_pem_files_and_default() {
        let dir = temp_dir("pem");
        std::fs::write(dir.join("fallback.crt"), "CERT").unwrap();
        std::fs::write(dir.join("fallback.key"), "KEY").unwrap();
        std::fs::write(dir.join("nokey.example.com.crt"), "CERT").unwrap();

        let resolver = DirectoryResolver::new(&dir).with_default("fallback");

        let payload = resolver.resolve("unknown.example.com").await.unwrap();
        assert_eq!(payload, CertificatePayload::new("CERT", "KEY"));

        let payload = resolver.resolve("").await.unwrap();
        assert_eq!(payload, CertificatePayload::new("CERT", "KEY"));

        let payload = resolver.resolve("nokey.example.com").await.unwrap();
        assert!(matches!(
            payload.into_record(),
            Err(CertError::MissingField("key"))
        ));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal() {
        let resolver = DirectoryResolver::new(std::env::temp_dir());
        let result = resolver.resolve("../secret").await;
        assert!(matches!(result, Err(ResolverError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let dir = temp_dir("empty");
        let resolver = DirectoryResolver::new(&dir);
        let result = resolver.resolve("api.example.com").await;
        assert!(matches!(result, Err(ResolverError::NotFound(_))));
        std::fs::remove_dir_all(dir).ok();
    }
}
