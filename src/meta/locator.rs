//! Storage locator URIs
//!
//! Locators have the form `scheme://host/path`. Supported schemes are
//! `file`, `s3`, `gs`, `abfs` and `http`; a path without a scheme refers to
//! the local filesystem.

use crate::{NebulaError, Result};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Local,
    S3,
    Gs,
    Abfs,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub scheme: Scheme,
    /// Bucket or host; empty for local paths
    pub host: String,
    pub path: String,
}

impl Locator {
    pub fn parse(uri: &str) -> Result<Locator> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            // absent scheme defaults to the local filesystem
            return Ok(Locator {
                scheme: Scheme::Local,
                host: String::new(),
                path: uri.to_string(),
            });
        };
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "file" => Scheme::Local,
            "s3" => Scheme::S3,
            "gs" => Scheme::Gs,
            "abfs" => Scheme::Abfs,
            "http" => Scheme::Http,
            other => {
                return Err(NebulaError::Config(format!(
                    "unsupported locator scheme '{}'",
                    other
                )))
            }
        };
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host.to_string(), format!("/{}", path)),
            None => (rest.to_string(), String::new()),
        };
        Ok(Locator { scheme, host, path })
    }

    pub fn is_local(&self) -> bool {
        self.scheme == Scheme::Local
    }
}

/// Resolve a locator to a local filesystem path; non-local schemes are not
/// mounted in the core.
pub fn local_path(uri: &str) -> Result<PathBuf> {
    let locator = Locator::parse(uri)?;
    if !locator.is_local() {
        return Err(NebulaError::Config(format!(
            "locator '{}' is not on the local filesystem",
            uri
        )));
    }
    if locator.host.is_empty() {
        Ok(PathBuf::from(locator.path))
    } else {
        // "file://host/path" keeps the host as the first path component
        Ok(PathBuf::from(format!("{}{}", locator.host, locator.path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemes() {
        let l = Locator::parse("s3://bucket/a/b").unwrap();
        assert_eq!(l.scheme, Scheme::S3);
        assert_eq!(l.host, "bucket");
        assert_eq!(l.path, "/a/b");

        let l = Locator::parse("file:///data/part.json").unwrap();
        assert!(l.is_local());
        assert_eq!(l.path, "/data/part.json");

        let l = Locator::parse("/plain/path").unwrap();
        assert!(l.is_local());
        assert_eq!(l.path, "/plain/path");

        assert!(Locator::parse("ftp://x/y").is_err());
    }

    #[test]
    fn test_local_path() {
        assert_eq!(
            local_path("file:///data/p.json").unwrap(),
            PathBuf::from("/data/p.json")
        );
        assert_eq!(local_path("rel/p.json").unwrap(), PathBuf::from("rel/p.json"));
        assert!(local_path("s3://b/p.json").is_err());
    }
}
