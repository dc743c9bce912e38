use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadScheme {
    Http,
    Https,
    File,
}

impl UploadScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadScheme::Http => "http",
            UploadScheme::Https => "https",
            UploadScheme::File => "file",
        }
    }
}

/// Base URL of an upload site: `http(s)://host/prefix` or `file:///abs/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUrl {
    scheme: UploadScheme,
    base: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadUrlError {
    #[error("empty upload url")]
    Empty,
    #[error("upload url has no scheme: {0}")]
    MissingScheme(String),
    #[error("'{0}' is not a supported URL scheme (expected http, https or file)")]
    UnsupportedScheme(String),
    #[error("file url must name an absolute path: {0}")]
    InvalidFilePath(String),
}

impl UploadUrl {
    pub fn parse(input: &str) -> Result<Self, UploadUrlError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UploadUrlError::Empty);
        }

        let Some((scheme, rest)) = input.split_once("://") else {
            return Err(UploadUrlError::MissingScheme(input.to_string()));
        };
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => UploadScheme::Http,
            "https" => UploadScheme::Https,
            "file" => UploadScheme::File,
            other => return Err(UploadUrlError::UnsupportedScheme(other.to_string())),
        };

        let base = match scheme {
            UploadScheme::Http | UploadScheme::Https => {
                format!("{}://{}", scheme.as_str(), rest.trim_end_matches('/'))
            }
            UploadScheme::File => {
                let path = file_path_part(rest)
                    .ok_or_else(|| UploadUrlError::InvalidFilePath(input.to_string()))?;
                format!("file://{}", path.trim_end_matches('/'))
            }
        };

        Ok(Self { scheme, base })
    }

    pub fn scheme(&self) -> UploadScheme {
        self.scheme
    }

    /// Normalized base without a trailing `/`.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn is_file(&self) -> bool {
        self.scheme == UploadScheme::File
    }
}

impl fmt::Display for UploadUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

/// Maps a `file://` URL to the local path it names.
pub fn file_url_to_path(url: &str) -> Result<PathBuf, UploadUrlError> {
    let rest = url
        .strip_prefix("file://")
        .ok_or_else(|| UploadUrlError::MissingScheme(url.to_string()))?;
    file_path_part(rest)
        .map(PathBuf::from)
        .ok_or_else(|| UploadUrlError::InvalidFilePath(url.to_string()))
}

// `file:///p`, `file://localhost/p` -> `/p`
fn file_path_part(rest: &str) -> Option<&str> {
    let path = rest.strip_prefix("localhost").unwrap_or(rest);
    if path.starts_with('/') && path.len() > 1 {
        Some(path)
    } else {
        None
    }
}
