// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Files logged by the caller.
//!
//! A [`File`] is unmaterialized: it holds either a path or in-memory bytes and
//! carries a random id. [`File::materialize`] reads the content once, hashes
//! it, copies it into the run's `files/` directory and hands back an
//! immutable [`Artifact`] whose identity is the full content hash. The
//! original bytes are released at that point.
//!
//! The only mutable part of an artifact is its storage URL, set at most once
//! by the upload pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::files_dir;
use crate::error::FileError;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Image,
    Audio,
    Video,
    Text,
}

impl FileKind {
    /// Type name registered with the service for fields of this kind.
    #[must_use]
    pub const fn log_type(self) -> &'static str {
        match self {
            FileKind::File => "FILE",
            FileKind::Image => "IMAGE",
            FileKind::Audio => "AUDIO",
            FileKind::Video => "VIDEO",
            FileKind::Text => "TEXT",
        }
    }

    const fn mime_prefix(self) -> Option<&'static str> {
        match self {
            FileKind::Image => Some("image/"),
            FileKind::Audio => Some("audio/"),
            FileKind::Video => Some("video/"),
            FileKind::File | FileKind::Text => None,
        }
    }
}

enum Source {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Source::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// A file that has not been copied into the run yet.
#[derive(Debug)]
pub struct File {
    kind: FileKind,
    name: Option<String>,
    ext: String,
    source: Source,
    id: String,
}

/// 8-char lowercase alphanumeric id.
#[must_use]
pub fn gen_id() -> String {
    random_id(8)
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim();
    if ext.is_empty() || ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

impl File {
    fn new(kind: FileKind, source: Source, ext: &str, name: Option<String>) -> Self {
        Self {
            kind,
            name,
            ext: normalize_ext(ext),
            source,
            id: random_id(32),
        }
    }

    /// A file on disk. Without a name, the content hash becomes the name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(FileKind::File, Source::Path(path), &ext, None)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>, ext: &str) -> Self {
        Self::new(FileKind::File, Source::Bytes(bytes.into()), ext, None)
    }

    /// Encoded PNG content.
    pub fn image(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(
            FileKind::Image,
            Source::Bytes(bytes.into()),
            "png",
            Some("image".to_string()),
        )
    }

    pub fn audio(bytes: impl Into<Vec<u8>>, ext: &str) -> Self {
        Self::new(
            FileKind::Audio,
            Source::Bytes(bytes.into()),
            ext,
            Some("audio".to_string()),
        )
    }

    pub fn video(bytes: impl Into<Vec<u8>>, ext: &str) -> Self {
        Self::new(
            FileKind::Video,
            Source::Bytes(bytes.into()),
            ext,
            Some("video".to_string()),
        )
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(
            FileKind::Text,
            Source::Bytes(content.into().into_bytes()),
            "txt",
            Some("text".to_string()),
        )
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: FileKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Random until materialized.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reads, hashes and copies the content to `<work_dir>/files/<name>-<hash><ext>`.
    pub fn materialize(self, work_dir: &Path) -> Result<Arc<Artifact>, FileError> {
        let bytes = match self.source {
            Source::Path(path) => {
                std::fs::read(&path).map_err(|source| FileError::Read { path, source })?
            }
            Source::Bytes(bytes) => bytes,
        };

        let hash = content_hash(&bytes);
        let name = match self.name {
            Some(name) if !name.is_empty() => sanitize_name(&name),
            _ => hash.clone(),
        };

        let dir = files_dir(work_dir);
        std::fs::create_dir_all(&dir).map_err(|source| FileError::Write {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{name}-{hash}{}", self.ext));
        std::fs::write(&path, &bytes).map_err(|source| FileError::Write {
            path: path.clone(),
            source,
        })?;

        let mime = guess_mime(&self.ext);
        if let Some(prefix) = self.kind.mime_prefix() {
            if !mime.starts_with(prefix) {
                warn!(
                    "{}: proceeding with potentially incompatible mime type: {}",
                    self.kind.log_type(),
                    mime
                );
            }
        }
        debug!("Materialized {} ({} bytes)", path.display(), bytes.len());

        Ok(Arc::new(Artifact {
            name,
            ext: self.ext,
            kind: self.kind,
            mime,
            size: bytes.len() as u64,
            hash,
            path,
            url: OnceLock::new(),
        }))
    }
}

/// A file copied into the run's working directory.
#[derive(Debug)]
pub struct Artifact {
    name: String,
    ext: String,
    kind: FileKind,
    mime: String,
    size: u64,
    hash: String,
    path: PathBuf,
    url: OnceLock<String>,
}

impl Artifact {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ext(&self) -> &str {
        &self.ext
    }

    /// `name + ext`, the key the registration response is matched on.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.ext)
    }

    /// Extension without the leading dot.
    #[must_use]
    pub fn file_type(&self) -> &str {
        self.ext.trim_start_matches('.')
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    #[must_use]
    pub fn mime(&self) -> &str {
        &self.mime
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.get().map(String::as_str)
    }

    /// Returns false when a URL was already set; the first one is kept.
    pub fn set_url(&self, url: impl Into<String>) -> bool {
        self.url.set(url.into()).is_ok()
    }
}

#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[allow(clippy::expect_used)]
fn invalid_chars() -> &'static Regex {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_\-.]").expect("failed creating regex"))
}

/// Replaces every character outside `[a-zA-Z0-9_-.]` with `-`.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let re = invalid_chars();
    if !re.is_match(name) {
        return name.to_string();
    }
    let sanitized = re.replace_all(name, "-").into_owned();
    warn!(
        "invalid file name: {}; file name may only contain alphanumeric characters, dashes, underscores, and periods; proceeding with {}",
        name, sanitized
    );
    sanitized
}

fn guess_mime(ext: &str) -> String {
    mime_guess::from_ext(ext.trim_start_matches('.'))
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}
