//! JSON event files
//!
//! Every `*.json` file in a data directory is one event. Files are read in
//! name order and each becomes one [`OutboundMessage`] carrying the compact
//! JSON encoding of the file's contents.

use crate::broker::api::Attributes;
use crate::publisher::api::OutboundMessage;
use std::path::{Path, PathBuf};

/// Attribute naming the file an event was loaded from
pub const ORIGIN_ATTRIBUTE: &str = "origin";

#[derive(Debug, thiserror::Error)]
pub enum DataFileError {
    #[error("{message}")]
    MissingDirectory { path: PathBuf, message: String },

    #[error("{message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Json {
        path: PathBuf,
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DataFileError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        DataFileError::Io {
            path: path.to_path_buf(),
            message: format!("Cannot read {}: {}", path.display(), source),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        DataFileError::Json {
            path: path.to_path_buf(),
            message: format!("{} is not valid JSON: {}", path.display(), source),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            DataFileError::MissingDirectory { path, .. }
            | DataFileError::Io { path, .. }
            | DataFileError::Json { path, .. } => path,
        }
    }
}

impl crate::core::error_handling::ContextualError for DataFileError {
    fn is_user_actionable(&self) -> bool {
        true
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            DataFileError::MissingDirectory { message, .. }
            | DataFileError::Io { message, .. }
            | DataFileError::Json { message, .. } => Some(message),
        }
    }
}

/// `*.json` files directly inside `dir`, sorted by name
pub async fn find_json_files(dir: &Path) -> Result<Vec<PathBuf>, DataFileError> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Err(DataFileError::MissingDirectory {
            path: dir.to_path_buf(),
            message: format!("Data directory does not exist: {}", dir.display()),
        });
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| DataFileError::io(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DataFileError::io(dir, e))?
    {
        let path = entry.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load every event in `dir` as an outbound message
pub async fn load_events(dir: &Path) -> Result<Vec<OutboundMessage>, DataFileError> {
    let files = find_json_files(dir).await?;
    let mut messages = Vec::with_capacity(files.len());
    for path in &files {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DataFileError::io(path, e))?;
        let value: serde_json::Value =
            serde_json::from_str(&contents).map_err(|e| DataFileError::json(path, e))?;

        let mut attributes = Attributes::new();
        if let Some(name) = path.file_name() {
            attributes.insert(
                ORIGIN_ATTRIBUTE.to_string(),
                name.to_string_lossy().into_owned(),
            );
        }
        let message =
            OutboundMessage::from_json(&value, attributes).map_err(|e| DataFileError::json(path, e))?;
        messages.push(message);
    }
    log::debug!("Loaded {} event(s) from {}", messages.len(), dir.display());
    Ok(messages)
}
