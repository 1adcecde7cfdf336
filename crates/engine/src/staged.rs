//! Staged artifact naming.
//!
//! Every intermediate file the pipeline writes carries the metadata needed to
//! repack it inside its own file name:
//!
//! ```text
//! <base>.<F|N>.<name, base64url>.<track id or x>.<language>.<ext>
//! ```
//!
//! Fields are read from the right, so `base` may itself contain dots. The
//! track name is base64url encoded without padding and never contains a dot.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Track id segment used for files that did not come out of the container.
const EXTERNAL_ID: &str = "x";

/// Error type for staged name decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StagedNameError {
    #[error("Not a staged file name: {0}")]
    Malformed(String),

    #[error("Invalid forced flag '{0}'")]
    ForcedFlag(String),

    #[error("Invalid track id '{0}'")]
    TrackId(String),

    #[error("Invalid encoded track name '{0}'")]
    Name(String),
}

/// Metadata encoded into a staged file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedName {
    pub base: String,
    pub forced: bool,
    pub name: String,
    /// Source track id; `None` for fetched files
    pub track_id: Option<u32>,
    pub language: String,
    pub ext: String,
}

impl StagedName {
    pub fn new(
        base: impl Into<String>,
        forced: bool,
        name: impl Into<String>,
        track_id: Option<u32>,
        language: impl Into<String>,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            base: base.into(),
            forced,
            name: name.into(),
            track_id,
            language: language.into(),
            ext: ext.into(),
        }
    }

    /// Render the file name
    pub fn encode(&self) -> String {
        let id = self
            .track_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| EXTERNAL_ID.to_string());
        format!(
            "{}.{}.{}.{}.{}.{}",
            self.base,
            if self.forced { "F" } else { "N" },
            URL_SAFE_NO_PAD.encode(self.name.as_bytes()),
            id,
            self.language,
            self.ext
        )
    }

    /// Parse a file name produced by [`StagedName::encode`]
    pub fn decode(file_name: &str) -> Result<Self, StagedNameError> {
        let parts: Vec<&str> = file_name.rsplitn(6, '.').collect();
        if parts.len() != 6 {
            return Err(StagedNameError::Malformed(file_name.to_string()));
        }
        let (ext, language, id, name, flag, base) =
            (parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]);

        if base.is_empty() || language.is_empty() || ext.is_empty() {
            return Err(StagedNameError::Malformed(file_name.to_string()));
        }

        let forced = match flag {
            "F" => true,
            "N" => false,
            other => return Err(StagedNameError::ForcedFlag(other.to_string())),
        };

        let track_id = if id == EXTERNAL_ID {
            None
        } else {
            Some(
                id.parse::<u32>()
                    .map_err(|_| StagedNameError::TrackId(id.to_string()))?,
            )
        };

        let name_bytes = URL_SAFE_NO_PAD
            .decode(name)
            .map_err(|_| StagedNameError::Name(name.to_string()))?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| StagedNameError::Name(name.to_string()))?;

        Ok(Self {
            base: base.to_string(),
            forced,
            name,
            track_id,
            language: language.to_string(),
            ext: ext.to_string(),
        })
    }

    /// Decode the final component of `path`
    pub fn from_path(path: &Path) -> Result<Self, StagedNameError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StagedNameError::Malformed(path.display().to_string()))?;
        Self::decode(file_name)
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.encode())
    }

    /// Same metadata with another extension, for a conversion's output
    pub fn with_ext(&self, ext: &str) -> Self {
        Self {
            ext: ext.to_string(),
            ..self.clone()
        }
    }

    /// Same metadata with another track name
    pub fn with_name(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}
