//! Media persistence
//!
//! Inbound media lands under `media/incoming/<channel>/YYYY/MM/DD/`
//! with restrictive permissions (0o700 directories, 0o600 files).
//! Outbound media sent via `send_media.mediaPath` must resolve —
//! symlinks followed — under the configured outgoing root.

pub mod asr;
pub mod tts;

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};

use crate::{Error, Result};

/// Incoming/outgoing media roots for one channel
#[derive(Debug, Clone)]
pub struct MediaStorage {
    incoming_root: PathBuf,
    outgoing_root: PathBuf,
}

impl MediaStorage {
    /// Create storage over the given roots
    #[must_use]
    pub fn new(incoming_root: PathBuf, outgoing_root: PathBuf) -> Self {
        Self {
            incoming_root,
            outgoing_root,
        }
    }

    /// Outgoing root (for containment checks)
    #[must_use]
    pub fn outgoing_root(&self) -> &Path {
        &self.outgoing_root
    }

    /// Persist one inbound media blob under the date-partitioned
    /// incoming tree; returns the file path
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub fn persist_incoming(&self, message_id: &str, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
        let now = Utc::now();
        let mut dir = self.incoming_root.clone();
        create_private_dirs(&dir)?;
        for part in [
            format!("{:04}", now.year()),
            format!("{:02}", now.month()),
            format!("{:02}", now.day()),
        ] {
            dir.push(part);
            create_private_dirs(&dir)?;
        }

        let safe_id: String = message_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let ext = ext.trim_start_matches('.');
        let path = dir.join(format!("{safe_id}.{ext}"));
        std::fs::write(&path, bytes)?;
        set_private_file(&path)?;
        Ok(path)
    }

    /// Persist a synthesized voice note under `<outgoing>/tts/`;
    /// returns the file path
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub fn persist_outgoing_tts(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.outgoing_root.join("tts");
        create_private_dirs(&dir)?;
        let path = dir.join(file_name);
        std::fs::write(&path, bytes)?;
        set_private_file(&path)?;
        Ok(path)
    }

    /// Resolve an outbound media path, requiring it to live under the
    /// outgoing root after following symlinks
    ///
    /// # Errors
    ///
    /// Returns `Error::Media` when the path escapes the root or does
    /// not exist
    pub fn resolve_outgoing(&self, raw: &str) -> Result<PathBuf> {
        let requested = Path::new(raw);
        let resolved = requested
            .canonicalize()
            .map_err(|e| Error::Media(format!("cannot resolve {raw}: {e}")))?;
        let root = self
            .outgoing_root
            .canonicalize()
            .map_err(|e| Error::Media(format!("outgoing root unavailable: {e}")))?;
        if !resolved.starts_with(&root) {
            return Err(Error::Media(format!(
                "media path escapes the outgoing root: {raw}"
            )));
        }
        Ok(resolved)
    }
}

/// Create a directory chain with mode 0o700
///
/// # Errors
///
/// Returns error on filesystem failure
pub fn create_private_dirs(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Set a file to mode 0o600
///
/// # Errors
///
/// Returns error on filesystem failure
pub fn set_private_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Enforce 0o700 on a directory and 0o600 on every file directly
/// inside it (credential dirs after updates)
///
/// # Errors
///
/// Returns error on filesystem failure
pub fn enforce_private_tree(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    create_private_dirs(dir)?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            set_private_file(&path)?;
        } else if path.is_dir() {
            enforce_private_tree(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (MediaStorage, PathBuf) {
        let root = std::env::temp_dir().join(format!("attache-media-{}", uuid::Uuid::new_v4()));
        let incoming = root.join("incoming");
        let outgoing = root.join("outgoing");
        std::fs::create_dir_all(&outgoing).unwrap();
        (MediaStorage::new(incoming, outgoing.clone()), outgoing)
    }

    #[test]
    fn incoming_media_is_date_partitioned_and_private() {
        let (storage, _) = storage();
        let path = storage.persist_incoming("MSG-1", "jpg", b"fake").unwrap();
        assert!(path.exists());
        let rel = path.to_string_lossy();
        let now = Utc::now();
        assert!(rel.contains(&format!("{:04}", now.year())));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn outgoing_path_containment() {
        let (storage, outgoing) = storage();
        let inside = outgoing.join("voice.ogg");
        std::fs::write(&inside, b"audio").unwrap();
        assert!(storage.resolve_outgoing(inside.to_str().unwrap()).is_ok());

        let outside = std::env::temp_dir().join(format!("attache-esc-{}.ogg", uuid::Uuid::new_v4()));
        std::fs::write(&outside, b"x").unwrap();
        assert!(storage.resolve_outgoing(outside.to_str().unwrap()).is_err());
    }

    #[test]
    fn missing_outgoing_path_is_rejected() {
        let (storage, outgoing) = storage();
        let missing = outgoing.join("nope.ogg");
        assert!(storage.resolve_outgoing(missing.to_str().unwrap()).is_err());
    }
}
