//! Filesystem-backed exclusive tokens.
//!
//! A token is a file whose existence means "owned" and whose content names
//! the owner. Acquisition writes the signature to a numbered temp file with
//! open-exclusive-new, then installs it atomically such that success implies
//! the target did not previously exist; races between drivers produce at
//! most one winner.

use std::io::Write;
use std::path::{Path, PathBuf};

use girder_types::Result;

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Another owner holds the token; its signature is returned.
    Held(String),
}

/// Acquires and releases tokens on behalf of one job signature.
#[derive(Debug, Clone)]
pub struct TokenStore {
    signature: String,
}

impl TokenStore {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Try to take exclusive ownership of `token`.
    pub fn try_acquire(&self, token: &Path) -> Result<AcquireOutcome> {
        if let Some(parent) = token.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write the signature to `{token}.{N}.tmp`, renumbering on
        // collision with another driver's temp file.
        let mut temp = PathBuf::new();
        for n in 0.. {
            temp = PathBuf::from(format!("{}.{n}.tmp", token.display()));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp)
            {
                Ok(mut file) => {
                    file.write_all(self.signature.as_bytes())?;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // Install without overwriting: a hard link fails when the target
        // already exists, which is exactly the "rename unless present"
        // semantic acquisition needs.
        let outcome = match std::fs::hard_link(&temp, token) {
            Ok(()) => Ok(AcquireOutcome::Acquired),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = self.read_owner(token)?.unwrap_or_default();
                Ok(AcquireOutcome::Held(owner))
            }
            Err(e) => Err(e.into()),
        };
        let _ = std::fs::remove_file(&temp);
        outcome
    }

    /// The signature of whoever owns `token`, if anyone.
    pub fn read_owner(&self, token: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(token) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `token` if this store's signature owns it.
    pub fn release(&self, token: &Path) -> Result<()> {
        if self.read_owner(token)?.as_deref() == Some(self.signature.as_str()) {
            match std::fs::remove_file(token) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
