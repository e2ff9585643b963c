//! Credential files pushed by the companion app
//!
//! Each file holds a JSON object with the network name and secret:
//! `{"ssid": "HomeNet", "password": "secret"}`.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_valid::Validate;
use std::{
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

#[derive(Clone, Deserialize, PartialEq, Eq, Validate)]
pub struct CredentialCandidate {
    #[validate(min_length = 1)]
    ssid: String,
    #[validate(min_length = 1)]
    password: String,
}

impl CredentialCandidate {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let candidate = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        candidate.validate().context("invalid credentials")?;
        Ok(candidate)
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for CredentialCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCandidate")
            .field("ssid", &self.ssid)
            .field("password", &"***")
            .finish()
    }
}

/// Result of one pass over the landing directory
#[derive(Debug, Default)]
pub struct Scan {
    pub candidates: Vec<CredentialCandidate>,
    /// Files carrying the credential extension, valid or not
    pub recognized_files: usize,
}

/// Reads credential files with a given extension from a directory
#[derive(Clone, Debug)]
pub struct CredentialStore {
    dir: PathBuf,
    extension: String,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Valid candidates in directory-listing order, invalid files are skipped
    pub fn parse_candidates(&self) -> Result<Vec<CredentialCandidate>> {
        self.scan().map(|scan| scan.candidates)
    }

    pub fn scan(&self) -> Result<Scan> {
        let entries = fs::read_dir(&self.dir)
            .context(format!("failed to read directory {:?}", self.dir))?;

        let mut scan = Scan::default();

        for path in entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| self.is_credential_file(path))
        {
            scan.recognized_files += 1;

            match read_candidate(&path) {
                Ok(candidate) => {
                    info!("found credentials in {path:?} for {}", candidate.ssid);
                    scan.candidates.push(candidate);
                }
                Err(e) => warn!("skipping credential file {path:?}: {e:#}"),
            }
        }

        Ok(scan)
    }

    /// Remove every credential file, a missing directory or file is not an error
    pub fn purge(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).context(format!("failed to read directory {:?}", self.dir));
            }
        };

        let mut removed = 0;
        for path in entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| self.is_credential_file(path))
        {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("failed to delete credential file {path:?}: {e:#}"),
            }
        }

        debug!("purged {removed} credential file(s) from {:?}", self.dir);
        Ok(removed)
    }

    fn is_credential_file(&self, path: &Path) -> bool {
        path.is_file() && path.extension().is_some_and(|ext| ext == self.extension.as_str())
    }
}

fn read_candidate(path: &Path) -> Result<CredentialCandidate> {
    let data = fs::read_to_string(path).context("failed to read file")?;
    let candidate: CredentialCandidate =
        serde_json::from_str(&data).context("failed to parse credentials")?;
    candidate.validate().context("invalid credentials")?;
    Ok(candidate)
}
