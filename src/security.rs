//! Shared security helpers: process privilege checks and content id
//! validation.

use std::{fmt, str::FromStr};

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::CoordinatorError;

/// Length of a YouTube video id.
pub const CONTENT_ID_LEN: usize = 11;

/// Fails fast when a binary is started as root. Cookies and cached media are
/// written with the process' permissions, so a service account is expected.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Validated media identifier.
///
/// The value doubles as a cache key, a filename stem and part of the yt-dlp
/// source URL, so only `[A-Za-z0-9_-]{11}` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(String);

impl ContentId {
    pub fn parse(raw: &str) -> Result<Self, CoordinatorError> {
        if is_valid_content_id(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CoordinatorError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Watch URL handed to the media fetcher.
    pub fn source_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

pub fn is_valid_content_id(raw: &str) -> bool {
    raw.len() == CONTENT_ID_LEN
        && raw
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = CoordinatorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
