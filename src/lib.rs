#![forbid(unsafe_code)]

//! Download coordinator fronting yt-dlp: an on-disk audio cache with
//! per-id fetch de-duplication and credential fallback, plus song search
//! and channel archiving.

pub mod archive;
pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod scraper;
pub mod security;
pub mod tasks;
