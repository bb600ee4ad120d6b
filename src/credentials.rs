//! Credential bundles and the ordered fetch plan built from them.
//!
//! A plan is the list of strategies a fetch walks through: every configured
//! cookie file in the configured order, followed by an attempt without
//! cookies. Each strategy also carries a randomly drawn client identity
//! (user agent and, for YouTube, a player client).

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing::debug;

pub const NO_CREDENTIALS: &str = "none";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
];

const PLAYER_CLIENTS: &[&str] = &["web", "mweb", "android", "ios", "tv"];

/// One stored set of auth cookies. `cookies: None` is the anonymous bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub name: String,
    pub cookies: Option<PathBuf>,
}

impl CredentialBundle {
    pub fn none() -> Self {
        Self {
            name: NO_CREDENTIALS.to_string(),
            cookies: None,
        }
    }

    pub fn cookie_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            cookies: Some(path),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.cookies.is_none()
    }
}

/// Identifying headers presented to the source for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub player_client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchStrategy {
    pub bundle: CredentialBundle,
    pub identity: ClientIdentity,
}

/// How cookie bundles are ordered before the anonymous fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialOrder {
    /// Discovery order (file name order for a cookie directory).
    #[default]
    Fixed,
    /// Freshly shuffled for every plan using the planner's RNG.
    Shuffled,
}

impl CredentialOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" | "ordered" | "sequential" => Some(Self::Fixed),
            "shuffled" | "shuffle" | "random" => Some(Self::Shuffled),
            _ => None,
        }
    }
}

/// Builds fetch plans.
///
/// The RNG is created once, from `seed` when given and from OS entropy
/// otherwise, and is never reseeded. Two planners built with the same seed
/// and bundles yield the same sequence of plans.
pub struct CredentialPlanner {
    bundles: Vec<CredentialBundle>,
    order: CredentialOrder,
    user_agents: Vec<String>,
    player_clients: Vec<String>,
    rng: Mutex<StdRng>,
}

impl CredentialPlanner {
    pub fn new(bundles: Vec<CredentialBundle>, order: CredentialOrder, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            bundles: bundles
                .into_iter()
                .filter(|bundle| !bundle.is_anonymous())
                .collect(),
            order,
            user_agents: USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            player_clients: PLAYER_CLIENTS.iter().map(|pc| pc.to_string()).collect(),
            rng: Mutex::new(rng),
        }
    }

    /// Loads cookie bundles from `path`: every `*.txt` in a directory (sorted
    /// by file name), a single file, or nothing when the path is missing.
    pub fn discover(path: &Path, order: CredentialOrder, seed: Option<u64>) -> Result<Self> {
        let bundles = discover_bundles(path)
            .with_context(|| format!("reading cookie bundles from {}", path.display()))?;
        debug!(count = bundles.len(), "discovered cookie bundles");
        Ok(Self::new(bundles, order, seed))
    }

    pub fn with_player_clients(mut self, clients: Vec<String>) -> Self {
        self.player_clients = clients;
        self
    }

    pub fn bundles(&self) -> &[CredentialBundle] {
        &self.bundles
    }

    pub fn order(&self) -> CredentialOrder {
        self.order
    }

    /// Produces the ordered strategy list for one fetch. The anonymous
    /// bundle is always the last entry.
    pub fn plan(&self) -> Vec<FetchStrategy> {
        let mut rng = self.rng.lock();
        let mut bundles = self.bundles.clone();
        if self.order == CredentialOrder::Shuffled {
            bundles.shuffle(&mut *rng);
        }
        bundles.push(CredentialBundle::none());

        bundles
            .into_iter()
            .map(|bundle| {
                let user_agent = self
                    .user_agents
                    .choose(&mut *rng)
                    .cloned()
                    .unwrap_or_default();
                let player_client = self.player_clients.choose(&mut *rng).cloned();
                FetchStrategy {
                    bundle,
                    identity: ClientIdentity {
                        user_agent,
                        player_client,
                    },
                }
            })
            .collect()
    }
}

fn discover_bundles(path: &Path) -> io::Result<Vec<CredentialBundle>> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    if meta.is_file() {
        return Ok(vec![CredentialBundle::cookie_file(path)]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let candidate = entry.path();
        let is_txt = candidate
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
        if is_txt && entry.file_type()?.is_file() {
            files.push(candidate);
        }
    }
    files.sort();
    Ok(files.into_iter().map(CredentialBundle::cookie_file).collect())
}
