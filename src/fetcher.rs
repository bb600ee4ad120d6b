//! Media fetcher abstraction and the yt-dlp implementation.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error};

use crate::{credentials::FetchStrategy, security::ContentId};

const EXT_PLACEHOLDER: &str = "%(ext)s";
const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio/best";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Everything one fetch attempt needs.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub content_id: ContentId,
    pub source_url: String,
    /// `{staging}/{id}.%(ext)s`; the fetcher picks the extension.
    pub output_template: PathBuf,
    pub strategy: FetchStrategy,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn new(
        content_id: ContentId,
        staging_dir: &Path,
        strategy: FetchStrategy,
        max_retries: u32,
        timeout: Duration,
    ) -> Self {
        let output_template = staging_dir.join(format!("{content_id}.{EXT_PLACEHOLDER}"));
        Self {
            source_url: content_id.source_url(),
            content_id,
            output_template,
            strategy,
            max_retries,
            timeout,
        }
    }

    /// Concrete output path for a given extension.
    pub fn output_path(&self, ext: &str) -> PathBuf {
        let template = self.output_template.to_string_lossy();
        PathBuf::from(template.replace(EXT_PLACEHOLDER, ext))
    }

    fn log_path(&self) -> PathBuf {
        self.output_path("log")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {detail}")]
    Exit {
        program: String,
        status: ExitStatus,
        detail: String,
    },
    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

/// One blocking fetch attempt. Implementations are always driven from the
/// blocking thread pool, never from a request handler.
pub trait MediaFetcher: Send + Sync + 'static {
    fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError>;
}

/// Runs the `yt-dlp` binary.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: PathBuf,
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// Command line for one attempt. The source URL is always last so nothing
/// derived from the request can be read as an option.
pub fn ytdlp_args(request: &FetchRequest) -> Vec<String> {
    let identity = &request.strategy.identity;
    let mut args = vec![
        "--format".to_string(),
        AUDIO_FORMAT.to_string(),
        "--no-playlist".to_string(),
        "--no-check-certificates".to_string(),
        "--no-progress".to_string(),
        "--quiet".to_string(),
        "--no-part".to_string(),
        "--no-mtime".to_string(),
        "--retries".to_string(),
        request.max_retries.to_string(),
        "--concurrent-fragments".to_string(),
        "10".to_string(),
        "--user-agent".to_string(),
        identity.user_agent.clone(),
    ];
    if let Some(client) = &identity.player_client {
        args.push("--extractor-args".to_string());
        args.push(format!("youtube:player_client={client}"));
    }
    if let Some(cookies) = &request.strategy.bundle.cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    args.push("--output".to_string());
    args.push(request.output_template.to_string_lossy().into_owned());
    args.push("--".to_string());
    args.push(request.source_url.clone());
    args
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        let program = self.program_name();
        let log_path = request.log_path();
        let stderr = File::create(&log_path)
            .map(Stdio::from)
            .unwrap_or_else(|_| Stdio::null());

        debug!(
            id = %request.content_id,
            bundle = %request.strategy.bundle.name,
            "launching {program}"
        );
        let child = Command::new(&self.program)
            .args(ytdlp_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|source| FetchError::Launch {
                program: program.clone(),
                source,
            })?;

        let status = wait_with_timeout(child, request.timeout).map_err(|err| match err {
            WaitError::TimedOut => FetchError::TimedOut {
                program: program.clone(),
                timeout: request.timeout,
            },
            WaitError::Io(source) => FetchError::Launch {
                program: program.clone(),
                source,
            },
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(FetchError::Exit {
                program,
                status,
                detail: last_log_line(&log_path),
            })
        }
    }
}

enum WaitError {
    TimedOut,
    Io(std::io::Error),
}

/// Polls the child until it exits; kills and reaps it once `timeout` passes.
fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<ExitStatus, WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                error!("fetch process timed out after {}s, killing", timeout.as_secs());
                let _ = child.kill();
                let _ = child.wait();
                return Err(WaitError::TimedOut);
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(err) => return Err(WaitError::Io(err)),
        }
    }
}

fn last_log_line(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| {
            raw.lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "no output".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ClientIdentity, CredentialBundle};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn strategy(cookies: Option<&str>) -> FetchStrategy {
        FetchStrategy {
            bundle: match cookies {
                Some(path) => CredentialBundle::cookie_file(path),
                None => CredentialBundle::none(),
            },
            identity: ClientIdentity {
                user_agent: "UnitTest/1.0".into(),
                player_client: Some("android".into()),
            },
        }
    }

    fn request(staging: &Path, cookies: Option<&str>, timeout: Duration) -> FetchRequest {
        FetchRequest::new(
            ContentId::parse("dQw4w9WgXcQ").unwrap(),
            staging,
            strategy(cookies),
            4,
            timeout,
        )
    }

    /// Fake yt-dlp: records its argv, writes `STUB_BYTES` bytes to the output
    /// template with an m4a extension, and exits with `STUB_EXIT`.
    fn install_ytdlp_stub(dir: &Path, body: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
printf '%s\n' "$@" > "{argv}"
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done
target="${{output//%(ext)s/m4a}}"
{body}
"#,
            argv = dir.join("argv.txt").display(),
        );
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[test]
    fn request_builds_template_inside_staging() {
        let req = request(Path::new("/dl/.staging/dQw4w9WgXcQ"), None, Duration::from_secs(1));
        assert_eq!(
            req.output_template,
            PathBuf::from("/dl/.staging/dQw4w9WgXcQ/dQw4w9WgXcQ.%(ext)s")
        );
        assert_eq!(
            req.output_path("opus"),
            PathBuf::from("/dl/.staging/dQw4w9WgXcQ/dQw4w9WgXcQ.opus")
        );
        assert_eq!(req.source_url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn args_include_identity_cookies_and_trailing_url() {
        let req = request(Path::new("/stage"), Some("/cookies/main.txt"), Duration::from_secs(1));
        let args = ytdlp_args(&req);

        let pos = |flag: &str| args.iter().position(|arg| arg == flag).unwrap();
        assert_eq!(args[pos("--user-agent") + 1], "UnitTest/1.0");
        assert_eq!(args[pos("--cookies") + 1], "/cookies/main.txt");
        assert_eq!(args[pos("--retries") + 1], "4");
        assert_eq!(args[pos("--extractor-args") + 1], "youtube:player_client=android");
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args.last().unwrap(), &req.source_url);
    }

    #[test]
    fn args_omit_cookies_for_anonymous_bundle() {
        let req = request(Path::new("/stage"), None, Duration::from_secs(1));
        assert!(!ytdlp_args(&req).iter().any(|arg| arg == "--cookies"));
    }

    #[test]
    fn ytdlp_fetcher_runs_stub_and_writes_output() {
        let temp = tempdir().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let stub = install_ytdlp_stub(
            temp.path(),
            r#"head -c 2048 /dev/zero > "$target"
exit 0"#,
        );

        let req = request(&staging, Some("/cookies/a.txt"), Duration::from_secs(10));
        YtDlpFetcher::new(&stub).fetch(&req).unwrap();

        assert_eq!(fs::metadata(req.output_path("m4a")).unwrap().len(), 2048);
        let argv = fs::read_to_string(temp.path().join("argv.txt")).unwrap();
        assert!(argv.contains("--cookies\n/cookies/a.txt"));
    }

    #[test]
    fn ytdlp_fetcher_reports_exit_status_with_log_detail() {
        let temp = tempdir().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let stub = install_ytdlp_stub(
            temp.path(),
            r#"echo "ERROR: Sign in to confirm you're not a bot" >&2
exit 1"#,
        );

        let req = request(&staging, None, Duration::from_secs(10));
        let err = YtDlpFetcher::new(&stub).fetch(&req).unwrap_err();
        match err {
            FetchError::Exit { detail, .. } => assert!(detail.contains("not a bot")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ytdlp_fetcher_kills_slow_process() {
        let temp = tempdir().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let stub = install_ytdlp_stub(temp.path(), "sleep 5");

        let req = request(&staging, None, Duration::from_millis(300));
        let err = YtDlpFetcher::new(&stub).fetch(&req).unwrap_err();
        assert!(matches!(err, FetchError::TimedOut { .. }));
    }

    #[test]
    fn ytdlp_fetcher_reports_missing_binary() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), None, Duration::from_secs(1));
        let err = YtDlpFetcher::new(temp.path().join("missing-yt-dlp"))
            .fetch(&req)
            .unwrap_err();
        assert!(matches!(err, FetchError::Launch { .. }));
    }
}
