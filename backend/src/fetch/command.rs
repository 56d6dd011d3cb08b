//! External transfer program backend (wget, curl or a custom command)

use super::{discard, prepare, publish, timed_out, Fetcher, Progress, PROGRESS_INTERVAL};
use crate::error::{FetchErrorKind, FetchFailure};
use crate::storage::StorageDir;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};

/// Placeholder replaced by the source URL
pub const URL_ARG: &str = "{url}";

/// Placeholder replaced by the output path
pub const OUTPUT_ARG: &str = "{output}";

/// How a program's exit status maps onto failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCodes {
    Wget,
    Curl,
    /// Any non-zero status is a process error
    Generic,
}

impl ExitCodes {
    fn classify(&self, code: i32) -> (FetchErrorKind, &'static str) {
        use FetchErrorKind::*;

        match (self, code) {
            (Self::Wget, 3) => (WriteFailed, "file I/O error"),
            (Self::Wget, 4) => (ConnectFailed, "network failure"),
            (Self::Wget, 5) => (ConnectFailed, "TLS verification failure"),
            (Self::Wget, 6) => (ProcessError, "authentication failure"),
            (Self::Wget, 7) => (ProcessError, "protocol error"),
            (Self::Wget, 8) => (ProcessError, "server issued an error response"),

            (Self::Curl, 1) => (InvalidUrl, "unsupported protocol"),
            (Self::Curl, 3) => (InvalidUrl, "malformed url"),
            (Self::Curl, 5) | (Self::Curl, 6) => (ConnectFailed, "could not resolve host"),
            (Self::Curl, 7) => (ConnectFailed, "failed to connect"),
            (Self::Curl, 35) => (ConnectFailed, "TLS handshake failed"),
            (Self::Curl, 22) => (ProcessError, "server issued an error response"),
            (Self::Curl, 23) => (WriteFailed, "write error"),
            (Self::Curl, 28) => (Timeout, "operation timed out"),

            _ => (ProcessError, "transfer failed"),
        }
    }
}

/// Runs an external program per transfer.
///
/// Arguments are passed as a vector; `{url}` and `{output}` are substituted
/// only when they make up a whole argument. Nothing is interpreted by a shell.
pub struct CommandFetcher {
    program: PathBuf,
    args: Vec<String>,
    exit_codes: ExitCodes,
    storage: StorageDir,
}

impl CommandFetcher {
    pub fn new(program: PathBuf, args: Vec<String>, exit_codes: ExitCodes, storage: StorageDir) -> Self {
        Self {
            program,
            args,
            exit_codes,
            storage,
        }
    }

    pub fn wget(program: PathBuf, user_agent: &str, storage: StorageDir) -> Self {
        let args = [
            "--quiet",
            "--tries=1",
            "--user-agent",
            user_agent,
            "--output-document",
            OUTPUT_ARG,
            "--",
            URL_ARG,
        ];
        Self::new(program, to_strings(&args), ExitCodes::Wget, storage)
    }

    pub fn curl(program: PathBuf, user_agent: &str, storage: StorageDir) -> Self {
        let args = [
            "--silent",
            "--show-error",
            "--fail",
            "--location",
            "--user-agent",
            user_agent,
            "--output",
            OUTPUT_ARG,
            "--url",
            URL_ARG,
        ];
        Self::new(program, to_strings(&args), ExitCodes::Curl, storage)
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    fn command_args(&self, source_url: &str, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                URL_ARG => OsString::from(source_url),
                OUTPUT_ARG => output.as_os_str().to_owned(),
                other => OsString::from(other),
            })
            .collect()
    }

    fn exit_failure(&self, code: Option<i32>) -> FetchFailure {
        let program = self.program_name();
        match code {
            Some(code) => {
                let (kind, description) = self.exit_codes.classify(code);
                FetchFailure::new(
                    kind,
                    format!("{} exited with status {} ({})", program, code, description),
                )
            }
            None => FetchFailure::new(
                FetchErrorKind::ProcessError,
                format!("{} was terminated by a signal", program),
            ),
        }
    }
}

fn to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Forward the program's stderr to debug logs
async fn log_stderr(stderr: ChildStderr, program: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{}: {}", program, line);
    }
}

/// Wait for the program, reporting the partial file's size as it grows
async fn wait_reporting(
    child: &mut Child,
    partial: &Path,
    progress: &dyn Progress,
) -> std::io::Result<ExitStatus> {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut reported = 0;

    loop {
        tokio::select! {
            status = child.wait() => return status,
            _ = ticker.tick() => {
                // The program may not have created the file yet
                if let Ok(metadata) = tokio::fs::metadata(partial).await {
                    if metadata.len() != reported {
                        reported = metadata.len();
                        progress.report(reported, None);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Path,
        timeout: Duration,
        progress: &dyn Progress,
    ) -> Result<u64, FetchFailure> {
        let partial = prepare(&self.storage, destination).await?;
        let program = self.program_name();

        let mut child = Command::new(&self.program)
            .args(self.command_args(source_url, &partial))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FetchFailure::new(
                    FetchErrorKind::ProcessError,
                    format!("failed to start {}: {}", program, e),
                )
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, program.clone()));
        }

        let waited = wait_reporting(&mut child, &partial, progress);
        let status = match tokio::time::timeout(timeout, waited).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                discard(&partial).await;
                return Err(FetchFailure::new(
                    FetchErrorKind::ProcessError,
                    format!("failed to wait for {}: {}", program, e),
                ));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out {}: {}", program, e);
                }
                discard(&partial).await;
                return Err(timed_out(timeout));
            }
        };

        if !status.success() {
            discard(&partial).await;
            return Err(self.exit_failure(status.code()));
        }

        match publish(&partial, destination).await {
            Ok(bytes) => Ok(bytes),
            Err(failure) => {
                discard(&partial).await;
                Err(failure)
            }
        }
    }

    fn name(&self) -> &'static str {
        match self.exit_codes {
            ExitCodes::Wget => "wget",
            ExitCodes::Curl => "curl",
            ExitCodes::Generic => "command",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ProgressLog;

    fn storage() -> (StorageDir, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path()).unwrap();
        (storage, dir)
    }

    fn shell(script: &str, storage: &StorageDir) -> CommandFetcher {
        // `sh -c script sh <output> <url>`: both values arrive as positional
        // parameters, never as part of the script text
        CommandFetcher::new(
            PathBuf::from("sh"),
            to_strings(&["-c", script, "sh", OUTPUT_ARG, URL_ARG]),
            ExitCodes::Generic,
            storage.clone(),
        )
    }

    #[test]
    fn placeholders_are_whole_arguments_only() {
        let (storage, _dir) = storage();
        let fetcher = CommandFetcher::wget(PathBuf::from("wget"), "agent/1.0", storage.clone());
        let output = storage.partial_path("a.zip").unwrap();

        let args = fetcher.command_args("http://example.com/a.zip;rm -rf ~", &output);
        assert_eq!(args.last().unwrap(), "http://example.com/a.zip;rm -rf ~");
        assert!(args.contains(&output.as_os_str().to_owned()));
        assert!(args.contains(&OsString::from("agent/1.0")));

        let custom = CommandFetcher::new(
            PathBuf::from("fetch"),
            to_strings(&["--to={output}", OUTPUT_ARG]),
            ExitCodes::Generic,
            storage,
        );
        let args = custom.command_args("http://x/y", &output);
        assert_eq!(args[0], "--to={output}");
        assert_eq!(args[1], output.as_os_str());
    }

    #[test]
    fn exit_codes_map_to_kinds() {
        let (storage, _dir) = storage();
        let wget = CommandFetcher::wget(PathBuf::from("/usr/bin/wget"), "ua", storage.clone());
        assert_eq!(wget.exit_failure(Some(4)).kind, FetchErrorKind::ConnectFailed);
        assert_eq!(wget.exit_failure(Some(3)).kind, FetchErrorKind::WriteFailed);
        assert_eq!(wget.exit_failure(Some(8)).kind, FetchErrorKind::ProcessError);
        assert!(wget
            .exit_failure(Some(8))
            .message
            .starts_with("wget exited with status 8"));

        let curl = CommandFetcher::curl(PathBuf::from("curl"), "ua", storage);
        assert_eq!(curl.exit_failure(Some(28)).kind, FetchErrorKind::Timeout);
        assert_eq!(curl.exit_failure(Some(3)).kind, FetchErrorKind::InvalidUrl);
        assert_eq!(curl.exit_failure(Some(7)).kind, FetchErrorKind::ConnectFailed);
        assert_eq!(curl.exit_failure(None).kind, FetchErrorKind::ProcessError);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_program_publishes_file() {
        let (storage, _dir) = storage();
        let fetcher = shell("printf '%s' \"$2\" > \"$1\"", &storage);
        let destination = storage.absolute_path("page.html").unwrap();

        let url = "http://example.com/page.html?a=1&b=$(id)";
        let bytes = fetcher
            .fetch(url, &destination, Duration::from_secs(10), &ProgressLog::default())
            .await
            .unwrap();

        assert_eq!(bytes, url.len() as u64);
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), url);
        assert!(!storage.partial_path("page.html").unwrap().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn partial_file_growth_is_reported() {
        let (storage, _dir) = storage();
        let fetcher = shell("printf abc > \"$1\"; sleep 0.5; printf defgh >> \"$1\"", &storage);
        let destination = storage.absolute_path("grow.bin").unwrap();
        let progress = ProgressLog::default();

        let bytes = fetcher
            .fetch(
                "http://example.com/grow.bin",
                &destination,
                Duration::from_secs(10),
                &progress,
            )
            .await
            .unwrap();

        assert_eq!(bytes, 8);
        let reports = progress.reports();
        assert!(reports.contains(&(3, None)), "{:?}", reports);
        assert!(reports.iter().all(|(n, _)| *n <= 8));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_leaves_nothing() {
        let (storage, _dir) = storage();
        let fetcher = shell("printf partial > \"$1\"; exit 4", &storage);
        let destination = storage.absolute_path("data.zip").unwrap();

        let err = fetcher
            .fetch(
                "http://example.com/data.zip",
                &destination,
                Duration::from_secs(10),
                &ProgressLog::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::ProcessError);
        assert!(err.message.contains("status 4"));
        assert!(!destination.exists());
        assert!(storage.list().await.unwrap().is_empty());
        assert!(!storage.partial_path("data.zip").unwrap().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_program_and_removes_partial() {
        let (storage, _dir) = storage();
        let fetcher = shell("printf partial > \"$1\"; exec sleep 30", &storage);
        let destination = storage.absolute_path("slow.iso").unwrap();

        let started = std::time::Instant::now();
        let err = fetcher
            .fetch(
                "http://example.com/slow.iso",
                &destination,
                Duration::from_millis(300),
                &ProgressLog::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!destination.exists());
        assert!(!storage.partial_path("slow.iso").unwrap().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_without_output_is_write_failure() {
        let (storage, _dir) = storage();
        let fetcher = shell("exit 0", &storage);
        let destination = storage.absolute_path("ghost.bin").unwrap();

        let err = fetcher
            .fetch(
                "http://example.com/ghost.bin",
                &destination,
                Duration::from_secs(10),
                &ProgressLog::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::WriteFailed);
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn missing_program_is_process_error() {
        let (storage, _dir) = storage();
        let fetcher = CommandFetcher::new(
            PathBuf::from("/nonexistent/fetch-depot-transfer"),
            to_strings(&[OUTPUT_ARG, URL_ARG]),
            ExitCodes::Generic,
            storage.clone(),
        );
        let destination = storage.absolute_path("x.bin").unwrap();

        let err = fetcher
            .fetch(
                "http://example.com/x.bin",
                &destination,
                Duration::from_secs(5),
                &ProgressLog::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::ProcessError);
    }

    #[tokio::test]
    async fn refuses_destination_outside_storage() {
        let (storage, dir) = storage();
        let fetcher = CommandFetcher::new(
            PathBuf::from("/nonexistent/never-run"),
            Vec::new(),
            ExitCodes::Generic,
            storage,
        );
        let outside = dir.path().parent().unwrap().join("escape.bin");

        let err = fetcher
            .fetch(
                "http://example.com/escape.bin",
                &outside,
                Duration::from_secs(5),
                &ProgressLog::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::InvalidTarget);
    }
}
