//! Media fetch using yt-dlp.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vdq_models::{DownloadProgress, DownloadStatus};

use crate::error::{MediaError, MediaResult};
use crate::extract::{remove_staging, Extracted, Extractor};

/// Prefixes of the machine-readable lines yt-dlp is asked to print.
const PROGRESS_PREFIX: &str = "vdq-progress ";
const PATH_PREFIX: &str = "vdq-path ";
const TITLE_PREFIX: &str = "vdq-title ";

/// Title used when the source reports none.
const UNKNOWN_TITLE: &str = "unknown";

/// Lines of stderr kept for the failure message.
const STDERR_TAIL: usize = 20;

/// yt-dlp adapter configuration.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Program to run
    pub binary: String,
    /// Arguments placed before the generated ones
    pub extra_args: Vec<String>,
    /// Parent of the per-fetch staging directories
    pub work_dir: PathBuf,
    /// Format selector
    pub format: String,
    /// Upper bound on one fetch
    pub timeout: Option<Duration>,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            extra_args: Vec::new(),
            work_dir: std::env::temp_dir().join("vdq"),
            format: "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
            timeout: None,
        }
    }
}

impl YtDlpConfig {
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

/// Extractor running yt-dlp as a subprocess.
pub struct YtDlpExtractor {
    config: YtDlpConfig,
}

impl YtDlpExtractor {
    pub fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &YtDlpConfig {
        &self.config
    }

    fn build_args(&self, key: &str, staging_dir: &Path) -> Vec<String> {
        let template = staging_dir.join("%(id)s.%(ext)s");

        let mut args = self.config.extra_args.clone();
        args.extend(
            [
                "--newline",
                "--no-playlist",
                "--progress",
                "--progress-template",
                "download:vdq-progress %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.status)s",
                "--print",
                "after_move:vdq-path %(filepath)s",
                "--print",
                "after_move:vdq-title %(title)s",
                "--merge-output-format",
                "mp4",
                "-f",
            ]
            .into_iter()
            .map(String::from),
        );
        args.push(self.config.format.clone());
        args.push("-o".to_string());
        args.push(template.to_string_lossy().to_string());
        args.push("--".to_string());
        args.push(key.to_string());
        args
    }

    async fn run(
        &self,
        key: &str,
        staging_dir: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> MediaResult<Extracted> {
        let args = self.build_args(key, staging_dir);
        debug!("Running {} {}", self.config.binary, args.join(" "));

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("stderr not captured"))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(stdout, Source::Stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, Source::Stderr, tx));

        let mut output = ProcessOutput::default();
        while let Some((source, line)) = rx.recv().await {
            if let Some(progress) = output.consume(source, &line) {
                on_progress(progress);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let reason = output.last_error().unwrap_or("Unknown error");
            return Err(MediaError::download_failed(format!(
                "yt-dlp failed: {}",
                reason
            )));
        }

        let local_path = match output.path {
            Some(path) => path,
            None => largest_file(staging_dir)
                .await?
                .ok_or_else(|| MediaError::download_failed("Output file not created"))?,
        };

        let size = match tokio::fs::metadata(&local_path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MediaError::FileNotFound(local_path));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Extracted {
            local_path,
            staging_dir: staging_dir.to_path_buf(),
            title: output.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            size,
        })
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn fetch(
        &self,
        key: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> MediaResult<Extracted> {
        which::which(&self.config.binary).map_err(|_| MediaError::YtDlpNotFound)?;

        let staging_dir = self.config.work_dir.join(staging_id());
        tokio::fs::create_dir_all(&staging_dir).await?;

        info!(staging = %staging_dir.display(), "Fetching {}", key);

        let result = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(key, &staging_dir, on_progress))
                .await
                .unwrap_or_else(|_| {
                    warn!("yt-dlp timed out after {:?}, killing process", limit);
                    Err(MediaError::Timeout(limit.as_secs()))
                }),
            None => self.run(key, &staging_dir, on_progress).await,
        };

        match &result {
            Ok(extracted) => info!(
                output = %extracted.local_path.display(),
                size_mb = extracted.size as f64 / (1024.0 * 1024.0),
                "Fetched media successfully"
            ),
            Err(_) => remove_staging(&staging_dir).await,
        }

        result
    }
}

/// Short random name for a staging directory.
fn staging_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stdout,
    Stderr,
}

async fn forward_lines<R>(reader: R, source: Source, tx: mpsc::UnboundedSender<(Source, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((source, line)).is_err() {
            break;
        }
    }
}

/// State collected from the process output.
#[derive(Debug, Default)]
struct ProcessOutput {
    path: Option<PathBuf>,
    title: Option<String>,
    stderr_tail: Vec<String>,
}

impl ProcessOutput {
    fn consume(&mut self, source: Source, line: &str) -> Option<DownloadProgress> {
        let line = line.trim_end();

        if let Some(progress) = parse_progress_line(line) {
            return Some(progress);
        }
        if let Some(path) = line.strip_prefix(PATH_PREFIX) {
            self.path = Some(PathBuf::from(path.trim()));
            return None;
        }
        if let Some(title) = line.strip_prefix(TITLE_PREFIX) {
            let title = title.trim();
            if !title.is_empty() && title != "NA" {
                self.title = Some(title.to_string());
            }
            return None;
        }

        if source == Source::Stderr && !line.trim().is_empty() {
            if self.stderr_tail.len() == STDERR_TAIL {
                self.stderr_tail.remove(0);
            }
            self.stderr_tail.push(line.to_string());
        }
        None
    }

    fn last_error(&self) -> Option<&str> {
        self.stderr_tail
            .iter()
            .rev()
            .find(|l| l.contains("ERROR"))
            .or_else(|| self.stderr_tail.last())
            .map(String::as_str)
    }
}

/// Parse one `vdq-progress <downloaded> <total> <estimate> <status>` line.
fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let [downloaded, total, estimate, status] = fields.as_slice() else {
        return None;
    };

    let status = match *status {
        "downloading" => DownloadStatus::Downloading,
        "finished" => DownloadStatus::Finished,
        _ => return None,
    };

    Some(DownloadProgress {
        downloaded: parse_bytes(downloaded).unwrap_or(0),
        total: parse_bytes(total).or_else(|| parse_bytes(estimate)),
        status,
    })
}

/// Byte count as printed by yt-dlp; `NA` means unknown.
fn parse_bytes(value: &str) -> Option<u64> {
    let bytes: f64 = value.parse().ok()?;
    (bytes.is_finite() && bytes >= 0.0).then_some(bytes as u64)
}

/// Largest regular file directly inside `dir`.
async fn largest_file(dir: &Path) -> MediaResult<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut best: Option<(u64, PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        if best.as_ref().map_or(true, |(size, _)| metadata.len() > *size) {
            best = Some((metadata.len(), entry.path()));
        }
    }

    Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_progress_known_total() {
        assert_eq!(
            parse_progress_line("vdq-progress 512 2048 NA downloading"),
            Some(DownloadProgress::downloading(512, Some(2048)))
        );
    }

    #[test]
    fn test_parse_progress_falls_back_to_estimate() {
        assert_eq!(
            parse_progress_line("vdq-progress 512 NA 4096.5 downloading"),
            Some(DownloadProgress::downloading(512, Some(4096)))
        );
    }

    #[test]
    fn test_parse_progress_unknown_total() {
        assert_eq!(
            parse_progress_line("vdq-progress 512 NA NA downloading"),
            Some(DownloadProgress::downloading(512, None))
        );
    }

    #[test]
    fn test_parse_progress_finished() {
        let progress = parse_progress_line("vdq-progress 2048 2048 NA finished").unwrap();
        assert_eq!(progress.status, DownloadStatus::Finished);
    }

    #[test]
    fn test_parse_progress_ignores_other_lines() {
        assert_eq!(parse_progress_line("[youtube] abc: Downloading webpage"), None);
        assert_eq!(parse_progress_line("vdq-progress 1 2 NA error"), None);
        assert_eq!(parse_progress_line("vdq-progress 1 2"), None);
    }

    #[test]
    fn test_output_markers_and_stderr_tail() {
        let mut output = ProcessOutput::default();
        output.consume(Source::Stdout, "vdq-path /tmp/x/abc.mp4");
        output.consume(Source::Stdout, "vdq-title NA");
        output.consume(Source::Stderr, "WARNING: something odd");
        output.consume(Source::Stderr, "ERROR: Video unavailable");
        output.consume(Source::Stderr, "");

        assert_eq!(output.path, Some(PathBuf::from("/tmp/x/abc.mp4")));
        assert_eq!(output.title, None);
        assert_eq!(output.last_error(), Some("ERROR: Video unavailable"));
    }

    #[test]
    fn test_build_args_ends_with_key() {
        let extractor = YtDlpExtractor::new(YtDlpConfig::default());
        let args = extractor.build_args("https://x/a", Path::new("/work/abcd1234"));

        assert_eq!(args.last().map(String::as_str), Some("https://x/a"));
        assert!(args.contains(&"/work/abcd1234/%(id)s.%(ext)s".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
    }

    #[test]
    fn test_staging_id_length() {
        assert_eq!(staging_id().len(), 8);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let work = tempfile::tempdir().unwrap();
        let extractor = YtDlpExtractor::new(YtDlpConfig {
            binary: "vdq-no-such-binary".to_string(),
            ..YtDlpConfig::default().with_work_dir(work.path())
        });

        let result = extractor.fetch("https://x/a", &|_| {}).await;
        assert!(matches!(result, Err(MediaError::YtDlpNotFound)));
    }

    fn fake_ytdlp(dir: &Path, body: &str) -> YtDlpConfig {
        let script = dir.join("fake-yt-dlp.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}", body)).unwrap();

        YtDlpConfig {
            binary: "sh".to_string(),
            extra_args: vec![script.to_string_lossy().to_string()],
            ..YtDlpConfig::default().with_work_dir(dir.join("work"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_with_fake_binary() {
        let root = tempfile::tempdir().unwrap();
        let config = fake_ytdlp(
            root.path(),
            r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
dir=$(dirname "$out")
echo "vdq-progress 512 1024 NA downloading"
head -c 4096 /dev/zero > "$dir/abc.mp4"
echo "vdq-progress 1024 1024 NA finished"
echo "vdq-path $dir/abc.mp4"
echo "vdq-title My Clip"
"#,
        );
        let extractor = YtDlpExtractor::new(config);

        let ticks = Mutex::new(Vec::new());
        let extracted = extractor
            .fetch("https://x/a", &|p| ticks.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(extracted.title, "My Clip");
        assert_eq!(extracted.size, 4096);
        assert_eq!(extracted.extension(), Some("mp4"));
        assert!(extracted.local_path.starts_with(&extracted.staging_dir));
        assert_eq!(
            ticks.into_inner().unwrap(),
            vec![
                DownloadProgress::downloading(512, Some(1024)),
                DownloadProgress {
                    downloaded: 1024,
                    total: Some(1024),
                    status: DownloadStatus::Finished,
                },
            ]
        );

        extracted.cleanup().await;
        assert!(!extracted.staging_dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_fetch_removes_staging() {
        let root = tempfile::tempdir().unwrap();
        let config = fake_ytdlp(
            root.path(),
            r#"
echo "ERROR: [generic] Unsupported URL" >&2
exit 1
"#,
        );
        let work_dir = config.work_dir.clone();
        let extractor = YtDlpExtractor::new(config);

        let result = extractor.fetch("https://x/a", &|_| {}).await;

        match result {
            Err(MediaError::DownloadFailed { message }) => {
                assert!(message.contains("Unsupported URL"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        let leftovers = std::fs::read_dir(&work_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_path_fallback_to_largest_file() {
        let root = tempfile::tempdir().unwrap();
        let config = fake_ytdlp(
            root.path(),
            r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
dir=$(dirname "$out")
head -c 10 /dev/zero > "$dir/small.txt"
head -c 2000 /dev/zero > "$dir/video.webm"
"#,
        );
        let extractor = YtDlpExtractor::new(config);

        let extracted = tokio_test::assert_ok!(extractor.fetch("https://x/a", &|_| {}).await);

        assert_eq!(extracted.extension(), Some("webm"));
        assert_eq!(extracted.size, 2000);
        assert_eq!(extracted.title, "unknown");
        extracted.cleanup().await;
    }
}
