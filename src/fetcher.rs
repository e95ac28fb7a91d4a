use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::RoostError;

/// Receives download completion as a percentage in `0..=100`.
pub type ProgressFn<'a> = &'a (dyn Fn(i32) + Send + Sync);

/// Moves bytes from a URL to memory or to disk. Single attempt, no retries.
#[async_trait]
pub trait UrlDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, RoostError>;

    /// Stream `url` into `dest` through a `<dest>.part` sibling, renamed
    /// into place only once the body is complete.
    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), RoostError>;
}

/// `<dest>.part`, kept across failed attempts so a later one can resume.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

fn local_path(url: &str) -> Option<&Path> {
    url.strip_prefix("file://").map(Path::new)
}

fn network_err(message: String, e: impl std::error::Error + Send + Sync + 'static) -> RoostError {
    RoostError::Network {
        message,
        source: Some(Box::new(e)),
    }
}

/// Emits a percentage only when it moves.
struct Percent<'a> {
    total: Option<u64>,
    done: u64,
    last: i32,
    report: ProgressFn<'a>,
}

impl<'a> Percent<'a> {
    fn new(total: Option<u64>, done: u64, report: ProgressFn<'a>) -> Self {
        Self {
            total,
            done,
            last: -1,
            report,
        }
    }

    fn advance(&mut self, n: u64) {
        self.done += n;
        if let Some(total) = self.total.filter(|t| *t > 0) {
            let pct = ((self.done.min(total) * 100) / total) as i32;
            self.emit(pct);
        }
    }

    fn finish(&mut self) {
        self.emit(100);
    }

    fn emit(&mut self, pct: i32) {
        if pct != self.last {
            self.last = pct;
            (self.report)(pct);
        }
    }
}

async fn finalize(part: &Path, dest: &Path) -> Result<(), RoostError> {
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        tokio::fs::remove_file(dest)
            .await
            .map_err(|e| RoostError::io(format!("removing {}", dest.display()), e))?;
    }
    tokio::fs::rename(part, dest).await.map_err(|e| {
        RoostError::io(
            format!("renaming {} to {}", part.display(), dest.display()),
            e,
        )
    })
}

// ── HttpDownloader ───────────────────────────────────────

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, RoostError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("roost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| network_err("building HTTP client".into(), e))?;
        Ok(Self { client })
    }

    async fn copy_local(
        &self,
        src: &Path,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), RoostError> {
        let mut input = tokio::fs::File::open(src).await.map_err(|e| RoostError::Network {
            message: format!("failed to open {}", src.display()),
            source: Some(Box::new(e)),
        })?;
        let total = input.metadata().await.ok().map(|m| m.len());

        let part = part_path(dest);
        let mut out = tokio::fs::File::create(&part)
            .await
            .map_err(|e| RoostError::io(format!("creating {}", part.display()), e))?;

        let mut percent = Percent::new(total, 0, progress);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| network_err(format!("reading {}", src.display()), e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .await
                .map_err(|e| RoostError::io(format!("writing {}", part.display()), e))?;
            percent.advance(n as u64);
        }
        out.flush()
            .await
            .map_err(|e| RoostError::io(format!("flushing {}", part.display()), e))?;
        drop(out);

        percent.finish();
        finalize(&part, dest).await
    }
}

struct HeadInfo {
    ranges: bool,
    length: Option<u64>,
}

impl HttpDownloader {
    async fn head(&self, url: &str) -> Result<HeadInfo, RoostError> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| network_err(format!("request to {url} failed"), e))?;
        if !resp.status().is_success() {
            return Err(RoostError::network(format!(
                "HTTP {} from {url}",
                resp.status()
            )));
        }
        let headers = resp.headers();
        let ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(HeadInfo { ranges, length })
    }
}

#[async_trait]
impl UrlDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, RoostError> {
        if let Some(path) = local_path(url) {
            return tokio::fs::read(path)
                .await
                .map_err(|e| network_err(format!("failed to read {url}"), e));
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network_err(format!("request to {url} failed"), e))?;
        if !resp.status().is_success() {
            return Err(RoostError::network(format!(
                "HTTP {} from {url}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| network_err(format!("error reading response body from {url}"), e))?;
        Ok(body.to_vec())
    }

    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), RoostError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RoostError::io(format!("creating {}", parent.display()), e))?;
        }

        if let Some(src) = local_path(url) {
            return self.copy_local(src, dest, progress).await;
        }

        let head = self.head(url).await?;
        let part = part_path(dest);

        let mut have = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        if have > 0 && (!head.ranges || head.length.is_some_and(|len| have > len)) {
            tracing::debug!(path = %part.display(), "discarding partial download");
            let _ = tokio::fs::remove_file(&part).await;
            have = 0;
        }

        if have > 0 && head.length == Some(have) {
            tracing::debug!(url, "partial download already complete");
            Percent::new(head.length, have, progress).finish();
            return finalize(&part, dest).await;
        }

        let mut request = self.client.get(url);
        if have > 0 {
            tracing::info!(url, offset = have, "resuming download");
            request = request.header(RANGE, format!("bytes={have}-"));
        } else {
            tracing::info!(url, "downloading");
        }

        let resp = request
            .send()
            .await
            .map_err(|e| network_err(format!("request to {url} failed"), e))?;
        if !resp.status().is_success() {
            return Err(RoostError::network(format!(
                "HTTP {} from {url}",
                resp.status()
            )));
        }

        // A server may ignore the range and send the full body.
        let resuming = have > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;
        if !resuming {
            have = 0;
        }
        let total = head
            .length
            .or_else(|| resp.content_length().map(|len| len + have));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(&part)
            .await
            .map_err(|e| RoostError::io(format!("opening {}", part.display()), e))?;

        let mut percent = Percent::new(total, have, progress);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| network_err(format!("error reading body of {url}"), e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| RoostError::io(format!("writing {}", part.display()), e))?;
            percent.advance(chunk.len() as u64);
        }
        file.flush()
            .await
            .map_err(|e| RoostError::io(format!("flushing {}", part.display()), e))?;
        drop(file);

        percent.finish();
        finalize(&part, dest).await?;
        tracing::info!(path = %dest.display(), "download complete");
        Ok(())
    }
}
