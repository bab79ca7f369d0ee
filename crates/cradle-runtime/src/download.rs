use crate::RuntimeError;
use cradle_store::{CancelToken, Phase, ProgressEvent, ProgressSink};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

/// Fetches a release archive, possibly split into several parts, into a
/// single local file.
pub trait Downloader: Send + Sync {
    /// Download every part in order and concatenate them into `dest`.
    /// Returns the total number of bytes written.
    fn download(
        &self,
        urls: &[String],
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<u64, RuntimeError>;
}

/// Streams over HTTP(S) with `ureq`. `file://` URLs are read from disk.
pub struct HttpDownloader {
    agent: ureq::Agent,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn open(&self, url: &str) -> Result<(Box<dyn Read>, Option<u64>), RuntimeError> {
        if let Some(path) = url.strip_prefix("file://") {
            let file = File::open(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::NotFound(url.to_owned())
                } else {
                    RuntimeError::Io(e)
                }
            })?;
            let len = file.metadata().ok().map(|m| m.len());
            return Ok((Box::new(file), len));
        }

        let resp = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RuntimeError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RuntimeError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(RuntimeError::Http(e.to_string())),
        };
        let len = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        Ok((Box::new(resp.into_body().into_reader()), len))
    }
}

impl Downloader for HttpDownloader {
    fn download(
        &self,
        urls: &[String],
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<u64, RuntimeError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(dest)?);
        let mut written = 0u64;
        let parts = urls.len();

        for (index, url) in urls.iter().enumerate() {
            cancel.check()?;
            debug!("GET {url}");
            let (mut reader, len) = self.open(url)?;
            let mut part_bytes = 0u64;
            let mut meter = PartMeter::new(index, parts, len);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                cancel.check()?;
                let n = reader.read(&mut buf).map_err(|e| {
                    RuntimeError::Http(format!("reading {url}: {e}"))
                })?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                part_bytes += n as u64;
                if let Some(event) = meter.advance(part_bytes) {
                    progress.emit(event);
                }
            }
            if let Some(event) = meter.finish(part_bytes) {
                progress.emit(event);
            }
            written += part_bytes;
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(written)
    }
}

/// Download progress for one part of a release. Each part is an equal
/// share of the overall percentage, so the bar never moves backwards
/// between parts. Events are emitted only when the overall percentage
/// changes, or per MiB when the part length is unknown.
struct PartMeter {
    index: usize,
    parts: usize,
    len: Option<u64>,
    last_mark: Option<u64>,
    emitted_bytes: u64,
}

impl PartMeter {
    fn new(index: usize, parts: usize, len: Option<u64>) -> Self {
        Self {
            index,
            parts: parts.max(1),
            len: len.filter(|&l| l > 0),
            last_mark: None,
            emitted_bytes: 0,
        }
    }

    fn percent(&self, bytes: u64) -> Option<i32> {
        let total = self.len?;
        let part_pct = (bytes.saturating_mul(100) / total).min(100);
        Some(((self.index as u64 * 100 + part_pct) / self.parts as u64) as i32)
    }

    fn advance(&mut self, bytes: u64) -> Option<ProgressEvent> {
        let mark = match self.percent(bytes) {
            Some(pct) => pct as u64,
            None => bytes >> 20,
        };
        if self.last_mark == Some(mark) {
            return None;
        }
        self.last_mark = Some(mark);
        Some(self.event(bytes))
    }

    /// The closing event of a part, unless the last one already covered it.
    fn finish(&mut self, bytes: u64) -> Option<ProgressEvent> {
        if self.last_mark.is_some() && self.emitted_bytes == bytes {
            return None;
        }
        self.last_mark = Some(u64::MAX);
        Some(self.event(bytes))
    }

    fn event(&mut self, bytes: u64) -> ProgressEvent {
        self.emitted_bytes = bytes;
        let label = if self.parts > 1 {
            format!("part {}/{}: ", self.index + 1, self.parts)
        } else {
            String::new()
        };
        match (self.percent(bytes), self.len) {
            (Some(pct), Some(total)) => ProgressEvent::new(
                Phase::Download,
                pct,
                format!("{label}{} / {} MiB", bytes >> 20, total >> 20),
            ),
            _ => ProgressEvent::indeterminate(
                Phase::Download,
                format!("{label}{} MiB", bytes >> 20),
            ),
        }
    }
}
