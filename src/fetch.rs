use regex::Regex;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const ENDPOINT_PATH: &str = "/pixord/model/aidataexport_3dago.php";
const MAX_ATTEMPTS: usize = 2;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Retrieves one archive for one device address. Implementations must be
/// callable concurrently; transport choice (direct HTTP vs. anything else)
/// stays behind this seam.
pub trait Fetcher: Send + Sync {
    /// Returns the downloaded archive path, or `None` when the device
    /// contributes no data this run.
    fn fetch(&self, address: &str) -> Option<PathBuf>;
}

pub fn archive_name(address: &str, run_date_str: &str) -> String {
    format!("aidata_{}_{}.tar.gz", address.replace('.', "_"), run_date_str)
}

static ARCHIVE_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Parses `aidata_<addr dots as underscores>_<YYYYMMDD>.tar.gz` back into
/// (address, run date). Anything else is unprocessable.
pub fn parse_archive_name(filename: &str) -> Option<(String, String)> {
    let re = ARCHIVE_NAME_RE.get_or_init(|| Regex::new(r"^aidata_(.+)_(\d{8})\.tar\.gz$").unwrap());
    let caps = re.captures(filename)?;
    Some((caps[1].replace('_', "."), caps[2].to_string()))
}

/// Transport-level failure; retried up to the attempt limit. `Body` is a
/// connection lost while streaming the response (reset, truncation, body
/// timeout), which the blocking reader surfaces as an `io::Error`.
#[derive(Debug)]
enum TransportError {
    Http(reqwest::Error),
    Body(std::io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Http(e) => write!(f, "{}", e),
            TransportError::Body(e) => write!(f, "connection lost mid-download: {}", e),
        }
    }
}

enum StreamFault {
    Transport(std::io::Error),
    Local(std::io::Error),
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    username: String,
    password: String,
    download_dir: PathBuf,
    run_date_str: String,
    retry_delay: Duration,
    progress: bool,
    scheme: &'static str,
}

impl HttpFetcher {
    pub fn new(
        username: &str,
        password: &str,
        download_dir: &Path,
        run_date_str: &str,
        retry_delay: Duration,
        progress: bool,
    ) -> anyhow::Result<HttpFetcher> {
        // Devices present self-signed certificates.
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpFetcher {
            client,
            username: username.to_string(),
            password: password.to_string(),
            download_dir: download_dir.to_path_buf(),
            run_date_str: run_date_str.to_string(),
            retry_delay,
            progress,
            scheme: "https",
        })
    }

    #[cfg(test)]
    fn over_plain_http(mut self) -> HttpFetcher {
        self.scheme = "http";
        self
    }

    /// One download attempt. `Err` is a transport failure and retryable;
    /// `Ok(None)` is a local fault (disk, rename) that already cleaned up the
    /// temp file and must not be retried.
    fn attempt(&self, address: &str, temp_path: &Path) -> Result<Option<PathBuf>, TransportError> {
        if temp_path.exists() { let _ = std::fs::remove_file(temp_path); }
        let url = format!("{}://{}{}", self.scheme, address, ENDPOINT_PATH);
        let mut resp = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(TransportError::Http)?;
        let pb = if self.progress {
            let pb = indicatif::ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(100));
            pb.set_message(format!("[{}] downloading", address));
            Some(pb)
        } else { None };
        let copied = stream_to_file(&mut resp, temp_path);
        if let Some(pb) = pb { pb.finish_and_clear(); }
        let bytes = match copied {
            Ok(n) => n,
            Err(StreamFault::Transport(e)) => {
                let _ = std::fs::remove_file(temp_path);
                return Err(TransportError::Body(e));
            }
            Err(StreamFault::Local(e)) => {
                log::error!("[{}] Unexpected error while saving download: {}", address, e);
                let _ = std::fs::remove_file(temp_path);
                return Ok(None);
            }
        };
        let dst = self.download_dir.join(archive_name(address, &self.run_date_str));
        if dst.exists() { let _ = std::fs::remove_file(&dst); }
        if let Err(e) = std::fs::rename(temp_path, &dst) {
            log::error!("[{}] Failed to move download into place: {}", address, e);
            let _ = std::fs::remove_file(temp_path);
            return Ok(None);
        }
        log::info!("[{}] Download complete ({} bytes): {}", address, bytes, dst.display());
        Ok(Some(dst))
    }
}

/// Streams the response body to `temp_path` in 8 KiB chunks. Read errors
/// come from the network and are tagged `Transport`; create/write errors are
/// local disk faults.
fn stream_to_file(resp: &mut reqwest::blocking::Response, temp_path: &Path) -> Result<u64, StreamFault> {
    let mut f = std::fs::File::create(temp_path).map_err(StreamFault::Local)?;
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = resp.read(&mut buf).map_err(StreamFault::Transport)?;
        if n == 0 { break; }
        f.write_all(&buf[..n]).map_err(StreamFault::Local)?;
        total += n as u64;
    }
    Ok(total)
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, address: &str) -> Option<PathBuf> {
        let temp_path = self.download_dir.join(format!("aidata_{}_temp.tar.gz", address));
        for attempt in 1..=MAX_ATTEMPTS {
            log::info!("[{}] Starting download (attempt {})...", address, attempt);
            match self.attempt(address, &temp_path) {
                Ok(result) => return result,
                Err(e) => {
                    log::warn!("[{}] Download attempt {} failed: {}", address, attempt, e);
                    if attempt < MAX_ATTEMPTS {
                        log::info!("[{}] Retrying in {:?}...", address, self.retry_delay);
                        std::thread::sleep(self.retry_delay);
                    } else {
                        log::error!("[{}] All download attempts failed; skipping this address.", address);
                    }
                }
            }
        }
        None
    }
}
