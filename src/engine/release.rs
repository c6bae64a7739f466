//! Release Channel Client
//!
//! Queries GitHub releases for the latest published version of an
//! application, selects the platform asset by naming convention, and
//! downloads artifacts with streaming hash verification.
//!
//! Network failures are transient by design: metadata queries get a bounded
//! number of attempts with backoff, and every failure surfaces as a typed
//! error the orchestrator can fall through on.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::version::Version;

const CHUNK_SIZE: usize = 8192;

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("Release channel unreachable: {0}")]
    ChannelUnreachable(String),
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Release list entry as returned by the channel.
#[derive(Debug, Clone, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<AssetResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssetResponse {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
    /// `sha256:<hex>` when the channel supplies a content digest
    #[serde(default)]
    digest: Option<String>,
}

/// A published release with a parseable version tag.
#[derive(Debug, Clone)]
pub struct Release {
    pub version: Version,
    pub tag: String,
    pub assets: Vec<ReleaseAsset>,
}

/// A downloadable artifact, immutable once fetched from the channel.
#[derive(Debug, Clone)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
    pub size: Option<u64>,
    /// Expected content hash (lowercase hex), when the channel supplies one
    pub sha256: Option<String>,
}

impl Release {
    /// Select the asset for `expected_name` (`{app}_{platform}.zip`).
    ///
    /// An exact name match wins. When several assets match the platform
    /// pattern instead, the lexicographically first one is chosen.
    pub fn select_asset(&self, expected_name: &str) -> Option<&ReleaseAsset> {
        if let Some(asset) = self.assets.iter().find(|a| a.name == expected_name) {
            return Some(asset);
        }

        let suffix = expected_name
            .split_once('_')
            .map(|(_, rest)| format!("_{}", rest))?;
        let mut candidates: Vec<&ReleaseAsset> = self
            .assets
            .iter()
            .filter(|a| a.name.ends_with(&suffix))
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        if candidates.len() > 1 {
            warn!(
                expected = expected_name,
                chosen = %candidates[0].name,
                "multiple assets match platform pattern, taking first"
            );
        }
        candidates.first().copied()
    }
}

/// The release channel as the orchestrator sees it. `ReleaseClient` is the
/// GitHub implementation; tests substitute their own.
pub trait ReleaseChannel {
    fn latest_release(&self, repo: &str) -> Result<Release, ReleaseError>;

    fn download_asset(
        &self,
        asset: &ReleaseAsset,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<(), ReleaseError>;
}

pub struct ReleaseClient {
    http: reqwest::blocking::Client,
    api_base: String,
    owner: String,
    token: Option<String>,
    request_timeout: Duration,
    max_retries: u32,
}

impl ReleaseClient {
    pub fn new(
        api_base: &str,
        owner: &str,
        token: Option<String>,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let http = reqwest::blocking::Client::builder()
            .user_agent("forgeman")
            .connect_timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            token,
            request_timeout,
            max_retries,
        }
    }

    fn get_releases(&self, repo: &str) -> Result<Vec<ReleaseResponse>, ReleaseError> {
        let url = format!(
            "{}/repos/{}/{}/releases?per_page=20",
            self.api_base, self.owner, repo
        );

        let mut last_error = String::new();
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s backoff between bounded attempts
                std::thread::sleep(Duration::from_secs(1 << (attempt - 1)));
            }

            let mut request = self
                .http
                .get(url.as_str())
                .header(USER_AGENT, "forgeman")
                .header(ACCEPT, "application/vnd.github+json")
                .timeout(self.request_timeout);
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            }

            match request.send() {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Vec<ReleaseResponse>>()
                        .map_err(|e| ReleaseError::ChannelUnreachable(e.to_string()));
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                    warn!(repo, attempt, %last_error, "release query failed");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(repo, attempt, %last_error, "release query failed");
                }
            }
        }
        Err(ReleaseError::ChannelUnreachable(last_error))
    }
}

impl ReleaseChannel for ReleaseClient {
    /// Latest published release whose tag parses as a version. Draft and
    /// prerelease entries are ignored; malformed tags are skipped, not
    /// coerced.
    fn latest_release(&self, repo: &str) -> Result<Release, ReleaseError> {
        let responses = self.get_releases(repo)?;
        pick_latest(responses).ok_or_else(|| {
            ReleaseError::ChannelUnreachable(format!(
                "no release with a parseable version tag in {}/{}",
                self.owner, repo
            ))
        })
    }

    /// Stream an asset to `dest`, verifying the content hash when the
    /// channel supplied one. A mismatch deletes the partial file.
    fn download_asset(
        &self,
        asset: &ReleaseAsset,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<(), ReleaseError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ReleaseError::DownloadFailed(e.to_string()))?;
        }
        let partial = dest.with_extension("partial");

        let mut request = self
            .http
            .get(asset.download_url.as_str())
            .header(USER_AGENT, "forgeman")
            .header(ACCEPT, "application/octet-stream");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let mut response = request
            .send()
            .map_err(|e| ReleaseError::DownloadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ReleaseError::DownloadFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }

        info!(asset = %asset.name, dest = %dest.display(), "downloading");
        let result = stream_to_file(&mut response, &partial, asset.size, on_progress);
        let actual = match result {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(ReleaseError::DownloadFailed(e.to_string()));
            }
        };

        if let Some(expected) = &asset.sha256 {
            if !expected.eq_ignore_ascii_case(&actual) {
                let _ = fs::remove_file(&partial);
                return Err(ReleaseError::HashMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!(asset = %asset.name, "content hash verified");
        }

        fs::rename(&partial, dest).map_err(|e| ReleaseError::DownloadFailed(e.to_string()))?;
        Ok(())
    }
}

/// Write a stream to a file in chunks, hashing as it goes. Returns the
/// lowercase hex sha256 of the written bytes.
fn stream_to_file(
    source: &mut dyn Read,
    dest: &Path,
    total: Option<u64>,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> std::io::Result<String> {
    let mut file = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        let n = source.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])?;
        hasher.update(&buffer[..n]);
        written += n as u64;
        on_progress(written, total);
    }
    file.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the sha256 of a file on disk (lowercase hex).
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn pick_latest(responses: Vec<ReleaseResponse>) -> Option<Release> {
    responses
        .into_iter()
        .filter(|r| !r.draft && !r.prerelease)
        .filter_map(|r| match Version::parse_tag(&r.tag_name) {
            Ok(version) => Some((version, r)),
            Err(_) => {
                debug!(tag = %r.tag_name, "skipping non-version tag");
                None
            }
        })
        .max_by_key(|(version, _)| *version)
        .map(|(version, r)| Release {
            version,
            tag: r.tag_name,
            assets: r.assets.into_iter().map(into_asset).collect(),
        })
}

fn into_asset(a: AssetResponse) -> ReleaseAsset {
    let sha256 = a
        .digest
        .as_deref()
        .and_then(|d| d.strip_prefix("sha256:"))
        .map(|h| h.to_lowercase());
    ReleaseAsset {
        name: a.name,
        download_url: a.browser_download_url,
        size: a.size,
        sha256,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tag: &str) -> ReleaseResponse {
        ReleaseResponse {
            tag_name: tag.to_string(),
            draft: false,
            prerelease: false,
            assets: vec![],
        }
    }

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            download_url: format!("https://example.com/{}", name),
            size: None,
            sha256: None,
        }
    }

    #[test]
    fn test_pick_latest_skips_malformed_tags() {
        let release = pick_latest(vec![
            response("v1.2.0"),
            response("nightly"),
            response("v1.10.0"),
            response("v1.9.1"),
        ])
        .unwrap();
        assert_eq!(release.version, Version::new(1, 10, 0));
        assert_eq!(release.tag, "v1.10.0");
    }

    #[test]
    fn test_pick_latest_ignores_drafts_and_prereleases() {
        let mut draft = response("v9.0.0");
        draft.draft = true;
        let mut pre = response("v8.0.0");
        pre.prerelease = true;

        let release = pick_latest(vec![draft, pre, response("v1.0.0")]).unwrap();
        assert_eq!(release.version, Version::new(1, 0, 0));
    }

    #[test]
    fn test_pick_latest_none_when_all_malformed() {
        assert!(pick_latest(vec![response("latest"), response("beta-3")]).is_none());
        assert!(pick_latest(vec![]).is_none());
    }

    #[test]
    fn test_select_asset_exact_match() {
        let release = Release {
            version: Version::new(1, 0, 0),
            tag: "v1.0.0".to_string(),
            assets: vec![asset("forgeworker_linux.zip"), asset("forgeworker_windows.zip")],
        };
        let found = release.select_asset("forgeworker_linux.zip").unwrap();
        assert_eq!(found.name, "forgeworker_linux.zip");
    }

    #[test]
    fn test_select_asset_lexicographic_tie_break() {
        let release = Release {
            version: Version::new(1, 0, 0),
            tag: "v1.0.0".to_string(),
            assets: vec![
                asset("forgeworker-b_linux.zip"),
                asset("forgeworker-a_linux.zip"),
            ],
        };
        let found = release.select_asset("forgeworker_linux.zip").unwrap();
        assert_eq!(found.name, "forgeworker-a_linux.zip");
    }

    #[test]
    fn test_select_asset_no_match() {
        let release = Release {
            version: Version::new(1, 0, 0),
            tag: "v1.0.0".to_string(),
            assets: vec![asset("forgeworker_windows.zip")],
        };
        assert!(release.select_asset("forgeworker_linux.zip").is_none());
    }

    #[test]
    fn test_digest_parsing() {
        let parsed = into_asset(AssetResponse {
            name: "a.zip".to_string(),
            browser_download_url: "https://example.com/a.zip".to_string(),
            size: Some(10),
            digest: Some("sha256:ABCDEF0123".to_string()),
        });
        assert_eq!(parsed.sha256.as_deref(), Some("abcdef0123"));

        let missing = into_asset(AssetResponse {
            name: "b.zip".to_string(),
            browser_download_url: "https://example.com/b.zip".to_string(),
            size: None,
            digest: None,
        });
        assert!(missing.sha256.is_none());
    }

    #[test]
    fn test_file_sha256_known_answer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_stream_to_file_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let data = vec![7u8; CHUNK_SIZE * 2 + 17];
        let mut calls = 0u32;
        let mut last = 0u64;

        let digest = stream_to_file(
            &mut &data[..],
            &path,
            Some(data.len() as u64),
            &mut |written, _total| {
                calls += 1;
                last = written;
            },
        )
        .unwrap();

        assert_eq!(last, data.len() as u64);
        assert!(calls >= 3);
        assert_eq!(file_sha256(&path).unwrap(), digest);
    }
}
