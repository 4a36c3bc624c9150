//! Repository snapshot downloads
//!
//! Fetches the files a causal LM checkpoint needs from the Hugging Face hub
//! into `<cache_dir>/models--{namespace}--{repo}`. A completed snapshot is a
//! valid local model directory and is picked up by the registry in place of
//! the remote id.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::locator::{self, CONFIG_FILE};

/// Base URL files are resolved against
pub const HUB_URL: &str = "https://huggingface.co";

/// Files every snapshot must have
pub const REQUIRED_FILES: &[&str] = &[CONFIG_FILE, "tokenizer.json"];

/// Files fetched when present
pub const OPTIONAL_FILES: &[&str] = &["generation_config.json", "tokenizer_config.json"];

pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Directory a repository snapshot lives in
pub fn cached_snapshot_dir(cache_dir: &Path, repo_id: &str) -> PathBuf {
    cache_dir.join(format!("models--{}", repo_id.replace('/', "--")))
}

/// Snapshot directory if a download of it completed.
///
/// An interrupted download leaves `config.json` without weights; such a
/// directory is not a snapshot, so the remote id keeps being used and the
/// next load resumes the download.
pub fn cached_snapshot(cache_dir: &Path, repo_id: &str) -> Option<PathBuf> {
    let dir = cached_snapshot_dir(cache_dir, repo_id);
    is_complete_snapshot(&dir).then_some(dir)
}

/// Config, tokenizer and every weight file present
pub fn is_complete_snapshot(dir: &Path) -> bool {
    locator::is_model_dir(dir)
        && REQUIRED_FILES.iter().all(|file| dir.join(file).is_file())
        && weight_files(dir).is_ok()
}

/// URL of one file in a repository
pub fn file_url(repo_id: &str, file: &str) -> String {
    format!("{}/{}/resolve/main/{}", HUB_URL, repo_id, file)
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: BTreeMap<String, String>,
}

/// Shard file names listed by a `model.safetensors.index.json`
pub fn shard_files(index_json: &str) -> Result<Vec<String>> {
    let index: WeightsIndex =
        serde_json::from_str(index_json).context("Failed to parse safetensors index")?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(anyhow!("Safetensors index lists no shards"));
    }
    Ok(shards.into_iter().collect())
}

/// Safetensors files of a snapshot directory; fails if any is missing
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join(WEIGHTS_INDEX_FILE);
    if index.is_file() {
        let json = fs::read_to_string(&index).context("Failed to read safetensors index")?;
        let shards: Vec<PathBuf> = shard_files(&json)?
            .into_iter()
            .map(|shard| dir.join(shard))
            .collect();
        if let Some(missing) = shards.iter().find(|shard| !shard.is_file()) {
            return Err(anyhow!("Missing weight shard {}", missing.display()));
        }
        return Ok(shards);
    }
    let single = dir.join(SINGLE_WEIGHTS_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }
    Err(anyhow!("No safetensors weights in {}", dir.display()))
}

enum Fetch {
    Done,
    NotFound,
}

fn client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(1800))
        .build()
        .context("Failed to create HTTP client")
}

/// Download one file, reporting (downloaded_bytes, total_bytes).
///
/// The callback fires roughly every 1% or 500KB, whichever comes first.
fn fetch_file<F>(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    on_progress: &F,
) -> Result<Fetch>
where
    F: Fn(&str, u64, u64),
{
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to request {}", url))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(Fetch::NotFound);
    }
    if !response.status().is_success() {
        return Err(anyhow!("Download of {} failed: HTTP {}", url, response.status()));
    }

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let total_size = response.content_length().unwrap_or(0);

    let temp_path = dest.with_file_name(format!("{}.tmp", file_name));
    let mut file = fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 8192];
    let mut last_callback_bytes: u64 = 0;
    let threshold = if total_size > 0 {
        (total_size / 100).min(500_000)
    } else {
        500_000
    };

    on_progress(&file_name, 0, total_size);

    loop {
        let bytes_read = response.read(&mut buffer).context("Download interrupted")?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .context("Failed to write to file")?;
        downloaded += bytes_read as u64;

        if downloaded - last_callback_bytes >= threshold {
            on_progress(&file_name, downloaded, total_size);
            last_callback_bytes = downloaded;
        }
    }

    on_progress(&file_name, downloaded, total_size);

    fs::rename(&temp_path, dest).context("Failed to finalize download")?;
    Ok(Fetch::Done)
}

/// Download a repository snapshot with a custom progress callback.
///
/// The callback receives (file_name, downloaded_bytes, total_bytes). Files
/// already on disk are skipped, so an interrupted download resumes at file
/// granularity.
pub fn download_snapshot_with_progress<F>(
    repo_id: &str,
    cache_dir: &Path,
    on_progress: F,
) -> Result<PathBuf>
where
    F: Fn(&str, u64, u64),
{
    if !locator::is_valid_repo_id(repo_id) {
        return Err(anyhow!("'{}' is not a namespace/repo id", repo_id));
    }

    let dir = cached_snapshot_dir(cache_dir, repo_id);
    fs::create_dir_all(&dir).context("Failed to create cache directory")?;
    let client = client()?;

    let fetch = |file: &str| -> Result<Fetch> {
        let dest = dir.join(file);
        if dest.is_file() {
            crate::verbose!("{} already present", dest.display());
            return Ok(Fetch::Done);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("Failed to create snapshot subdirectory")?;
        }
        fetch_file(&client, &file_url(repo_id, file), &dest, &on_progress)
    };

    for &file in REQUIRED_FILES {
        if let Fetch::NotFound = fetch(file)? {
            return Err(anyhow!("{} has no {}", repo_id, file));
        }
    }
    for &file in OPTIONAL_FILES {
        if let Fetch::NotFound = fetch(file)? {
            crate::verbose!("{} has no {}; skipping", repo_id, file);
        }
    }

    match fetch(SINGLE_WEIGHTS_FILE)? {
        Fetch::Done => {}
        Fetch::NotFound => {
            if let Fetch::NotFound = fetch(WEIGHTS_INDEX_FILE)? {
                return Err(anyhow!("{} has no safetensors weights", repo_id));
            }
            let index = fs::read_to_string(dir.join(WEIGHTS_INDEX_FILE))
                .context("Failed to read safetensors index")?;
            for shard in shard_files(&index)? {
                if let Fetch::NotFound = fetch(&shard)? {
                    return Err(anyhow!("{} is missing shard {}", repo_id, shard));
                }
            }
        }
    }

    Ok(dir)
}

/// Download a repository snapshot with progress printed to stderr
pub fn download_snapshot(repo_id: &str, cache_dir: &Path) -> Result<PathBuf> {
    eprintln!("Downloading '{}'...", repo_id);
    eprintln!("Destination: {}", cached_snapshot_dir(cache_dir, repo_id).display());
    eprintln!();

    let dir = download_snapshot_with_progress(repo_id, cache_dir, |file, downloaded, total| {
        let progress = if total > 0 {
            (downloaded * 100 / total) as usize
        } else {
            0
        };
        eprint!(
            "\r{}: {}% ({:.1} MB / {:.1} MB)  ",
            file,
            progress,
            downloaded as f64 / 1_000_000.0,
            total as f64 / 1_000_000.0
        );
        if total > 0 && downloaded == total {
            eprintln!();
        }
        io::stderr().flush().ok();
    })?;

    eprintln!("Download complete: {}", dir.display());
    Ok(dir)
}

/// Snapshot directory for a repository, downloading it if missing
pub fn ensure_snapshot(repo_id: &str, cache_dir: &Path) -> Result<PathBuf> {
    if let Some(dir) = cached_snapshot(cache_dir, repo_id) {
        return Ok(dir);
    }
    download_snapshot(repo_id, cache_dir)
}
