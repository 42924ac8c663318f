//! Image download, decompression, and integrity verification. Spec §1 calls
//! this out of scope beyond the `ImageStore` interface; this module supplies
//! one concrete implementation grounded in
//! `original_source/executor/executor/images.py`.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::utils::{log, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resolves an opaque image identifier to a local, verified file path.
pub trait ImageStore {
    fn get_image(&self, name: &str) -> Result<PathBuf>;
    fn latest(&self) -> Result<String>;
}

/// HTTP-backed image store: `GET {base}/latest`, then
/// `GET {base}/images/{commit}/{name}.qcow2.zst` (+ `.sha256`).
pub struct ImagesRetriever {
    http: ureq::Agent,
    server: String,
    storage_dir: PathBuf,
    active_commit: Mutex<String>,
}

impl ImagesRetriever {
    pub fn new(server: &str, cache_dir: Option<PathBuf>) -> Result<Self> {
        let http = ureq::AgentBuilder::new().build();
        let server = server.trim_end_matches('/').to_string();

        let storage_dir = match cache_dir {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                dir
            }
            None => {
                let dir = std::env::temp_dir().join(format!("gha-vm-executor-images-{}", std::process::id()));
                fs::create_dir_all(&dir)?;
                dir
            }
        };

        let active_commit = fetch_text(&http, &format!("{server}/latest"))?;
        purge_old_caches(&storage_dir, &active_commit);

        Ok(ImagesRetriever {
            http,
            server,
            storage_dir,
            active_commit: Mutex::new(active_commit),
        })
    }

    fn active_commit(&self) -> String {
        self.active_commit.lock().expect("active commit lock poisoned").clone()
    }
}

impl ImageStore for ImagesRetriever {
    fn get_image(&self, name: &str) -> Result<PathBuf> {
        let commit = self.active_commit();
        let dir = self.storage_dir.join(&commit);
        fs::create_dir_all(&dir)?;
        let local_path = dir.join(format!("{name}.qcow2"));

        let image_url = format!("{}/images/{commit}/{name}.qcow2", self.server);

        if !local_path.exists() {
            log(format!("downloading image {name} (commit: {commit})"));
            let response = self
                .http
                .get(&format!("{image_url}.zst"))
                .call()
                .map_err(|err| Error::UpstreamError { message: err.to_string() })?;

            let tmp_path = dir.join(format!("{name}.qcow2.partial"));
            {
                let mut reader = response.into_reader();
                let mut dst = File::create(&tmp_path)?;
                zstd::stream::copy_decode(&mut reader, &mut dst).map_err(|err| {
                    Error::UpstreamError { message: format!("failed to decompress {name}: {err}") }
                })?;
            }
            fs::rename(&tmp_path, &local_path)?;
        }

        log(format!("verifying hash of image {name}"));
        let local_hash = sha256_of_file(&local_path)?;
        let remote_hash = fetch_text(&self.http, &format!("{image_url}.sha256"))?;

        if !local_hash.eq_ignore_ascii_case(&remote_hash) {
            let _ = fs::remove_file(&local_path);
            return Err(Error::IntegrityError {
                name: name.to_string(),
                expected: remote_hash,
                actual: local_hash,
            });
        }

        Ok(local_path)
    }

    fn latest(&self) -> Result<String> {
        fetch_text(&self.http, &format!("{}/latest", self.server))
    }
}

fn fetch_text(http: &ureq::Agent, url: &str) -> Result<String> {
    let response = http
        .get(url)
        .call()
        .map_err(|err| Error::UpstreamError { message: format!("{url}: {err}") })?;
    let text = response
        .into_string()
        .map_err(|err| Error::UpstreamError { message: err.to_string() })?;
    Ok(text.trim().to_string())
}

fn sha256_of_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn purge_old_caches(storage_dir: &Path, active_commit: &str) {
    let Ok(entries) = fs::read_dir(storage_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy() != active_commit {
            log(format!(
                "purging image cache for commit {}",
                entry.file_name().to_string_lossy()
            ));
            let _ = fs::remove_dir_all(entry.path());
        }
    }
}

/// Periodic poller: every [`POLL_INTERVAL`], checks whether a new image
/// identifier is available and invokes `on_new_image` once per distinct new
/// id. Transient HTTP errors are logged and skipped (spec §4.4).
pub struct ImageUpdateWatcher;

impl ImageUpdateWatcher {
    pub fn start<F>(retriever: std::sync::Arc<ImagesRetriever>, mut on_new_image: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        thread::Builder::new()
            .name("image-update-watcher".to_string())
            .spawn(move || {
                log("started polling the image server to check for image updates");
                loop {
                    thread::sleep(POLL_INTERVAL);
                    match retriever.latest() {
                        Ok(new_commit) => {
                            let current = retriever.active_commit();
                            if new_commit != current {
                                log(format!("new images with commit {new_commit} are available"));
                                *retriever
                                    .active_commit
                                    .lock()
                                    .expect("active commit lock poisoned") = new_commit.clone();
                                on_new_image(&new_commit);
                            }
                        }
                        Err(err) => warn(format!("failed to check for image updates: {err}")),
                    }
                }
            })
            .expect("failed to spawn image update watcher thread");
    }
}
