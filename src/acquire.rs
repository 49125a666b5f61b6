use crate::config::InputConfig;
use crate::error::PipelineError;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Something that can retrieve the bytes behind a URL.
pub trait Fetcher {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("valkarta/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        info!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Server refused {}", url))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;
        Ok(bytes.to_vec())
    }
}

/// A remote input and where it lands in the cache.
#[derive(Debug, Clone)]
pub enum Resource {
    /// Stored as-is under `name`.
    File { url: String, name: String },
    /// A zip stored as `archive` and extracted into a directory named after it;
    /// `member` is the file downstream stages need.
    Archive {
        url: String,
        archive: String,
        member: String,
    },
}

/// Local paths of every pipeline input.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub votes: PathBuf,
    pub districts: PathBuf,
    pub counties: PathBuf,
}

pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path the resource will occupy once available. Its presence is the cache hit test.
    pub fn target(&self, resource: &Resource) -> PathBuf {
        match resource {
            Resource::File { name, .. } => self.root.join(name),
            Resource::Archive {
                archive, member, ..
            } => self.extract_dir(archive).join(member),
        }
    }

    fn extract_dir(&self, archive: &str) -> PathBuf {
        let stem = Path::new(archive)
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| archive.into());
        self.root.join(stem)
    }

    pub async fn ensure<F: Fetcher>(&self, resource: &Resource, fetcher: &F) -> Result<PathBuf> {
        let target = self.target(resource);
        if target.exists() {
            debug!("Cache hit: {:?}", target);
            return Ok(target);
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create cache directory {:?}", self.root))?;

        match resource {
            Resource::File { url, .. } => {
                let bytes = fetcher.fetch(url).await?;
                write_exclusive(&target, &bytes)?;
            }
            Resource::Archive {
                url,
                archive,
                member,
            } => {
                let archive_path = self.root.join(archive);
                if !archive_path.exists() {
                    let bytes = fetcher.fetch(url).await?;
                    write_exclusive(&archive_path, &bytes)?;
                } else {
                    debug!("Archive {:?} already downloaded", archive_path);
                }
                let dir = self.extract_dir(archive);
                if let Err(e) = extract_zip(&archive_path, &dir) {
                    // a broken download would otherwise poison every later run
                    let _ = fs::remove_file(&archive_path);
                    return Err(e);
                }
                if !target.exists() {
                    return Err(PipelineError::MissingArchiveMember {
                        archive: archive.clone(),
                        member: member.clone(),
                    }
                    .into());
                }
            }
        }
        info!("Cached {:?}", target);
        Ok(target)
    }

    pub async fn ensure_all<F: Fetcher>(&self, input: &InputConfig, fetcher: &F) -> Result<Inputs> {
        let votes = self
            .ensure(
                &Resource::File {
                    url: input.votes_url.clone(),
                    name: input.votes_file.clone(),
                },
                fetcher,
            )
            .await?;
        let districts = self
            .ensure(
                &Resource::Archive {
                    url: input.districts_url.clone(),
                    archive: input.districts_archive.clone(),
                    member: input.districts_member.clone(),
                },
                fetcher,
            )
            .await?;
        let counties = self
            .ensure(
                &Resource::Archive {
                    url: input.counties_url.clone(),
                    archive: input.counties_archive.clone(),
                    member: input.counties_member.clone(),
                },
                fetcher,
            )
            .await?;
        Ok(Inputs {
            votes,
            districts,
            counties,
        })
    }
}

/// Writes through a temp file in the destination directory and persists without
/// clobbering. If another writer created `path` first, its copy is kept.
fn write_exclusive(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write download for {:?}", path))?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            debug!("{:?} was created concurrently, keeping existing file", path);
            Ok(())
        }
        Err(e) => Err(e.error).with_context(|| format!("Failed to persist {:?}", path)),
    }
}

fn extract_zip(archive_path: &Path, dir: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive {:?}", archive_path))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("Malformed zip archive {:?}", archive_path))?;
    zip.extract(dir)
        .with_context(|| format!("Failed to extract {:?} into {:?}", archive_path, dir))?;
    Ok(())
}
