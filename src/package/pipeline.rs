//! Per-package acquisition: Resolving → Fetching → Verifying → Installing.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use super::PackageManager;
use super::archive;
use crate::cache::{InstalledPackage, PackageStatus};
use crate::common::paths::sanitize_component;
use crate::config::RemoteSource;
use crate::error::{ErrorKind, GdpmError, Result};
use crate::rest_api::{AssetQueryParams, AssetRecord};
use crate::ui::prelude::*;

/// Upper bound on list results scanned for an exact title match
const RESOLVE_MAX_RESULTS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Fetching,
    Verifying,
    Installing,
    Installed,
    Failed(ErrorKind),
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Resolving => f.write_str("resolving"),
            Stage::Fetching => f.write_str("fetching"),
            Stage::Verifying => f.write_str("verifying"),
            Stage::Installing => f.write_str("installing"),
            Stage::Installed => f.write_str("installed"),
            Stage::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// What a successful per-package operation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Installed { version: String, path: PathBuf },
    Updated { from: String, to: String },
    AlreadyInstalled { version: String },
    UpToDate { version: String },
    Removed { records: usize, path_errors: Vec<String> },
    Linked { target: PathBuf },
    Cloned { target: PathBuf },
    MarkedStale { installed: String, remote: String },
}

#[derive(Debug)]
pub struct Failure {
    /// Stage that was running when the error happened
    pub stage: Stage,
    pub error: GdpmError,
}

/// Result of one package within a bulk request
#[derive(Debug)]
pub struct PackageOutcome {
    /// Title as requested
    pub title: String,
    /// Remote the package was resolved against, once known
    pub source: Option<String>,
    pub result: std::result::Result<Action, Failure>,
}

impl PackageOutcome {
    pub fn success(title: impl Into<String>, source: Option<String>, action: Action) -> Self {
        Self {
            title: title.into(),
            source,
            result: Ok(action),
        }
    }

    pub fn failure(
        title: impl Into<String>,
        source: Option<String>,
        stage: Stage,
        error: GdpmError,
    ) -> Self {
        Self {
            title: title.into(),
            source,
            result: Err(Failure { stage, error }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Terminal state of the package
    pub fn state(&self) -> Stage {
        match &self.result {
            Ok(_) => Stage::Installed,
            Err(f) => Stage::Failed(f.error.kind()),
        }
    }
}

/// A title matched on one remote, with its full asset record
#[derive(Debug, Clone)]
pub struct Resolved {
    pub source: RemoteSource,
    pub asset: AssetRecord,
}

/// SHA-256 of `path`, computed off the async workers
async fn hash_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || archive::sha256_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

/// Extract into `staging`, then swap the result in at `dest`
fn unpack_into(archive_path: &Path, staging: &Path, dest: &Path) -> std::result::Result<(), String> {
    archive::remove_path(staging).map_err(|e| e.to_string())?;
    archive::extract_zip(archive_path, staging).map_err(|e| e.to_string())?;
    let root = archive::single_root(staging)
        .map_err(|e| e.to_string())?
        .unwrap_or_else(|| staging.to_path_buf());
    archive::remove_path(dest).map_err(|e| e.to_string())?;
    archive::move_dir(&root, dest).map_err(|e| e.to_string())
}

impl PackageManager {
    fn trace(&self, title: &str, source: Option<&str>, stage: Stage) {
        emit(
            Level::Debug,
            "package.stage",
            &format!("{title}: {stage}"),
            Some(json!({ "title": title, "source": source, "stage": stage.to_string() })),
        );
    }

    /// Find `title` on the configured remotes, in priority order.
    ///
    /// The first remote with an exact (case-insensitive) title match wins. A remote that
    /// errors is skipped. If no remote matched, the result is `AssetNotFound` unless every
    /// remote failed, in which case the last error is reported instead.
    pub async fn resolve(&self, title: &str, remote: Option<&str>) -> Result<Resolved> {
        let config = self.config();
        let sources: Vec<RemoteSource> = match remote {
            Some(name) => vec![
                config
                    .remote_sources
                    .get(name)
                    .cloned()
                    .ok_or_else(|| GdpmError::ConfigInvalid {
                        path: config.path.clone(),
                        reason: format!("unknown remote `{name}`"),
                    })?,
            ],
            None => {
                if config.remote_sources.is_empty() {
                    emit(
                        Level::Warn,
                        "package.no_remotes",
                        &format!(
                            "{} No remotes configured; add one with `gdpm remote add`",
                            char::from(NerdFont::Warning)
                        ),
                        None,
                    );
                }
                config.remote_sources.iter().cloned().collect()
            }
        };

        let mut params = AssetQueryParams::for_title(title);
        params.godot_version = config.godot_version.clone();
        params.max_results = RESOLVE_MAX_RESULTS;

        let mut last_error = None;
        let mut answered = 0usize;
        for source in sources {
            self.trace(title, Some(&source.name), Stage::Resolving);
            let listed = match self.client().list_assets(&source, &params).await {
                Ok(listed) => listed,
                Err(e) => {
                    emit(
                        Level::Warn,
                        "package.remote_failed",
                        &format!(
                            "{} Remote '{}' failed while resolving '{title}': {e}",
                            char::from(NerdFont::Warning),
                            source.name
                        ),
                        None,
                    );
                    last_error = Some(e);
                    continue;
                }
            };
            answered += 1;

            let Some(hit) = listed.iter().find(|a| a.title.eq_ignore_ascii_case(title)) else {
                continue;
            };
            match self.client().get_asset(&source, &hit.asset_id).await {
                Ok(asset) if asset.download_url.as_deref().is_some_and(|u| !u.is_empty()) => {
                    return Ok(Resolved { source, asset });
                }
                Ok(asset) => {
                    last_error = Some(GdpmError::RemoteMalformed {
                        url: source.url.clone(),
                        reason: format!("asset {} has no download_url", asset.asset_id),
                    });
                    answered -= 1;
                }
                Err(e) => {
                    last_error = Some(e);
                    answered -= 1;
                }
            }
        }

        match last_error {
            Some(e) if answered == 0 => Err(e),
            _ => Err(GdpmError::AssetNotFound {
                title: title.to_string(),
            }),
        }
    }

    /// Archive path for one (source, title) in the temp directory
    pub(crate) fn archive_path(&self, source: &str, title: &str) -> PathBuf {
        self.config().tmp_path().join(format!(
            "{}-{}.zip",
            sanitize_component(source),
            sanitize_component(title)
        ))
    }

    pub(crate) fn staging_path(&self, source: &str, title: &str) -> PathBuf {
        self.config().tmp_path().join(format!(
            ".staging-{}-{}",
            sanitize_component(source),
            sanitize_component(title)
        ))
    }

    pub(crate) fn install_path(&self, source: &str, title: &str) -> PathBuf {
        self.config()
            .packages_path()
            .join(sanitize_component(source))
            .join(sanitize_component(title))
    }

    /// Fetch, verify and install a resolved asset. The caller holds the package's key lock.
    ///
    /// `previous` is the existing record when replacing an installed package; it is marked
    /// `Failed` if installation breaks halfway.
    pub(crate) async fn acquire(
        &self,
        resolved: &Resolved,
        previous: Option<&InstalledPackage>,
    ) -> std::result::Result<InstalledPackage, Failure> {
        let title = resolved.asset.title.as_str();
        let source = resolved.source.name.as_str();
        let archive_path = self.archive_path(source, title);

        self.trace(title, Some(source), Stage::Fetching);
        self.fetch(resolved, &archive_path)
            .await
            .map_err(|error| Failure {
                stage: Stage::Fetching,
                error,
            })?;

        self.trace(title, Some(source), Stage::Verifying);
        let hash = match self.verify(resolved, &archive_path).await {
            Ok(hash) => hash,
            Err(error) => {
                let _ = archive::remove_path(&archive_path);
                return Err(Failure {
                    stage: Stage::Verifying,
                    error,
                });
            }
        };

        self.trace(title, Some(source), Stage::Installing);
        let installed = self
            .install_archive(resolved, &archive_path, hash, previous)
            .await;

        if self.config().clean_temporary || installed.is_err() {
            let _ = archive::remove_path(&archive_path);
        }

        match installed {
            Ok(pkg) => {
                self.trace(title, Some(source), Stage::Installed);
                Ok(pkg)
            }
            Err(error) => {
                if let Some(previous) = previous {
                    let marked = self.with_db(|db| {
                        db.set_status(&previous.title, &previous.source, PackageStatus::Failed)
                    });
                    if let Err(e) = marked {
                        emit(
                            Level::Warn,
                            "package.status_failed",
                            &format!("Could not mark '{title}' as failed: {e}"),
                            None,
                        );
                    }
                }
                self.trace(title, Some(source), Stage::Failed(error.kind()));
                Err(Failure {
                    stage: Stage::Installing,
                    error,
                })
            }
        }
    }

    async fn fetch(&self, resolved: &Resolved, archive_path: &Path) -> Result<()> {
        let url = resolved.asset.download_url.clone().unwrap_or_default();

        if self.config().enable_cache
            && archive_path.exists()
            && let Some(expected) = resolved.asset.checksum()
            && hash_file(archive_path)
                .await
                .is_ok_and(|actual| archive::checksums_match(expected, &actual))
        {
            emit(
                Level::Debug,
                "package.cache_hit",
                &format!("Reusing cached archive {}", archive_path.display()),
                None,
            );
            return Ok(());
        }

        let tmp_dir = self.config().tmp_path();
        fs::create_dir_all(&tmp_dir).map_err(|e| GdpmError::store_io(&tmp_dir, e))?;

        let response = self
            .http()
            .download_to_file(&url, archive_path, &self.request_params())
            .await;
        if let Some(cause) = response.failure() {
            let _ = archive::remove_path(archive_path);
            return Err(GdpmError::Network { url, cause });
        }
        Ok(())
    }

    /// Check the archive against the remote checksum. Returns the hash to record.
    async fn verify(&self, resolved: &Resolved, archive_path: &Path) -> Result<String> {
        let actual = hash_file(archive_path)
            .await
            .map_err(|e| GdpmError::store_io(archive_path, e))?;
        match resolved.asset.checksum() {
            Some(expected) if archive::checksums_match(expected, &actual) => Ok(actual),
            Some(expected) => Err(GdpmError::IntegrityMismatch {
                title: resolved.asset.title.clone(),
                expected: expected.to_string(),
                actual,
            }),
            None => {
                emit(
                    Level::Warn,
                    "package.no_checksum",
                    &format!(
                        "{} Remote '{}' published no checksum for '{}'; skipping verification",
                        char::from(NerdFont::Warning),
                        resolved.source.name,
                        resolved.asset.title
                    ),
                    None,
                );
                Ok(actual)
            }
        }
    }

    async fn install_archive(
        &self,
        resolved: &Resolved,
        archive_path: &Path,
        hash: String,
        previous: Option<&InstalledPackage>,
    ) -> Result<InstalledPackage> {
        let title = resolved.asset.title.as_str();
        let source = resolved.source.name.as_str();
        let partial = |reason: String| GdpmError::PartialInstall {
            title: title.to_string(),
            reason,
        };

        if let Some(previous) = previous {
            self.with_db(|db| db.set_status(&previous.title, &previous.source, PackageStatus::Pending))?;
        }

        let staging = self.staging_path(source, title);
        let dest = self.install_path(source, title);
        let placed = {
            let (archive_path, staging, dest) =
                (archive_path.to_path_buf(), staging.clone(), dest.clone());
            tokio::task::spawn_blocking(move || {
                let placed = unpack_into(&archive_path, &staging, &dest);
                let _ = archive::remove_path(&staging);
                placed
            })
            .await
            .unwrap_or_else(|e| Err(e.to_string()))
        };

        if let Err(reason) = placed {
            return Err(partial(reason));
        }

        let mut pkg = previous
            .cloned()
            .unwrap_or_else(|| InstalledPackage::new(title, source));
        pkg.asset_id = resolved.asset.asset_id.clone();
        pkg.install_path = dest.clone();
        pkg.version = resolved.asset.version_label();
        pkg.hash = resolved.asset.checksum().map(str::to_string).unwrap_or(hash);
        pkg.updated_at = chrono::Utc::now().to_rfc3339();
        pkg.status = PackageStatus::Installed;

        if let Err(e) = self.with_db(|db| db.insert_or_update(&pkg)) {
            // Nothing else tracks these files
            if previous.is_none() {
                let _ = archive::remove_path(&dest);
            }
            return Err(partial(format!("recording package failed: {e}")));
        }
        Ok(pkg)
    }

    /// Resolve and install one title.
    ///
    /// Re-installing an identical version is a no-op unless `force` is set.
    pub(crate) async fn install_one(
        &self,
        title: &str,
        remote: Option<&str>,
        force: bool,
    ) -> PackageOutcome {
        let resolved = match self.resolve(title, remote).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.trace(title, remote, Stage::Failed(e.kind()));
                return PackageOutcome::failure(title, remote.map(str::to_string), Stage::Resolving, e);
            }
        };
        let source = Some(resolved.source.name.clone());

        let _guard = self
            .locks()
            .acquire(&resolved.asset.title, &resolved.source.name)
            .await;

        let existing = match self.with_db(|db| {
            db.lookup(&resolved.asset.title, Some(&resolved.source.name), &[])
        }) {
            Ok(existing) => existing,
            Err(e) => return PackageOutcome::failure(title, source, Stage::Resolving, e),
        };

        let version = resolved.asset.version_label();
        if let Some(existing) = &existing
            && !force
            && existing.status == PackageStatus::Installed
            && existing.version == version
            && resolved
                .asset
                .checksum()
                .is_none_or(|h| archive::checksums_match(h, &existing.hash))
        {
            return PackageOutcome::success(title, source, Action::AlreadyInstalled { version });
        }

        emit(
            Level::Info,
            "package.fetching",
            &format!(
                "{} Fetching {} {version} from '{}'",
                char::from(NerdFont::Download),
                resolved.asset.title,
                resolved.source.name
            ),
            None,
        );
        match self.acquire(&resolved, existing.as_ref()).await {
            Ok(pkg) => {
                emit(
                    Level::Success,
                    "package.installed",
                    &format!(
                        "{} Installed {} {} from '{}'",
                        char::from(NerdFont::Check),
                        pkg.title,
                        pkg.version,
                        pkg.source
                    ),
                    Some(json!({
                        "title": pkg.title,
                        "source": pkg.source,
                        "version": pkg.version,
                        "path": pkg.install_path,
                    })),
                );
                let action = match existing {
                    Some(old) if old.version != pkg.version => Action::Updated {
                        from: old.version,
                        to: pkg.version,
                    },
                    _ => Action::Installed {
                        version: pkg.version,
                        path: pkg.install_path,
                    },
                };
                PackageOutcome::success(title, source, action)
            }
            Err(failure) => PackageOutcome {
                title: title.to_string(),
                source,
                result: Err(failure),
            },
        }
    }

    /// Re-check one installed package against its remote and reinstall when it changed
    pub(crate) async fn update_one(&self, record: InstalledPackage) -> PackageOutcome {
        let source = Some(record.source.clone());
        let remote = match self.config().remote_sources.get(&record.source) {
            Some(remote) => remote.clone(),
            None => {
                emit(
                    Level::Warn,
                    "package.orphaned",
                    &format!(
                        "{} '{}' was installed from '{}', which is no longer configured",
                        char::from(NerdFont::Warning),
                        record.title,
                        record.source
                    ),
                    None,
                );
                return PackageOutcome::failure(
                    record.title.clone(),
                    source,
                    Stage::Resolving,
                    GdpmError::AssetNotFound {
                        title: record.title.clone(),
                    },
                );
            }
        };

        self.trace(&record.title, source.as_deref(), Stage::Resolving);
        let asset = match self.client().get_asset(&remote, &record.asset_id).await {
            Ok(asset) => asset,
            Err(e) => {
                return PackageOutcome::failure(record.title.clone(), source, Stage::Resolving, e);
            }
        };

        let _guard = self.locks().acquire(&record.title, &record.source).await;

        // Re-read under the lock; a concurrent install may have replaced it
        let current = match self.with_db(|db| db.lookup(&record.title, Some(&record.source), &[])) {
            Ok(Some(current)) => current,
            Ok(None) => {
                return PackageOutcome::failure(
                    record.title.clone(),
                    source,
                    Stage::Resolving,
                    GdpmError::NotInstalled {
                        title: record.title.clone(),
                    },
                );
            }
            Err(e) => return PackageOutcome::failure(record.title.clone(), source, Stage::Resolving, e),
        };

        let version = asset.version_label();
        let unchanged = current.version == version
            && asset
                .checksum()
                .is_none_or(|h| archive::checksums_match(h, &current.hash));
        if unchanged && current.status == PackageStatus::Installed {
            return PackageOutcome::success(current.title, source, Action::UpToDate { version });
        }

        let resolved = Resolved {
            source: remote,
            asset,
        };
        match self.acquire(&resolved, Some(&current)).await {
            Ok(pkg) => {
                emit(
                    Level::Success,
                    "package.updated",
                    &format!(
                        "{} Updated {} {} → {}",
                        char::from(NerdFont::Upgrade),
                        pkg.title,
                        current.version,
                        pkg.version
                    ),
                    None,
                );
                PackageOutcome::success(
                    pkg.title,
                    source,
                    Action::Updated {
                        from: current.version,
                        to: pkg.version,
                    },
                )
            }
            Err(failure) => PackageOutcome {
                title: current.title,
                source,
                result: Err(failure),
            },
        }
    }
}
