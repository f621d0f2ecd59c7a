//! Package operations over the configured remotes and the local store.
//!
//! Bulk requests fan out over a bounded worker pool. Work on one (title, source) key is
//! serialized through [`locks::KeyedLocks`]; the database is shared behind a mutex that
//! is only held for synchronous calls.

pub mod archive;
mod locks;
mod pipeline;

pub use pipeline::{Action, PackageOutcome, Stage};

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::{Database, InstalledPackage, PackageFilter, PackageStatus};
use crate::common::paths::{self, sanitize_component};
use crate::config::Config;
use crate::error::{GdpmError, Result};
use crate::http::{HttpClient, RequestParams};
use crate::rest_api::{AssetClient, AssetQueryParams, AssetRecord};
use crate::ui::prelude::*;

use locks::KeyedLocks;

struct Inner {
    config: Config,
    http: HttpClient,
    client: AssetClient,
    db: Mutex<Database>,
    locks: KeyedLocks,
    cancelled: Arc<AtomicBool>,
}

/// Shared handle to the package store. Cloning is cheap.
#[derive(Clone)]
pub struct PackageManager {
    inner: Arc<Inner>,
}

/// Remove duplicate titles (case-insensitive), keeping first occurrence order
pub fn dedup_titles(titles: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Titles from a package list file: one per line, `#` starts a comment
pub fn read_title_list(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|e| GdpmError::store_io(path, e))?;
    Ok(contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Files and directories the pipeline leaves in the temp directory
fn is_temp_artifact(name: &str) -> bool {
    name.ends_with(".zip") || name.starts_with(".staging-") || name.starts_with(".tmp")
}

fn artifact_matches_title(name: &str, title: &str) -> bool {
    let name = name.to_lowercase();
    let title = sanitize_component(title).to_lowercase();
    name.ends_with(&format!("-{title}.zip"))
        || (name.starts_with(".staging-") && name.ends_with(&format!("-{title}")))
}

/// Point `target` at `original`. An existing link to the same place is kept.
fn symlink_into(original: &Path, target: &Path) -> io::Result<()> {
    if let Ok(existing) = fs::read_link(target) {
        if existing == original {
            return Ok(());
        }
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} links to {}", target.display(), existing.display()),
        ));
    }
    if fs::symlink_metadata(target).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", target.display()),
        ));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(original, target)
}

impl PackageManager {
    /// Open the package database under the configured packages directory
    pub fn new(config: Config) -> Result<Self> {
        let packages_dir = config.packages_path();
        fs::create_dir_all(&packages_dir).map_err(|e| GdpmError::store_io(&packages_dir, e))?;
        let db = Database::open(&paths::database_path(&packages_dir))?;
        Self::with_database(config, db)
    }

    pub fn with_database(config: Config, db: Database) -> Result<Self> {
        let http = HttpClient::new().map_err(|cause| GdpmError::Network {
            url: String::new(),
            cause,
        })?;
        let params = RequestParams {
            verbose: config.verbose,
            ..RequestParams::with_timeout(config.request_timeout())
        };
        let client = AssetClient::new(http.clone(), params);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                client,
                db: Mutex::new(db),
                locks: KeyedLocks::default(),
                cancelled: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn http(&self) -> &HttpClient {
        &self.inner.http
    }

    pub(crate) fn client(&self) -> &AssetClient {
        &self.inner.client
    }

    pub(crate) fn locks(&self) -> &KeyedLocks {
        &self.inner.locks
    }

    pub(crate) fn request_params(&self) -> RequestParams {
        RequestParams {
            verbose: self.config().verbose,
            ..RequestParams::with_timeout(self.config().request_timeout())
        }
    }

    /// Flag checked before each queued package starts. In-flight packages finish.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn with_db<T>(&self, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        let mut db = self.inner.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut db)
    }

    fn priority(&self) -> Vec<String> {
        self.config().remote_sources.names()
    }

    /// Installed records for `title`, exact match first, then case-insensitive
    fn find_records(&self, title: &str, source: Option<&str>) -> Result<Vec<InstalledPackage>> {
        self.with_db(|db| {
            let mut records = db.lookup_all(title)?;
            if records.is_empty() {
                let filter = PackageFilter {
                    title: Some(title.to_string()),
                    ..PackageFilter::default()
                };
                records = db
                    .list(&filter)?
                    .into_iter()
                    .filter(|p| p.title.eq_ignore_ascii_case(title))
                    .collect();
            }
            records.retain(|p| source.is_none_or(|s| p.source == s));
            Ok(records)
        })
    }

    /// The installed record of `title` that wins under remote priority
    pub fn find_installed(&self, title: &str, source: Option<&str>) -> Result<Option<InstalledPackage>> {
        let priority = self.priority();
        if let Some(exact) = self.with_db(|db| db.lookup(title, source, &priority))? {
            return Ok(Some(exact));
        }
        let mut records = self.find_records(title, source)?;
        records.sort_by_key(|p| {
            let rank = priority
                .iter()
                .position(|s| *s == p.source)
                .unwrap_or(usize::MAX);
            (rank, p.source.clone())
        });
        Ok(records.into_iter().next())
    }

    /// Run `op` for every item on the worker pool, returning outcomes in input order
    async fn run_each<T, F, Fut>(&self, items: Vec<(String, T)>, op: F) -> Vec<PackageOutcome>
    where
        T: Send + 'static,
        F: Fn(PackageManager, T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = PackageOutcome> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config().jobs()));
        let labels: Vec<String> = items.iter().map(|(label, _)| label.clone()).collect();
        let mut set = JoinSet::new();

        for (index, (label, item)) in items.into_iter().enumerate() {
            let pm = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let op = op.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if pm.is_cancelled() {
                    let error = GdpmError::Cancelled {
                        title: label.clone(),
                    };
                    return (index, PackageOutcome::failure(label, None, Stage::Resolving, error));
                }
                (index, op(pm, item).await)
            });
        }

        let mut outcomes: Vec<Option<PackageOutcome>> = labels.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => emit(
                    Level::Error,
                    "package.worker_failed",
                    &format!("{} Worker task failed: {e}", char::from(NerdFont::Cross)),
                    None,
                ),
            }
        }

        outcomes
            .into_iter()
            .zip(labels)
            .map(|(outcome, label)| {
                outcome.unwrap_or_else(|| {
                    let error = GdpmError::PartialInstall {
                        title: label.clone(),
                        reason: "worker task aborted".to_string(),
                    };
                    PackageOutcome::failure(label, None, Stage::Resolving, error)
                })
            })
            .collect()
    }

    /// Install every title. Duplicate titles collapse to one.
    pub async fn install(&self, titles: &[String], remote: Option<&str>, force: bool) -> Vec<PackageOutcome> {
        let remote = remote.map(str::to_string);
        let items = dedup_titles(titles)
            .into_iter()
            .map(|t| (t.clone(), t))
            .collect();
        self.run_each(items, move |pm, title: String| {
            let remote = remote.clone();
            async move { pm.install_one(&title, remote.as_deref(), force).await }
        })
        .await
    }

    /// Install, then link each installed package into `<project>/addons`
    pub async fn add(
        &self,
        titles: &[String],
        project: &Path,
        remote: Option<&str>,
        force: bool,
    ) -> Vec<PackageOutcome> {
        let addons = project.join("addons");
        let installed = self.install(titles, remote, force).await;
        installed
            .into_iter()
            .map(|outcome| {
                if !outcome.is_success() {
                    return outcome;
                }
                let mut linked = self.link_one(&outcome.title, &addons, outcome.source.as_deref());
                if linked.source.is_none() {
                    linked.source = outcome.source;
                }
                linked
            })
            .collect()
    }

    /// Check installed packages against their remotes; all of them when `titles` is empty
    pub async fn update(&self, titles: &[String]) -> Result<Vec<PackageOutcome>> {
        let mut items = Vec::new();
        let mut missing = Vec::new();
        if titles.is_empty() {
            for record in self.with_db(|db| db.list(&PackageFilter::default()))? {
                items.push((record.title.clone(), record));
            }
        } else {
            for title in dedup_titles(titles) {
                let records = self.find_records(&title, None)?;
                if records.is_empty() {
                    missing.push(title);
                }
                items.extend(records.into_iter().map(|r| (r.title.clone(), r)));
            }
        }

        let mut outcomes = self
            .run_each(items, |pm, record: InstalledPackage| async move {
                pm.update_one(record).await
            })
            .await;
        outcomes.extend(missing.into_iter().map(|title| {
            let error = GdpmError::NotInstalled {
                title: title.clone(),
            };
            PackageOutcome::failure(title, None, Stage::Resolving, error)
        }));
        Ok(outcomes)
    }

    /// Delete records and installed files. Without `source`, every source's copy goes.
    ///
    /// A file deletion error is reported in the outcome; the record is still removed.
    pub async fn remove(&self, titles: &[String], source: Option<&str>) -> Vec<PackageOutcome> {
        let source = source.map(str::to_string);
        let items = dedup_titles(titles)
            .into_iter()
            .map(|t| (t.clone(), t))
            .collect();
        self.run_each(items, move |pm, title: String| {
            let source = source.clone();
            async move { pm.remove_one(&title, source.as_deref()).await }
        })
        .await
    }

    async fn remove_one(&self, title: &str, source: Option<&str>) -> PackageOutcome {
        let records = match self.find_records(title, source) {
            Ok(records) if records.is_empty() => {
                let error = GdpmError::NotInstalled {
                    title: title.to_string(),
                };
                return PackageOutcome::failure(title, source.map(str::to_string), Stage::Resolving, error);
            }
            Ok(records) => records,
            Err(e) => return PackageOutcome::failure(title, source.map(str::to_string), Stage::Resolving, e),
        };

        let mut removed = 0;
        let mut path_errors = Vec::new();
        for record in &records {
            let _guard = self.locks().acquire(&record.title, &record.source).await;
            match self.with_db(|db| db.remove(&record.title, Some(&record.source))) {
                Ok(gone) => removed += gone.len(),
                Err(e) => {
                    return PackageOutcome::failure(title, Some(record.source.clone()), Stage::Installing, e);
                }
            }
            if let Err(e) = archive::remove_path(&record.install_path) {
                emit(
                    Level::Warn,
                    "package.remove_files_failed",
                    &format!(
                        "{} Could not delete {}: {e}",
                        char::from(NerdFont::Warning),
                        record.install_path.display()
                    ),
                    None,
                );
                path_errors.push(format!("{}: {e}", record.install_path.display()));
            }
            emit(
                Level::Success,
                "package.removed",
                &format!(
                    "{} Removed {} ({})",
                    char::from(NerdFont::Trash),
                    record.title,
                    record.source
                ),
                None,
            );
        }

        let source = match records.as_slice() {
            [only] => Some(only.source.clone()),
            _ => source.map(str::to_string),
        };
        PackageOutcome::success(
            title,
            source,
            Action::Removed {
                records: removed,
                path_errors,
            },
        )
    }

    /// Delete temporary archives and staging directories.
    ///
    /// With titles, only their artifacts go. Installed packages are never touched.
    pub fn clean(&self, titles: &[String]) -> Result<Vec<PathBuf>> {
        let tmp_dir = self.config().tmp_path();
        let entries = match fs::read_dir(&tmp_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GdpmError::store_io(&tmp_dir, e)),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GdpmError::store_io(&tmp_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_temp_artifact(&name) {
                continue;
            }
            if !titles.is_empty() && !titles.iter().any(|t| artifact_matches_title(&name, t)) {
                continue;
            }
            let path = entry.path();
            archive::remove_path(&path).map_err(|e| GdpmError::store_io(&path, e))?;
            removed.push(path);
        }
        removed.sort();
        Ok(removed)
    }

    /// Query the selected remotes (all when `remotes` is empty) concurrently
    pub async fn search(
        &self,
        params: &AssetQueryParams,
        remotes: &[String],
    ) -> Vec<(String, Result<Vec<AssetRecord>>)> {
        let config = self.config();
        let names: Vec<String> = if remotes.is_empty() {
            config.remote_sources.names()
        } else {
            remotes.to_vec()
        };

        let queries = names.iter().map(|name| async move {
            match config.remote_sources.get(name) {
                Some(source) => self.client().list_assets(source, params).await,
                None => Err(GdpmError::ConfigInvalid {
                    path: config.path.clone(),
                    reason: format!("unknown remote `{name}`"),
                }),
            }
        });
        let results = join_all(queries).await;
        names.into_iter().zip(results).collect()
    }

    pub fn list(&self, filter: &PackageFilter) -> Result<Vec<InstalledPackage>> {
        self.with_db(|db| db.list(filter))
    }

    /// Write installed titles to `path`, one per line, in a form `install --file` reads
    pub fn export(&self, path: &Path) -> Result<usize> {
        let mut titles: Vec<String> = self
            .list(&PackageFilter::default())?
            .into_iter()
            .map(|p| p.title)
            .collect();
        titles.sort_by_key(|t| t.to_lowercase());
        titles.dedup();

        let mut contents = titles.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| GdpmError::store_io(parent, e))?;
        }
        fs::write(path, contents).map_err(|e| GdpmError::store_io(path, e))?;
        Ok(titles.len())
    }

    pub fn link(&self, titles: &[String], dir: &Path, source: Option<&str>) -> Vec<PackageOutcome> {
        dedup_titles(titles)
            .iter()
            .map(|title| self.link_one(title, dir, source))
            .collect()
    }

    /// Symlink the installed copy of `title` into `dir`
    fn link_one(&self, title: &str, dir: &Path, source: Option<&str>) -> PackageOutcome {
        let record = match self.installed_or_fail(title, source) {
            Ok(record) => record,
            Err(outcome) => return *outcome,
        };
        let target = dir.join(sanitize_component(&record.title));

        match symlink_into(&record.install_path, &target) {
            Ok(()) => {
                emit(
                    Level::Success,
                    "package.linked",
                    &format!(
                        "{} Linked {} → {}",
                        char::from(NerdFont::Link),
                        record.title,
                        target.display()
                    ),
                    None,
                );
                PackageOutcome::success(title, Some(record.source), Action::Linked { target })
            }
            Err(e) => PackageOutcome::failure(
                title,
                Some(record.source),
                Stage::Installing,
                GdpmError::store_io(target, e),
            ),
        }
    }

    pub fn clone_into(&self, titles: &[String], dir: &Path, source: Option<&str>) -> Vec<PackageOutcome> {
        dedup_titles(titles)
            .iter()
            .map(|title| self.clone_one(title, dir, source))
            .collect()
    }

    /// Copy the installed files of `title` into `dir/<title>`
    fn clone_one(&self, title: &str, dir: &Path, source: Option<&str>) -> PackageOutcome {
        let record = match self.installed_or_fail(title, source) {
            Ok(record) => record,
            Err(outcome) => return *outcome,
        };
        let target = dir.join(sanitize_component(&record.title));
        if fs::symlink_metadata(&target).is_ok() {
            let error = io::Error::new(io::ErrorKind::AlreadyExists, "target already exists");
            return PackageOutcome::failure(
                title,
                Some(record.source),
                Stage::Installing,
                GdpmError::store_io(target, error),
            );
        }

        if let Err(e) = archive::copy_dir(&record.install_path, &target) {
            let _ = archive::remove_path(&target);
            return PackageOutcome::failure(
                title,
                Some(record.source),
                Stage::Installing,
                GdpmError::store_io(target, e),
            );
        }
        emit(
            Level::Success,
            "package.cloned",
            &format!(
                "{} Copied {} to {}",
                char::from(NerdFont::Folder),
                record.title,
                target.display()
            ),
            None,
        );
        PackageOutcome::success(title, Some(record.source), Action::Cloned { target })
    }

    fn installed_or_fail(
        &self,
        title: &str,
        source: Option<&str>,
    ) -> std::result::Result<InstalledPackage, Box<PackageOutcome>> {
        let fail = |error| {
            Box::new(PackageOutcome::failure(
                title,
                source.map(str::to_string),
                Stage::Resolving,
                error,
            ))
        };
        match self.find_installed(title, source) {
            Ok(Some(record)) if record.status == PackageStatus::Installed || record.status == PackageStatus::Stale => {
                Ok(record)
            }
            Ok(_) => Err(fail(GdpmError::NotInstalled {
                title: title.to_string(),
            })),
            Err(e) => Err(fail(e)),
        }
    }

    /// Refresh remote metadata of installed packages and mark changed ones `Stale`.
    ///
    /// Only packages from `remotes` are checked, or all when it is empty. Nothing is
    /// downloaded.
    pub async fn sync(&self, remotes: &[String]) -> Result<Vec<PackageOutcome>> {
        let records: Vec<(String, InstalledPackage)> = self
            .list(&PackageFilter::default())?
            .into_iter()
            .filter(|p| remotes.is_empty() || remotes.contains(&p.source))
            .map(|p| (p.title.clone(), p))
            .collect();

        Ok(self
            .run_each(records, |pm, record: InstalledPackage| async move {
                pm.sync_one(record).await
            })
            .await)
    }

    async fn sync_one(&self, record: InstalledPackage) -> PackageOutcome {
        let source = Some(record.source.clone());
        let Some(remote) = self.config().remote_sources.get(&record.source).cloned() else {
            let error = GdpmError::AssetNotFound {
                title: record.title.clone(),
            };
            return PackageOutcome::failure(record.title, source, Stage::Resolving, error);
        };
        let asset = match self.client().get_asset(&remote, &record.asset_id).await {
            Ok(asset) => asset,
            Err(e) => return PackageOutcome::failure(record.title, source, Stage::Resolving, e),
        };

        let remote_version = asset.version_label();
        let changed = remote_version != record.version
            || asset
                .checksum()
                .is_some_and(|h| !archive::checksums_match(h, &record.hash));

        let status = match (changed, record.status) {
            (true, _) => PackageStatus::Stale,
            (false, PackageStatus::Stale) => PackageStatus::Installed,
            (false, current) => current,
        };
        if status != record.status
            && let Err(e) = self.with_db(|db| db.set_status(&record.title, &record.source, status))
        {
            return PackageOutcome::failure(record.title, source, Stage::Resolving, e);
        }

        let action = if changed {
            emit(
                Level::Info,
                "package.stale",
                &format!(
                    "{} {} {} → {} available from '{}'",
                    char::from(NerdFont::Refresh),
                    record.title,
                    record.version,
                    remote_version,
                    record.source
                ),
                None,
            );
            Action::MarkedStale {
                installed: record.version,
                remote: remote_version,
            }
        } else {
            Action::UpToDate {
                version: record.version,
            }
        };
        PackageOutcome::success(record.title, source, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteSource, RemoteSources};
    use crate::error::ErrorKind;
    use crate::test_support::{StubServer, zip_archive};
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn manager(server: &StubServer, dir: &TempDir, remotes: &[(&str, &str)]) -> PackageManager {
        let mut remote_sources = RemoteSources::default();
        for (name, prefix) in remotes {
            remote_sources.add(RemoteSource::new(*name, server.url(prefix)));
        }
        let config = Config {
            path: dir.path().join("config.json"),
            packages_dir: dir.path().join("packages"),
            tmp_dir: dir.path().join("tmp"),
            remote_sources,
            threads: 4,
            timeout: 2_000,
            ..Config::default()
        };
        PackageManager::with_database(config, Database::open_in_memory().unwrap()).unwrap()
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Serve `title` from the remote mounted at `prefix`
    fn publish(
        server: &StubServer,
        prefix: &str,
        id: u32,
        title: &str,
        version: &str,
        archive: &[u8],
        hash: Option<String>,
    ) {
        let list = serde_json::json!({ "result": [{ "asset_id": id.to_string(), "title": title }] });
        server.route_query(
            &format!("{prefix}/asset"),
            &format!("filter={}", urlencoding::encode(title)),
            200,
            list.to_string(),
        );
        let detail = serde_json::json!({
            "asset_id": id.to_string(),
            "title": title,
            "version_string": version,
            "download_url": server.url(&format!("{prefix}/files/{id}.zip")),
            "download_hash": hash.unwrap_or_default(),
        });
        server.route(&format!("{prefix}/asset/{id}"), 200, detail.to_string());
        server.route(&format!("{prefix}/files/{id}.zip"), 200, archive.to_vec());
    }

    fn empty_remote(server: &StubServer, prefix: &str) {
        server.route(&format!("{prefix}/asset"), 200, r#"{"result": []}"#);
    }

    fn titles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn tmp_entries(pm: &PackageManager) -> Vec<String> {
        match fs::read_dir(pm.config().tmp_path()) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_dedup_titles() {
        assert_eq!(
            dedup_titles(&titles(&["Dialogic", " dialogic", "Kenney-Assets", "", "DIALOGIC"])),
            vec!["Dialogic", "Kenney-Assets"]
        );
    }

    #[test]
    fn test_read_title_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("packages.txt");
        fs::write(&path, "Dialogic\n# comment\n\nKenney-Assets  # trailing\n").unwrap();
        assert_eq!(read_title_list(&path).unwrap(), vec!["Dialogic", "Kenney-Assets"]);
    }

    #[tokio::test]
    async fn test_install_from_second_remote() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("kenney-main/addons/kenney/plugin.cfg", "[plugin]")]);
        empty_remote(&server, "/a");
        publish(&server, "/b", 7, "Kenney-Assets", "1.2", &archive, Some(sha256_hex(&archive)));
        server.route(
            "/b/asset",
            200,
            r#"{"result": [{"asset_id": 7, "title": "Kenney-Assets"}]}"#,
        );
        let pm = manager(&server, &dir, &[("a", "/a"), ("b", "/b")]);

        let outcomes = pm.install(&titles(&["kenney-assets"]), None, false).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success(), "{:?}", outcomes[0]);
        assert_eq!(outcomes[0].state(), Stage::Installed);
        assert_eq!(outcomes[0].source.as_deref(), Some("b"));

        let record = pm.find_installed("Kenney-Assets", None).unwrap().unwrap();
        assert_eq!(record.source, "b");
        assert_eq!(record.version, "1.2");
        assert_eq!(record.status, PackageStatus::Installed);
        assert_eq!(record.install_path, pm.install_path("b", "Kenney-Assets"));
        assert!(record.install_path.join("addons/kenney/plugin.cfg").exists());
        assert_eq!(server.hits("/a/asset"), 1);
    }

    #[tokio::test]
    async fn test_install_not_found_anywhere() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        empty_remote(&server, "/a");
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&["Missing"]), None, false).await;
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::AssetNotFound));
    }

    #[tokio::test]
    async fn test_install_without_remotes() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let pm = manager(&server, &dir, &[]);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::AssetNotFound));
    }

    #[tokio::test]
    async fn test_install_reports_error_when_every_remote_fails() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        server.route("/a/asset", 500, "boom");
        server.route("/b/asset", 200, "not json");
        let pm = manager(&server, &dir, &[("a", "/a"), ("b", "/b")]);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::RemoteMalformed));
    }

    #[tokio::test]
    async fn test_download_failure_leaves_no_record_or_temp_files() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        publish(&server, "/a", 1, "Dialogic", "2.0", b"unused", None);
        server.route("/a/files/1.zip", 500, "<html>error</html>");
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        let failure = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.stage, Stage::Fetching);
        assert_eq!(failure.error.kind(), ErrorKind::NetworkFailure);

        assert!(pm.find_installed("Dialogic", None).unwrap().is_none());
        assert!(tmp_entries(&pm).is_empty());
        assert!(!pm.install_path("a", "Dialogic").exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, Some("00".repeat(32)));
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        let failure = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.stage, Stage::Verifying);
        assert_eq!(failure.error.kind(), ErrorKind::IntegrityMismatch);
        assert!(pm.find_installed("Dialogic", None).unwrap().is_none());
        assert!(tmp_entries(&pm).is_empty());
    }

    #[tokio::test]
    async fn test_missing_checksum_is_accepted() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, None);
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        assert!(outcomes[0].is_success());
        let record = pm.find_installed("Dialogic", None).unwrap().unwrap();
        assert_eq!(record.hash, sha256_hex(&archive));
        // No wrapper directory to strip
        assert!(record.install_path.join("plugin.cfg").exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_partial_install() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        publish(&server, "/a", 1, "Dialogic", "2.0", b"not a zip", None);
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        let failure = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.stage, Stage::Installing);
        assert_eq!(failure.error.kind(), ErrorKind::PartialInstall);
        assert!(!pm.install_path("a", "Dialogic").exists());
        assert!(tmp_entries(&pm).is_empty());
    }

    #[tokio::test]
    async fn test_failed_record_write_removes_new_install() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, Some(sha256_hex(&archive)));
        let pm = manager(&server, &dir, &[("a", "/a")]);
        pm.with_db(|db| {
            db.execute_batch(
                "CREATE TRIGGER reject_insert BEFORE INSERT ON packages
                 BEGIN SELECT RAISE(ABORT, 'read-only store'); END;",
            )
        })
        .unwrap();

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        let failure = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.stage, Stage::Installing);
        assert_eq!(failure.error.kind(), ErrorKind::PartialInstall);
        assert!(!pm.install_path("a", "Dialogic").exists());
        assert!(pm.find_installed("Dialogic", None).unwrap().is_none());
        assert!(tmp_entries(&pm).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_installs() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let names = ["Alpha", "Beta", "Gamma", "Delta", "Epsilon", "Zeta"];
        for (i, name) in names.iter().enumerate() {
            let archive = zip_archive(&[(&format!("{name}/plugin.cfg")[..], *name)]);
            publish(&server, "/a", i as u32 + 1, name, "1.0", &archive, Some(sha256_hex(&archive)));
        }
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&names), None, false).await;
        assert_eq!(outcomes.len(), names.len());
        for (outcome, name) in outcomes.iter().zip(names) {
            assert_eq!(outcome.title, name);
            assert!(outcome.is_success(), "{outcome:?}");
        }
        assert_eq!(pm.list(&PackageFilter::default()).unwrap().len(), names.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_title_installs_once() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, Some(sha256_hex(&archive)));
        server.route_delayed("/a/files/1.zip", 200, archive.clone(), Duration::from_millis(50));
        server.route_query(
            "/a/asset",
            "filter=dialogic",
            200,
            r#"{"result": [{"asset_id": "1", "title": "Dialogic"}]}"#,
        );
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let one = titles(&["Dialogic"]);
        let other = titles(&["dialogic"]);
        let (first, second) = tokio::join!(pm.install(&one, None, false), pm.install(&other, None, false));

        let actions: Vec<&Action> = first
            .iter()
            .chain(second.iter())
            .map(|o| o.result.as_ref().unwrap())
            .collect();
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, Action::Installed { .. }))
                .count(),
            1
        );
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, Action::AlreadyInstalled { .. }))
                .count(),
            1
        );
        assert_eq!(server.hits("/a/files/1.zip"), 1);
        assert_eq!(pm.list(&PackageFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_titles_in_one_request() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, None);
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let outcomes = pm.install(&titles(&["Dialogic", "dialogic"]), None, false).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(server.hits("/a/files/1.zip"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let pm = manager(&server, &dir, &[("a", "/a")]);
        pm.cancel_flag().store(true, Ordering::SeqCst);

        let outcomes = pm.install(&titles(&["Dialogic"]), None, false).await;
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::Cancelled));
        assert_eq!(server.hits("/a/asset"), 0);
    }

    #[tokio::test]
    async fn test_update_skips_unchanged_and_replaces_changed() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let v1 = zip_archive(&[("dialogic/VERSION", "1")]);
        publish(&server, "/a", 1, "Dialogic", "1.0", &v1, Some(sha256_hex(&v1)));
        let pm = manager(&server, &dir, &[("a", "/a")]);
        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());

        let outcomes = pm.update(&[]).await.unwrap();
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &Action::UpToDate {
                version: "1.0".to_string()
            }
        );
        assert_eq!(server.hits("/a/files/1.zip"), 1);

        let v2 = zip_archive(&[("dialogic/VERSION", "2")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &v2, Some(sha256_hex(&v2)));
        let outcomes = pm.update(&titles(&["dialogic"])).await.unwrap();
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &Action::Updated {
                from: "1.0".to_string(),
                to: "2.0".to_string()
            }
        );
        let record = pm.find_installed("Dialogic", None).unwrap().unwrap();
        assert_eq!(record.version, "2.0");
        assert_eq!(fs::read_to_string(record.install_path.join("VERSION")).unwrap(), "2");
    }

    #[tokio::test]
    async fn test_failed_update_marks_record_failed() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let v1 = zip_archive(&[("dialogic/VERSION", "1")]);
        publish(&server, "/a", 1, "Dialogic", "1.0", &v1, None);
        let pm = manager(&server, &dir, &[("a", "/a")]);
        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());

        publish(&server, "/a", 1, "Dialogic", "2.0", b"corrupt", None);
        let outcomes = pm.update(&[]).await.unwrap();
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::PartialInstall));

        let record = pm.find_installed("Dialogic", None).unwrap().unwrap();
        assert_eq!(record.status, PackageStatus::Failed);
        assert_eq!(record.version, "1.0");
    }

    #[tokio::test]
    async fn test_update_unknown_title() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let pm = manager(&server, &dir, &[("a", "/a")]);
        let outcomes = pm.update(&titles(&["Nope"])).await.unwrap();
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::NotInstalled));
    }

    #[tokio::test]
    async fn test_remove() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, None);
        let pm = manager(&server, &dir, &[("a", "/a")]);
        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());
        let path = pm.install_path("a", "Dialogic");
        assert!(path.exists());

        let outcomes = pm.remove(&titles(&["Dialogic"]), None).await;
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &Action::Removed {
                records: 1,
                path_errors: Vec::new()
            }
        );
        assert!(!path.exists());
        assert!(pm.find_installed("Dialogic", None).unwrap().is_none());

        let outcomes = pm.remove(&titles(&["Dialogic"]), None).await;
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::NotInstalled));
    }

    #[tokio::test]
    async fn test_clean_is_idempotent_and_keeps_packages() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let pm = manager(&server, &dir, &[("a", "/a")]);
        assert!(pm.clean(&[]).unwrap().is_empty());

        let tmp = pm.config().tmp_path();
        fs::create_dir_all(tmp.join(".staging-a-Dialogic")).unwrap();
        fs::write(tmp.join("a-Dialogic.zip"), "zip").unwrap();
        fs::write(tmp.join("a-Kenney-Assets.zip"), "zip").unwrap();
        fs::write(tmp.join("notes.txt"), "keep").unwrap();
        let installed = pm.install_path("a", "Dialogic");
        fs::create_dir_all(&installed).unwrap();

        let removed = pm.clean(&titles(&["dialogic"])).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(tmp.join("a-Kenney-Assets.zip").exists());

        assert_eq!(pm.clean(&[]).unwrap().len(), 1);
        assert!(pm.clean(&[]).unwrap().is_empty());
        assert!(tmp.join("notes.txt").exists());
        assert!(installed.exists());
    }

    #[tokio::test]
    async fn test_clean_temporary_removes_archive_after_install() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, None);

        let pm = manager(&server, &dir, &[("a", "/a")]);
        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());
        assert_eq!(tmp_entries(&pm), vec!["a-Dialogic.zip"]);

        let dir2 = tempdir().unwrap();
        let mut config = manager(&server, &dir2, &[("a", "/a")]).config().clone();
        config.clean_temporary = true;
        let pm = PackageManager::with_database(config, Database::open_in_memory().unwrap()).unwrap();
        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());
        assert!(tmp_entries(&pm).is_empty());
    }

    #[tokio::test]
    async fn test_cached_archive_is_reused() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, Some(sha256_hex(&archive)));
        let pm = manager(&server, &dir, &[("a", "/a")]);

        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());
        let outcomes = pm.install(&titles(&["Dialogic"]), None, true).await;
        assert!(matches!(outcomes[0].result, Ok(Action::Installed { .. })));
        assert_eq!(server.hits("/a/files/1.zip"), 1);
    }

    #[tokio::test]
    async fn test_sync_marks_stale() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "1.0", &archive, None);
        let pm = manager(&server, &dir, &[("a", "/a")]);
        assert!(pm.install(&titles(&["Dialogic"]), None, false).await[0].is_success());

        let outcomes = pm.sync(&[]).await.unwrap();
        assert!(matches!(outcomes[0].result, Ok(Action::UpToDate { .. })));

        publish(&server, "/a", 1, "Dialogic", "1.1", &archive, None);
        let outcomes = pm.sync(&[]).await.unwrap();
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &Action::MarkedStale {
                installed: "1.0".to_string(),
                remote: "1.1".to_string()
            }
        );
        let record = pm.find_installed("Dialogic", None).unwrap().unwrap();
        assert_eq!(record.status, PackageStatus::Stale);
        assert_eq!(server.hits("/a/files/1.zip"), 1);
    }

    #[tokio::test]
    async fn test_link_clone_and_export() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        let archive = zip_archive(&[("dialogic/plugin.cfg", "[plugin]")]);
        publish(&server, "/a", 1, "Dialogic", "2.0", &archive, None);
        let pm = manager(&server, &dir, &[("a", "/a")]);

        let project = dir.path().join("project");
        let outcomes = pm.add(&titles(&["Dialogic"]), &project, None, false).await;
        let link = project.join("addons/Dialogic");
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &Action::Linked {
                target: link.clone()
            }
        );
        assert_eq!(fs::read_link(&link).unwrap(), pm.install_path("a", "Dialogic"));
        // Linking again to the same target is fine
        assert!(pm.link(&titles(&["Dialogic"]), &project.join("addons"), None)[0].is_success());

        let copies = dir.path().join("copies");
        let outcomes = pm.clone_into(&titles(&["Dialogic"]), &copies, None);
        assert!(outcomes[0].is_success());
        assert!(copies.join("Dialogic/plugin.cfg").is_file());
        assert!(!pm.clone_into(&titles(&["Dialogic"]), &copies, None)[0].is_success());

        let export = dir.path().join("packages.txt");
        assert_eq!(pm.export(&export).unwrap(), 1);
        assert_eq!(read_title_list(&export).unwrap(), vec!["Dialogic"]);

        let outcomes = pm.link(&titles(&["Missing"]), &project, None);
        assert_eq!(outcomes[0].state(), Stage::Failed(ErrorKind::NotInstalled));
    }

    #[tokio::test]
    async fn test_search_reports_per_remote() {
        let server = StubServer::start().await;
        let dir = tempdir().unwrap();
        server.route(
            "/a/asset",
            200,
            r#"{"result": [{"asset_id": 1, "title": "Dialogic"}]}"#,
        );
        server.route("/b/asset", 503, "");
        let pm = manager(&server, &dir, &[("a", "/a"), ("b", "/b")]);

        let results = pm
            .search(&AssetQueryParams::for_title("dia"), &[])
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[0].1.as_ref().unwrap()[0].title, "Dialogic");
        assert_eq!(
            results[1].1.as_ref().unwrap_err().kind(),
            ErrorKind::NetworkFailure
        );

        let results = pm
            .search(&AssetQueryParams::for_title("dia"), &titles(&["nope"]))
            .await;
        assert_eq!(results[0].1.as_ref().unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }
}
