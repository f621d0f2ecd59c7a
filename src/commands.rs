//! Maps parsed commands onto package, registry and configuration operations and
//! reports their outcomes.

use anyhow::{Context, Result};
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{ContentArrangement, Table};
use serde_json::json;
use std::sync::atomic::Ordering;

use crate::cache::{InstalledPackage, PackageFilter};
use crate::cli::{Commands, ConfigCommands, ConfigOverrides, RemoteCommands, SearchArgs};
use crate::common::progress::create_spinner;
use crate::config::Config;
use crate::package::{self, Action, PackageManager, PackageOutcome};
use crate::rest_api::AssetRecord;
use crate::ui::prelude::*;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Run one command.
///
/// `config` is the persisted configuration; registry and `config set` commands mutate
/// it and the caller saves it. Package commands run with `overrides` applied on a copy.
/// Returns the process exit code.
pub async fn handle_command(
    command: Commands,
    config: &mut Config,
    overrides: &ConfigOverrides,
) -> Result<i32> {
    match command {
        Commands::Config { command } => handle_config_command(command, config),
        Commands::Remote { command } => handle_remote_command(command, config),
        Commands::Search(args) => {
            let pm = open_manager(effective_config(config, overrides))?;
            handle_search(&pm, &args).await
        }
        command => {
            let pm = open_manager(effective_config(config, overrides))?;
            handle_package_command(command, &pm).await
        }
    }
}

fn effective_config(config: &Config, overrides: &ConfigOverrides) -> Config {
    let mut run = config.clone();
    overrides.apply(&mut run);
    run
}

fn open_manager(config: Config) -> Result<PackageManager> {
    let packages_dir = config.packages_path();
    let pm = PackageManager::new(config)
        .with_context(|| format!("opening package store in {}", packages_dir.display()))?;

    // First Ctrl-C stops dequeuing, a second one exits immediately
    let cancel = pm.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        cancel.store(true, Ordering::SeqCst);
        emit(
            Level::Warn,
            "package.cancelling",
            &format!(
                "{} Cancelling: waiting for running packages to finish",
                char::from(NerdFont::Warning)
            ),
            None,
        );
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    Ok(pm)
}

async fn handle_package_command(command: Commands, pm: &PackageManager) -> Result<i32> {
    let outcomes = match command {
        Commands::Install {
            mut titles,
            file,
            remote,
            force,
        } => {
            if let Some(file) = file {
                titles.extend(package::read_title_list(&file)?);
            }
            if titles.is_empty() {
                anyhow::bail!("no package titles given");
            }
            pm.install(&titles, remote.as_deref(), force).await
        }
        Commands::Add {
            titles,
            path,
            remote,
            force,
        } => pm.add(&titles, &path, remote.as_deref(), force).await,
        Commands::Remove { titles, remote } => {
            if !confirm_remove(pm, &titles, remote.as_deref())? {
                emit(
                    Level::Info,
                    "package.remove_cancelled",
                    &format!("{} Nothing removed", char::from(NerdFont::Info)),
                    None,
                );
                return Ok(EXIT_SUCCESS);
            }
            pm.remove(&titles, remote.as_deref()).await
        }
        Commands::Update { titles } => pm.update(&titles).await?,
        Commands::Fetch { remotes } => pm.sync(&remotes).await?,
        Commands::Sync { remotes } => {
            if !pm.config().enable_sync {
                emit(
                    Level::Warn,
                    "package.sync_disabled",
                    &format!(
                        "{} Syncing is disabled (enable_sync = false); use `gdpm fetch` to force it",
                        char::from(NerdFont::Warning)
                    ),
                    None,
                );
                return Ok(EXIT_SUCCESS);
            }
            pm.sync(&remotes).await?
        }
        Commands::Link {
            title,
            path,
            remote,
        } => pm.link(&[title], &path, remote.as_deref()),
        Commands::Clone {
            title,
            path,
            remote,
        } => pm.clone_into(&[title], &path, remote.as_deref()),
        Commands::Export { paths } => {
            for path in &paths {
                let count = pm.export(path)?;
                emit(
                    Level::Success,
                    "package.exported",
                    &format!(
                        "{} Wrote {count} package title(s) to {}",
                        char::from(NerdFont::File),
                        path.display()
                    ),
                    Some(json!({ "path": path, "count": count })),
                );
            }
            return Ok(EXIT_SUCCESS);
        }
        Commands::List { filter, remote } => {
            let filter = PackageFilter {
                title: filter,
                source: remote,
                status: None,
            };
            print_installed(&pm.list(&filter)?);
            return Ok(EXIT_SUCCESS);
        }
        Commands::Clean { titles } => {
            let removed = pm.clean(&titles)?;
            emit(
                Level::Success,
                "package.cleaned",
                &format!(
                    "{} Removed {} temporary file(s)",
                    char::from(NerdFont::Trash),
                    removed.len()
                ),
                Some(json!({ "removed": removed })),
            );
            return Ok(EXIT_SUCCESS);
        }
        Commands::Search(_) | Commands::Config { .. } | Commands::Remote { .. } => {
            return Ok(EXIT_SUCCESS);
        }
    };

    Ok(report_outcomes(&outcomes))
}

fn confirm_remove(pm: &PackageManager, titles: &[String], remote: Option<&str>) -> Result<bool> {
    let titles = package::dedup_titles(titles);
    if pm.config().skip_prompt || (titles.len() == 1 && remote.is_some()) {
        return Ok(true);
    }
    Ok(dialoguer::Confirm::new()
        .with_prompt(format!("Remove {}?", titles.join(", ")))
        .default(false)
        .interact()?)
}

/// Print one line per package and a summary. Returns the exit code.
pub fn report_outcomes(outcomes: &[PackageOutcome]) -> i32 {
    let mut failed = 0;
    for outcome in outcomes {
        let source = outcome.source.as_deref().unwrap_or("-");
        match &outcome.result {
            Ok(action) => report_action(&outcome.title, source, action),
            Err(failure) => {
                failed += 1;
                emit(
                    Level::Error,
                    "package.failed",
                    &format!(
                        "{} {} ({}) failed while {}: {}",
                        char::from(NerdFont::Cross),
                        outcome.title,
                        source,
                        failure.stage,
                        failure.error
                    ),
                    Some(json!({
                        "title": outcome.title,
                        "source": outcome.source,
                        "stage": failure.stage.to_string(),
                        "kind": failure.error.kind().as_str(),
                        "error": failure.error.to_string(),
                    })),
                );
            }
        }
    }

    let succeeded = outcomes.len() - failed;
    if outcomes.len() > 1 || failed > 0 {
        emit(
            if failed == 0 { Level::Success } else { Level::Warn },
            "package.summary",
            &format!("{succeeded} succeeded, {failed} failed"),
            Some(json!({ "succeeded": succeeded, "failed": failed })),
        );
    }
    if failed == 0 { EXIT_SUCCESS } else { EXIT_FAILURE }
}

fn report_action(title: &str, source: &str, action: &Action) {
    // Installs, removals, links and copies are announced as they happen
    let message = match action {
        Action::AlreadyInstalled { version } => format!(
            "{} {title} {version} is already installed from '{source}'",
            char::from(NerdFont::Info)
        ),
        Action::UpToDate { version } => format!(
            "{} {title} {version} is up to date",
            char::from(NerdFont::Check)
        ),
        _ => return,
    };
    emit(
        Level::Info,
        "package.unchanged",
        &message,
        Some(json!({ "title": title, "source": source })),
    );
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_installed(packages: &[InstalledPackage]) {
    if get_output_format() == OutputFormat::Json {
        for pkg in packages {
            emit(
                Level::Info,
                "package.entry",
                &pkg.title,
                Some(json!({
                    "title": pkg.title,
                    "source": pkg.source,
                    "asset_id": pkg.asset_id,
                    "version": pkg.version,
                    "status": pkg.status.as_str(),
                    "path": pkg.install_path,
                    "updated_at": pkg.updated_at,
                })),
            );
        }
        return;
    }

    if packages.is_empty() {
        emit(
            Level::Info,
            "package.none",
            &format!("{} No packages installed", char::from(NerdFont::Package)),
            None,
        );
        return;
    }
    let mut table = new_table(vec!["Title", "Source", "Version", "Status", "Path"]);
    for pkg in packages {
        table.add_row(vec![
            pkg.title.clone(),
            pkg.source.clone(),
            pkg.version.clone(),
            pkg.status.to_string(),
            pkg.install_path.display().to_string(),
        ]);
    }
    println!("{table}");
}

async fn handle_search(pm: &PackageManager, args: &SearchArgs) -> Result<i32> {
    let params = args.to_params(&pm.config().godot_version);
    let spinner = create_spinner(format!("Searching for '{}'...", params.filter));
    let results = pm.search(&params, &args.remotes).await;
    spinner.finish_and_clear();

    let mut code = EXIT_SUCCESS;
    for (remote, result) in results {
        match result {
            Ok(assets) => print_assets(&remote, &assets),
            Err(e) => {
                code = EXIT_FAILURE;
                emit(
                    Level::Error,
                    "search.failed",
                    &format!("{} Remote '{remote}': {e}", char::from(NerdFont::Cross)),
                    Some(json!({ "remote": remote, "kind": e.kind().as_str() })),
                );
            }
        }
    }
    Ok(code)
}

fn print_assets(remote: &str, assets: &[AssetRecord]) {
    if get_output_format() == OutputFormat::Json {
        for asset in assets {
            emit(
                Level::Info,
                "search.result",
                &asset.title,
                Some(json!({ "remote": remote, "asset": asset })),
            );
        }
        return;
    }

    println!(
        "{} {remote}: {} result(s)",
        char::from(NerdFont::Search),
        assets.len()
    );
    if assets.is_empty() {
        return;
    }
    let mut table = new_table(vec!["ID", "Title", "Author", "Version", "Godot", "Support"]);
    for asset in assets {
        table.add_row(vec![
            asset.asset_id.clone(),
            asset.title.clone(),
            asset.author.clone().unwrap_or_default(),
            asset.version_label(),
            asset.godot_version.clone().unwrap_or_default(),
            asset.support_level.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
}

fn handle_config_command(command: ConfigCommands, config: &mut Config) -> Result<i32> {
    match command {
        ConfigCommands::Get { properties } => {
            let names = if properties.is_empty() {
                config.property_names()
            } else {
                properties
            };
            for name in names {
                let value = config.get_property(&name)?;
                let shown = if name == "password" && !value.is_empty() {
                    "********".to_string()
                } else {
                    value.clone()
                };
                emit(
                    Level::Info,
                    "config.property",
                    &format!("{name} = {shown}"),
                    Some(json!({ "property": name, "value": shown })),
                );
            }
        }
        ConfigCommands::Set { property, value } => {
            config.set_property(&property, &value)?;
            emit(
                Level::Success,
                "config.set",
                &format!("{} {property} = {value}", char::from(NerdFont::Gear)),
                Some(json!({ "property": property })),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn handle_remote_command(command: RemoteCommands, config: &mut Config) -> Result<i32> {
    match command {
        RemoteCommands::Add { name, url } => {
            let added = config.add_remote(&name, &url)?;
            let verb = if added { "Added" } else { "Updated" };
            emit(
                Level::Success,
                "remote.added",
                &format!("{} {verb} remote '{name}' → {url}", char::from(NerdFont::Server)),
                Some(json!({ "name": name, "url": url, "new": added })),
            );
        }
        RemoteCommands::Remove { names } => {
            for name in names {
                match config.remove_remote(&name) {
                    Some(_) => emit(
                        Level::Success,
                        "remote.removed",
                        &format!(
                            "{} Removed remote '{name}'; packages installed from it are kept",
                            char::from(NerdFont::Trash)
                        ),
                        Some(json!({ "name": name })),
                    ),
                    None => emit(
                        Level::Warn,
                        "remote.unknown",
                        &format!("{} No remote named '{name}'", char::from(NerdFont::Warning)),
                        Some(json!({ "name": name })),
                    ),
                }
            }
        }
        RemoteCommands::List => print_remotes(config),
    }
    Ok(EXIT_SUCCESS)
}

fn print_remotes(config: &Config) {
    if get_output_format() == OutputFormat::Json {
        for remote in &config.remote_sources {
            emit(
                Level::Info,
                "remote.entry",
                &remote.name,
                Some(json!({
                    "name": remote.name,
                    "url": remote.url,
                    "token": remote.token.is_some(),
                })),
            );
        }
        return;
    }

    let mut table = new_table(vec!["Name", "URL", "Token"]);
    for remote in &config.remote_sources {
        table.add_row(vec![
            remote.name.clone(),
            remote.url.clone(),
            if remote.token.is_some() { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{table}");
}
