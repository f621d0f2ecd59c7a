use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use std::path::PathBuf;

use crate::config::Config;
use crate::rest_api::{AssetQueryParams, AssetType, DEFAULT_MAX_RESULTS, SortKey, SupportLevel};
use crate::ui::OutputFormat;

/// Package manager for the Godot asset library
#[derive(Parser, Debug)]
#[command(name = "gdpm", author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Output format
    #[arg(long = "output", short = 'o', value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings that replace configured values for this run only
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Configuration file to use
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub config_path: Option<PathBuf>,

    /// Directory packages are installed into
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    pub packages_dir: Option<PathBuf>,

    /// Directory for downloads and staging
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    pub tmp_dir: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Number of packages processed in parallel
    #[arg(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    /// Godot version used to filter remote results
    #[arg(long, global = true)]
    pub godot_version: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Answer yes to confirmation prompts
    #[arg(short = 'y', long, global = true)]
    pub skip_prompt: bool,

    /// Delete downloaded archives after installing
    #[arg(long, global = true)]
    pub clean: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.packages_dir {
            config.packages_dir = dir.clone();
        }
        if let Some(dir) = &self.tmp_dir {
            config.tmp_dir = dir.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(jobs) = self.jobs {
            config.threads = jobs;
        }
        if let Some(version) = &self.godot_version {
            config.godot_version = version.clone();
        }
        if self.verbose > 0 {
            config.verbose = self.verbose;
        }
        config.skip_prompt |= self.skip_prompt;
        config.clean_temporary |= self.clean;
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Install packages from the configured remotes
    Install {
        /// Package titles
        titles: Vec<String>,
        /// Read more titles from a file, one per line
        #[arg(long, value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
        /// Only resolve against this remote
        #[arg(long)]
        remote: Option<String>,
        /// Reinstall even when the same version is installed
        #[arg(long)]
        force: bool,
    },
    /// Install packages and link them into a project's addons directory
    Add {
        #[arg(required = true)]
        titles: Vec<String>,
        /// Godot project directory
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        path: PathBuf,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Remove installed packages
    Remove {
        #[arg(required = true)]
        titles: Vec<String>,
        /// Only remove the copy installed from this remote
        #[arg(long)]
        remote: Option<String>,
    },
    /// Update installed packages (all when no titles are given)
    Update { titles: Vec<String> },
    /// Search the asset library
    Search(SearchArgs),
    /// Write installed package titles to files
    Export {
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        paths: Vec<PathBuf>,
    },
    /// List installed packages
    List {
        /// Only titles containing this text
        filter: Option<String>,
        #[arg(long)]
        remote: Option<String>,
    },
    /// Symlink an installed package into a directory
    Link {
        title: String,
        #[arg(value_hint = ValueHint::DirPath)]
        path: PathBuf,
        #[arg(long)]
        remote: Option<String>,
    },
    /// Copy an installed package into a directory
    Clone {
        title: String,
        #[arg(value_hint = ValueHint::DirPath)]
        path: PathBuf,
        #[arg(long)]
        remote: Option<String>,
    },
    /// Delete temporary downloads (all, or those of the given titles)
    Clean { titles: Vec<String> },
    /// Read or change configuration properties
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Refresh remote metadata of installed packages
    Fetch {
        /// Remotes to check (all when empty)
        remotes: Vec<String>,
    },
    /// Like fetch, but honors `enable_sync`
    Sync { remotes: Vec<String> },
    /// Manage remote asset library sources
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Text to search for
    pub query: Option<String>,
    #[arg(long = "type", value_enum, default_value_t = AssetType::Any)]
    pub asset_type: AssetType,
    #[arg(long)]
    pub category: Option<u32>,
    #[arg(long, value_enum, default_value_t = SupportLevel::All)]
    pub support: SupportLevel,
    /// Only assets by this author
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long, value_enum, default_value_t = SortKey::None)]
    pub sort: SortKey,
    #[arg(long)]
    pub reverse: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_RESULTS)]
    pub max_results: u32,
    #[arg(long, default_value_t = 0)]
    pub page: u32,
    /// Remotes to search (all when not given)
    #[arg(long = "remote")]
    pub remotes: Vec<String>,
}

impl SearchArgs {
    pub fn to_params(&self, godot_version: &str) -> AssetQueryParams {
        AssetQueryParams {
            asset_type: self.asset_type,
            category: self.category,
            support: self.support,
            filter: self.query.clone().unwrap_or_default(),
            user: self.user.clone().unwrap_or_default(),
            godot_version: godot_version.to_string(),
            max_results: self.max_results,
            page: self.page,
            sort: self.sort,
            reverse: self.reverse,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print properties (all when none are named)
    Get { properties: Vec<String> },
    /// Set a property
    Set { property: String, value: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RemoteCommands {
    /// Add or replace a remote
    Add { name: String, url: String },
    /// Remove a remote
    Remove { names: Vec<String> },
    /// List remotes in priority order
    List,
}
