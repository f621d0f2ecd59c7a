use anyhow::Result;
use std::process::Command;

use super::common::TestEnvironment;

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run the gdpm binary against the test environment's config
pub fn run_gdpm(env: &TestEnvironment, args: &[&str]) -> Result<CommandOutput> {
    let config_path = env.config_path();
    let output = Command::new(env!("CARGO_BIN_EXE_gdpm"))
        .arg("--config-path")
        .arg(&config_path)
        .arg("--no-color")
        .args(args)
        .env("HOME", env.home())
        .env("XDG_CONFIG_HOME", env.home().join(".config"))
        .env("XDG_DATA_HOME", env.home().join(".local/share"))
        .current_dir(env.path())
        .output()?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Run with packages and temp directories pointed into the test environment
pub fn run_gdpm_isolated(env: &TestEnvironment, args: &[&str]) -> Result<CommandOutput> {
    let packages_dir = env.packages_dir();
    let tmp_dir = env.tmp_dir();
    let mut full = vec![
        "--packages-dir",
        packages_dir.to_str().unwrap_or_default(),
        "--tmp-dir",
        tmp_dir.to_str().unwrap_or_default(),
    ];
    full.extend_from_slice(args);
    run_gdpm(env, &full)
}

/// Parse JSON-lines output
pub fn json_lines(stdout: &str) -> Vec<serde_json::Value> {
    stdout
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}
