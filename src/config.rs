use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs::File, io::BufReader};

/// Capacity limits for one executor run. Every field has a fixed default;
/// a YAML file named on the command line may override them.
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Maximum number of tasks accepted over the whole run.
    pub max_tasks: usize,
    /// Longest observable line on a task's stdout or stderr, in bytes.
    pub line_length: usize,
    /// Longest accepted input line, in bytes.
    pub command_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tasks: 4096,
            line_length: 1022,
            command_length: 511,
        }
    }
}

pub fn load_limits(file_path: &str) -> Result<Limits> {
    let file = File::open(file_path)
        .with_context(|| format!("failed to open limits file {file_path}"))?;
    let reader = BufReader::new(file);
    let limits: Limits = serde_yaml::from_reader(reader)
        .with_context(|| format!("failed to parse limits file {file_path}"))?;
    if limits.max_tasks < 1 {
        bail!("max_tasks must be at least 1");
    }
    if limits.line_length < 1 || limits.command_length < 1 {
        bail!("line_length and command_length must be at least 1");
    }
    Ok(limits)
}
