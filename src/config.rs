//! Run configuration, read from a JSON file
//!
//! ```json
//! {
//!   "machine": {"memory_size": "2GiB", "cores": 9},
//!   "workload": {"trace": "matrix-multiply.trace", "arguments": ["100", "8"]},
//!   "catalog": "looppoint-pinpoints.csv",
//!   "checkpoint_dir": "checkpoint_outputs"
//! }
//! ```
use crate::{Error, Result, TrackerOptions, catalog::parse_u64};
use clap::Args;
use serde::{Deserialize, Deserializer, Serialize, de};
use size::Size;
use std::path::{Path, PathBuf};

/// Parse a memory size such as `2GiB`, `512MB` or a plain byte count.
/// Units are binary: `kB`, `KiB` and friends all mean powers of 1024.
pub fn parse_memory_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: u64 = number.parse().ok()?;
    let shift = match unit.trim() {
        "" | "B" => 0,
        "kB" | "KB" | "KiB" => 10,
        "MB" | "MiB" => 20,
        "GB" | "GiB" => 30,
        "TB" | "TiB" => 40,
        _ => return None,
    };
    number.checked_mul(1u64 << shift)
}

fn memory_size<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(bytes),
        Raw::Text(text) => parse_memory_size(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid memory size {text:?}"))),
    }
}

fn default_memory_size() -> u64 {
    2 << 30
}

fn default_cores() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfig {
    /// bytes, or a string like "2GiB"
    #[serde(default = "default_memory_size", deserialize_with = "memory_size")]
    pub memory_size: u64,
    #[serde(default = "default_cores")]
    pub cores: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: default_memory_size(),
            cores: default_cores(),
        }
    }
}

impl MachineConfig {
    pub fn describe(&self) -> String {
        format!(
            "{} cores, {} of memory",
            self.cores,
            Size::from_bytes(self.memory_size)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// Path to the instruction trace
    pub trace: PathBuf,
    /// Command line args the trace was recorded with
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    #[serde(default)]
    pub machine: MachineConfig,
    pub workload: WorkloadConfig,
    /// Region catalog, CSV or JSON
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    /// Only this region of the catalog
    #[serde(default)]
    pub region: Option<String>,
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_true")]
    pub update_relatives: bool,
    #[serde(default = "default_true")]
    pub exit_when_empty: bool,
    #[serde(default)]
    pub max_instructions: Option<u64>,
    /// Append statistics here, print them as tables otherwise
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(trace: PathBuf, checkpoint_dir: PathBuf) -> Self {
        Self {
            machine: MachineConfig::default(),
            workload: WorkloadConfig {
                trace,
                arguments: vec![],
            },
            catalog: None,
            region: None,
            checkpoint_dir,
            update_relatives: true,
            exit_when_empty: true,
            max_instructions: None,
            stats_path: None,
        }
    }

    pub fn parse(origin: &str, content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|err| Error::configuration(origin, err.to_string()))?;
        config.validate(origin)?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::configuration(&origin, err.to_string()))?;
        Self::parse(&origin, &content)
    }

    pub fn validate(&self, origin: &str) -> Result<()> {
        if self.machine.cores == 0 {
            return Err(Error::configuration(origin, "machine needs at least one core"));
        }
        if self.machine.memory_size == 0 {
            return Err(Error::configuration(origin, "machine needs some memory"));
        }
        if self.max_instructions == Some(0) {
            return Err(Error::configuration(
                origin,
                "max_instructions must be positive when given",
            ));
        }
        Ok(())
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            update_relatives: self.update_relatives,
            exit_when_empty: self.exit_when_empty,
        }
    }
}

/// Command line options shared by the binaries; flags override the file
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Path to a JSON run configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to trace file
    #[arg(short, long)]
    pub trace: Option<PathBuf>,

    /// Command line args of the workload, comma separated
    #[arg(long, value_delimiter = ',')]
    pub arguments: Vec<String>,

    /// Checkpoint directory
    #[arg(short = 'd', long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Region catalog, CSV or JSON
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Number of cores
    #[arg(long)]
    pub cores: Option<usize>,

    /// Memory size, e.g. 2GiB
    #[arg(long, value_parser = parse_size_arg)]
    pub memory_size: Option<u64>,

    /// Stop after this many instructions
    #[arg(long, value_parser = parse_count)]
    pub max_instructions: Option<u64>,

    /// Append statistics to this file instead of printing them
    #[arg(long)]
    pub stats_path: Option<PathBuf>,

    /// Keep relative targets anchored at the first fired location
    #[arg(long)]
    pub fixed_anchor: bool,

    /// Keep running after every region was reached
    #[arg(long)]
    pub no_exit_when_empty: bool,
}

impl RunArgs {
    pub fn resolve(&self) -> Result<RunConfig> {
        let origin = "command line";
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => {
                let Some(trace) = &self.trace else {
                    return Err(Error::configuration(origin, "either --config or --trace is required"));
                };
                RunConfig::new(trace.clone(), PathBuf::from("checkpoint_outputs"))
            }
        };
        if let Some(trace) = &self.trace {
            config.workload.trace = trace.clone();
        }
        if !self.arguments.is_empty() {
            config.workload.arguments = self.arguments.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(catalog) = &self.catalog {
            config.catalog = Some(catalog.clone());
        }
        if let Some(cores) = self.cores {
            config.machine.cores = cores;
        }
        if let Some(memory_size) = self.memory_size {
            config.machine.memory_size = memory_size;
        }
        if self.max_instructions.is_some() {
            config.max_instructions = self.max_instructions;
        }
        if let Some(stats_path) = &self.stats_path {
            config.stats_path = Some(stats_path.clone());
        }
        if self.fixed_anchor {
            config.update_relatives = false;
        }
        if self.no_exit_when_empty {
            config.exit_when_empty = false;
        }
        config.validate(origin)?;
        Ok(config)
    }
}

fn parse_size_arg(text: &str) -> std::result::Result<u64, String> {
    parse_memory_size(text).ok_or_else(|| format!("invalid memory size {text:?}"))
}

/// Instruction counts on the command line: decimal or `0x` hex
pub fn parse_count(text: &str) -> std::result::Result<u64, String> {
    parse_u64(text).ok_or_else(|| format!("invalid count {text:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_size() {
        assert_eq!(parse_memory_size("2GiB"), Some(2 << 30));
        assert_eq!(parse_memory_size("2GB"), Some(2 << 30));
        assert_eq!(parse_memory_size("32kB"), Some(32 << 10));
        assert_eq!(parse_memory_size("4096"), Some(4096));
        assert_eq!(parse_memory_size("2 MiB"), Some(2 << 20));
        assert_eq!(parse_memory_size("GiB"), None);
        assert_eq!(parse_memory_size("3PB"), None);
        assert_eq!(parse_memory_size("99999999999TB"), None);
    }

    #[test]
    fn test_parse() {
        let config = RunConfig::parse(
            "config.json",
            r#"{
                "machine": {"memory_size": "2GiB", "cores": 9},
                "workload": {"trace": "mm.trace", "arguments": ["100", "8"]},
                "catalog": "pinpoints.csv",
                "checkpoint_dir": "checkpoint_outputs",
                "update_relatives": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.machine.memory_size, 2 << 30);
        assert_eq!(config.machine.cores, 9);
        assert_eq!(config.workload.arguments, ["100", "8"]);
        assert!(!config.tracker_options().update_relatives);
        assert!(config.tracker_options().exit_when_empty);
        assert_eq!(config.max_instructions, None);

        let defaults = RunConfig::parse(
            "config.json",
            r#"{"workload": {"trace": "mm.trace"}, "checkpoint_dir": "out", "machine": {"memory_size": 1024}}"#,
        )
        .unwrap();
        assert_eq!(defaults.machine.cores, 1);
        assert_eq!(defaults.machine.memory_size, 1024);
    }

    #[test]
    fn test_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"workload": {"trace": "mm.trace"}, "checkpoint_dir": "out", "machine": {"cores": 9}}"#,
        )
        .unwrap();
        let args = RunArgs {
            config: Some(path),
            checkpoint_dir: Some(PathBuf::from("elsewhere")),
            memory_size: parse_size_arg("4GiB").ok(),
            fixed_anchor: true,
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.workload.trace, PathBuf::from("mm.trace"));
        assert_eq!(config.checkpoint_dir, PathBuf::from("elsewhere"));
        assert_eq!(config.machine.cores, 9);
        assert_eq!(config.machine.memory_size, 4 << 30);
        assert!(!config.update_relatives);

        assert!(RunArgs::default().resolve().is_err());
        let config = RunArgs {
            trace: Some(PathBuf::from("t")),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.checkpoint_dir, PathBuf::from("checkpoint_outputs"));
    }

    #[test]
    fn test_invalid() {
        for content in [
            r#"{"workload": {"trace": "t"}}"#,
            r#"{"workload": {"trace": "t"}, "checkpoint_dir": "o", "machine": {"memory_size": "lots"}}"#,
            r#"{"workload": {"trace": "t"}, "checkpoint_dir": "o", "machine": {"cores": 0}}"#,
            r#"{"workload": {"trace": "t"}, "checkpoint_dir": "o", "max_instructions": 0}"#,
        ] {
            assert!(matches!(
                RunConfig::parse("config.json", content),
                Err(Error::Configuration { .. })
            ));
        }
    }
}
