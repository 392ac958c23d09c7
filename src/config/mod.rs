// Layered configuration system

pub mod loader;

pub use loader::{
    validate_config, ConfigLoader, ConflictConfig, EscalationFallback, ExecutionConfig,
    ParallelConfig, PhaseMultipliers, PoolConfig, PoolsConfig, ResourceConfig, ScalingConfig,
    TokenConfig,
};

use anyhow::Result;
use std::path::Path;

/// Load and merge configuration from all sources
/// Priority: explicit file -> Project -> Global -> Defaults
pub fn load_merged_config(
    project_path: Option<&Path>,
    explicit_file: Option<&Path>,
) -> Result<ParallelConfig> {
    let loader = match project_path {
        Some(path) => ConfigLoader::new().with_project_path(path),
        None => ConfigLoader::new(),
    };

    if let Some(file) = explicit_file {
        return loader
            .load_from_path(file)?
            .ok_or_else(|| anyhow::anyhow!("Config file '{}' not found", file.display()));
    }

    loader.load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_file_must_exist() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        assert!(load_merged_config(None, Some(&missing)).is_err());
    }

    #[test]
    fn test_explicit_file_is_used() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("custom.toml");
        fs::write(&file, "[execution]\nmaxParallelCycles = 6\n").unwrap();

        let config = load_merged_config(Some(temp_dir.path()), Some(&file)).unwrap();
        assert_eq!(config.execution.max_parallel_cycles, 6);
    }
}
