// Configuration file loading

use crate::models::AgentRole;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Process-wide engine configuration, read-only after startup
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParallelConfig {
    /// Execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Per-role agent pools
    #[serde(default)]
    pub pools: PoolsConfig,
    /// Pool auto-scaling thresholds
    #[serde(default)]
    pub scaling: ScalingConfig,
    /// Global compute capacity
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Context-token budget
    #[serde(default)]
    pub tokens: TokenConfig,
    /// Conflict prediction and escalation
    #[serde(default)]
    pub conflicts: ConflictConfig,
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum concurrently executing cycles
    #[serde(rename = "maxParallelCycles", alias = "max_parallel_cycles", default = "default_max_parallel")]
    pub max_parallel_cycles: usize,
    /// How long a phase waits for an agent before AgentPoolExhausted
    #[serde(rename = "agentTimeoutSecs", alias = "agent_timeout_secs", default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// Retries for retryable agent execution errors
    #[serde(rename = "maxRetries", alias = "max_retries", default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "initialBackoffMs", alias = "initial_backoff_ms", default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(rename = "maxBackoffMs", alias = "max_backoff_ms", default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(rename = "backoffMultiplier", alias = "backoff_multiplier", default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Period of the maintenance loop (scaling, rebalancing, expiry)
    #[serde(rename = "maintenanceIntervalSecs", alias = "maintenance_interval_secs", default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Predicted CRITICAL conflicts at or above this probability are rejected at admission
    #[serde(rename = "rejectConflictProbability", alias = "reject_conflict_probability", default = "default_reject_probability")]
    pub reject_conflict_probability: f64,
}

fn default_max_parallel() -> usize { 3 }
fn default_agent_timeout() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_maintenance_interval() -> u64 { 15 }
fn default_reject_probability() -> f64 { 0.9 }

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_cycles: default_max_parallel(),
            agent_timeout_secs: default_agent_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            maintenance_interval_secs: default_maintenance_interval(),
            reject_conflict_probability: default_reject_probability(),
        }
    }
}

/// One role's pool: size bounds plus the fixed allow-list and ceiling every agent carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(rename = "minSize", alias = "min_size", default = "default_min_size")]
    pub min_size: usize,
    #[serde(rename = "maxSize", alias = "max_size", default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(rename = "securityLevel", alias = "security_level", default = "default_security_level")]
    pub security_level: u8,
    /// Memory ceiling per agent
    #[serde(rename = "memoryMb", alias = "memory_mb", default = "default_agent_memory")]
    pub memory_mb: u64,
    /// CPU ceiling per agent
    #[serde(rename = "cpuShare", alias = "cpu_share", default = "default_agent_cpu")]
    pub cpu_share: f64,
}

fn default_min_size() -> usize { 1 }
fn default_max_size() -> usize { 3 }
fn default_security_level() -> u8 { 1 }
fn default_agent_memory() -> u64 { 4096 }
fn default_agent_cpu() -> f64 { 2.0 }

impl PoolConfig {
    pub fn for_role(role: AgentRole) -> Self {
        let (max_size, capabilities, tools) = match role {
            AgentRole::Design => (2, vec!["design"], vec!["read"]),
            AgentRole::Qa => (2, vec!["test"], vec!["read", "write", "test-runner"]),
            AgentRole::Code => (3, vec!["code"], vec!["read", "write", "test-runner"]),
        };
        Self {
            min_size: default_min_size(),
            max_size,
            capabilities: capabilities.into_iter().map(String::from).collect(),
            tools: tools.into_iter().map(String::from).collect(),
            security_level: default_security_level(),
            memory_mb: default_agent_memory(),
            cpu_share: default_agent_cpu(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_role(AgentRole::Code)
    }
}

/// Pools for every role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default = "default_design_pool")]
    pub design: PoolConfig,
    #[serde(default = "default_qa_pool")]
    pub qa: PoolConfig,
    #[serde(default = "default_code_pool")]
    pub code: PoolConfig,
}

fn default_design_pool() -> PoolConfig { PoolConfig::for_role(AgentRole::Design) }
fn default_qa_pool() -> PoolConfig { PoolConfig::for_role(AgentRole::Qa) }
fn default_code_pool() -> PoolConfig { PoolConfig::for_role(AgentRole::Code) }

impl PoolsConfig {
    pub fn for_role(&self, role: AgentRole) -> &PoolConfig {
        match role {
            AgentRole::Design => &self.design,
            AgentRole::Qa => &self.qa,
            AgentRole::Code => &self.code,
        }
    }

    pub fn for_role_mut(&mut self, role: AgentRole) -> &mut PoolConfig {
        match role {
            AgentRole::Design => &mut self.design,
            AgentRole::Qa => &mut self.qa,
            AgentRole::Code => &mut self.code,
        }
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            design: default_design_pool(),
            qa: default_qa_pool(),
            code: default_code_pool(),
        }
    }
}

/// Pool auto-scaling thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    #[serde(rename = "upperUtilization", alias = "upper_utilization", default = "default_upper_utilization")]
    pub upper_utilization: f64,
    #[serde(rename = "lowerUtilization", alias = "lower_utilization", default = "default_lower_utilization")]
    pub lower_utilization: f64,
    /// Mean acquire wait above which the pool grows
    #[serde(rename = "acceptableWaitMs", alias = "acceptable_wait_ms", default = "default_acceptable_wait")]
    pub acceptable_wait_ms: u64,
    /// Mean acquire wait below which the pool may shrink
    #[serde(rename = "lowWaitMs", alias = "low_wait_ms", default = "default_low_wait")]
    pub low_wait_ms: u64,
    /// Largest fractional growth in a single scaling step
    #[serde(rename = "maxGrowthRatio", alias = "max_growth_ratio", default = "default_max_growth_ratio")]
    pub max_growth_ratio: f64,
    #[serde(rename = "idleCooldownSecs", alias = "idle_cooldown_secs", default = "default_idle_cooldown")]
    pub idle_cooldown_secs: u64,
}

fn default_upper_utilization() -> f64 { 0.8 }
fn default_lower_utilization() -> f64 { 0.3 }
fn default_acceptable_wait() -> u64 { 2000 }
fn default_low_wait() -> u64 { 200 }
fn default_max_growth_ratio() -> f64 { 0.5 }
fn default_idle_cooldown() -> u64 { 60 }

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            upper_utilization: default_upper_utilization(),
            lower_utilization: default_lower_utilization(),
            acceptable_wait_ms: default_acceptable_wait(),
            low_wait_ms: default_low_wait(),
            max_growth_ratio: default_max_growth_ratio(),
            idle_cooldown_secs: default_idle_cooldown(),
        }
    }
}

/// Global compute capacity; zero means detect from the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "memoryMb", alias = "memory_mb", default)]
    pub memory_mb: u64,
    #[serde(rename = "cpuShare", alias = "cpu_share", default)]
    pub cpu_share: f64,
    #[serde(rename = "diskMb", alias = "disk_mb", default)]
    pub disk_mb: u64,
    #[serde(rename = "reserveFraction", alias = "reserve_fraction", default = "default_reserve")]
    pub reserve_fraction: f64,
    #[serde(rename = "perAgentMemoryMb", alias = "per_agent_memory_mb", default = "default_agent_memory")]
    pub per_agent_memory_mb: u64,
    #[serde(rename = "perAgentCpuShare", alias = "per_agent_cpu_share", default = "default_agent_cpu")]
    pub per_agent_cpu_share: f64,
    #[serde(rename = "perAgentDiskMb", alias = "per_agent_disk_mb", default = "default_agent_disk")]
    pub per_agent_disk_mb: u64,
    /// Largest grant-over-request factor while utilization is low
    #[serde(rename = "maxBoostMultiplier", alias = "max_boost_multiplier", default = "default_boost")]
    pub max_boost_multiplier: f64,
    /// Fraction of the request granted while utilization is high
    #[serde(rename = "trimFraction", alias = "trim_fraction", default = "default_trim")]
    pub trim_fraction: f64,
    #[serde(rename = "lowUtilization", alias = "low_utilization", default = "default_low_utilization")]
    pub low_utilization: f64,
    #[serde(rename = "highUtilization", alias = "high_utilization", default = "default_high_utilization")]
    pub high_utilization: f64,
    #[serde(rename = "shrinkMemoryBelow", alias = "shrink_memory_below", default = "default_shrink_memory")]
    pub shrink_memory_below: f64,
    #[serde(rename = "shrinkCpuBelow", alias = "shrink_cpu_below", default = "default_shrink_cpu")]
    pub shrink_cpu_below: f64,
    #[serde(rename = "growAbove", alias = "grow_above", default = "default_grow_above")]
    pub grow_above: f64,
}

fn default_reserve() -> f64 { 0.1 }
fn default_agent_disk() -> u64 { 10_240 }
fn default_boost() -> f64 { 1.5 }
fn default_trim() -> f64 { 0.75 }
fn default_low_utilization() -> f64 { 0.5 }
fn default_high_utilization() -> f64 { 0.8 }
fn default_shrink_memory() -> f64 { 0.30 }
fn default_shrink_cpu() -> f64 { 0.25 }
fn default_grow_above() -> f64 { 0.90 }

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_mb: 0,
            cpu_share: 0.0,
            disk_mb: 0,
            reserve_fraction: default_reserve(),
            per_agent_memory_mb: default_agent_memory(),
            per_agent_cpu_share: default_agent_cpu(),
            per_agent_disk_mb: default_agent_disk(),
            max_boost_multiplier: default_boost(),
            trim_fraction: default_trim(),
            low_utilization: default_low_utilization(),
            high_utilization: default_high_utilization(),
            shrink_memory_below: default_shrink_memory(),
            shrink_cpu_below: default_shrink_cpu(),
            grow_above: default_grow_above(),
        }
    }
}

/// Per-phase token multipliers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMultipliers {
    #[serde(default = "default_design_multiplier")]
    pub design: f64,
    #[serde(rename = "testRed", alias = "test_red", default = "default_one")]
    pub test_red: f64,
    #[serde(rename = "codeGreen", alias = "code_green", default = "default_code_green_multiplier")]
    pub code_green: f64,
    #[serde(default = "default_refactor_multiplier")]
    pub refactor: f64,
    #[serde(default = "default_commit_multiplier")]
    pub commit: f64,
}

fn default_design_multiplier() -> f64 { 1.2 }
fn default_one() -> f64 { 1.0 }
fn default_code_green_multiplier() -> f64 { 1.1 }
fn default_refactor_multiplier() -> f64 { 0.9 }
fn default_commit_multiplier() -> f64 { 0.7 }

impl Default for PhaseMultipliers {
    fn default() -> Self {
        Self {
            design: default_design_multiplier(),
            test_red: default_one(),
            code_green: default_code_green_multiplier(),
            refactor: default_refactor_multiplier(),
            commit: default_commit_multiplier(),
        }
    }
}

/// Token budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(rename = "totalBudget", alias = "total_budget", default = "default_total_budget")]
    pub total_budget: u64,
    #[serde(rename = "reserveFraction", alias = "reserve_fraction", default = "default_reserve")]
    pub reserve_fraction: f64,
    #[serde(rename = "phaseMultipliers", alias = "phase_multipliers", default)]
    pub phase_multipliers: PhaseMultipliers,
    /// Discount when a cycle shares context with other active cycles
    #[serde(rename = "sharingDiscount", alias = "sharing_discount", default = "default_sharing_discount")]
    pub sharing_discount: f64,
    #[serde(rename = "shrinkBelowEfficiency", alias = "shrink_below_efficiency", default = "default_shrink_efficiency")]
    pub shrink_below_efficiency: f64,
    #[serde(rename = "growAboveUtilization", alias = "grow_above_utilization", default = "default_grow_above")]
    pub grow_above_utilization: f64,
    #[serde(rename = "growFraction", alias = "grow_fraction", default = "default_grow_fraction")]
    pub grow_fraction: f64,
    #[serde(rename = "allocationTtlSecs", alias = "allocation_ttl_secs", default = "default_allocation_ttl")]
    pub allocation_ttl_secs: u64,
}

fn default_total_budget() -> u64 { 200_000 }
fn default_sharing_discount() -> f64 { 0.15 }
fn default_shrink_efficiency() -> f64 { 0.4 }
fn default_grow_fraction() -> f64 { 0.25 }
fn default_allocation_ttl() -> u64 { 3600 }

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            total_budget: default_total_budget(),
            reserve_fraction: default_reserve(),
            phase_multipliers: PhaseMultipliers::default(),
            sharing_discount: default_sharing_discount(),
            shrink_below_efficiency: default_shrink_efficiency(),
            grow_above_utilization: default_grow_above(),
            grow_fraction: default_grow_fraction(),
            allocation_ttl_secs: default_allocation_ttl(),
        }
    }
}

/// What happens when an escalation times out
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationFallback {
    ForceSequential,
    Abandon,
}

impl Default for EscalationFallback {
    fn default() -> Self {
        EscalationFallback::ForceSequential
    }
}

/// Conflict prediction and escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(rename = "escalationTimeoutSecs", alias = "escalation_timeout_secs", default = "default_escalation_timeout")]
    pub escalation_timeout_secs: u64,
    #[serde(rename = "escalationFallback", alias = "escalation_fallback", default)]
    pub escalation_fallback: EscalationFallback,
    /// Weight of the historical conflict rate in predictions
    #[serde(rename = "historyWeight", alias = "history_weight", default = "default_history_weight")]
    pub history_weight: f64,
    /// Weight applied when both cycles share an assigned agent
    #[serde(rename = "sharedAgentWeight", alias = "shared_agent_weight", default = "default_shared_agent_weight")]
    pub shared_agent_weight: f64,
    /// Historical rate above which a pair is flagged
    #[serde(rename = "historyFlagThreshold", alias = "history_flag_threshold", default = "default_history_flag")]
    pub history_flag_threshold: f64,
}

fn default_escalation_timeout() -> u64 { 4 * 60 * 60 }
fn default_history_weight() -> f64 { 0.5 }
fn default_shared_agent_weight() -> f64 { 0.2 }
fn default_history_flag() -> f64 { 0.3 }

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            escalation_timeout_secs: default_escalation_timeout(),
            escalation_fallback: EscalationFallback::default(),
            history_weight: default_history_weight(),
            shared_agent_weight: default_shared_agent_weight(),
            history_flag_threshold: default_history_flag(),
        }
    }
}

/// Config loader
pub struct ConfigLoader {
    /// Global config path
    global_path: Option<PathBuf>,
    /// Project config path
    project_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            global_path: Self::get_global_config_path(),
            project_path: None,
        }
    }

    /// Set the project path
    pub fn with_project_path(mut self, path: &Path) -> Self {
        self.project_path = Some(crate::utils::config_path(path));
        self
    }

    /// Override the global config file
    pub fn with_global_path(mut self, path: Option<PathBuf>) -> Self {
        self.global_path = path;
        self
    }

    fn get_global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tdd-parallel").join("config.toml"))
    }

    pub fn global_config_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    pub fn project_config_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    /// Load global then project config, project keys winning, defaults elsewhere
    pub fn load(&self) -> Result<ParallelConfig> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in [&self.global_path, &self.project_path].into_iter().flatten() {
            if let Some(layer) = Self::read_table(path)? {
                merge_tables(&mut merged, layer);
            }
        }

        let config: ParallelConfig = merged
            .try_into()
            .map_err(|e| anyhow!("Failed to parse merged config: {}", e))?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load config from a specific path
    pub fn load_from_path(&self, path: &Path) -> Result<Option<ParallelConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: ParallelConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

        validate_config(&config)?;

        Ok(Some(config))
    }

    fn read_table(path: &Path) -> Result<Option<toml::Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let value: toml::Value = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        log::debug!("[Config] Loaded layer from {}", path.display());
        Ok(Some(value))
    }

    /// Save config to a specific path
    pub fn save_to_path(&self, path: &Path, config: &ParallelConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("Failed to create config directory '{}': {}", parent.display(), e)
                })?;
            }
        }

        validate_config(config)?;

        let contents = toml::to_string_pretty(config)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, contents)
            .map_err(|e| anyhow!("Failed to write config file '{}': {}", path.display(), e))?;

        log::info!("[Config] Saved config to: {}", path.display());
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Overlay `layer` onto `base`, recursing into tables
fn merge_tables(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base_table), toml::Value::Table(layer_table)) => {
            for (key, value) in layer_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        merge_tables(existing, value);
                    }
                    _ => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if !(0.0..1.0).contains(&value) {
        return Err(anyhow!("{} must be in [0, 1), got {}", name, value));
    }
    Ok(())
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be in [0, 1], got {}", name, value));
    }
    Ok(())
}

/// Validate config values
pub fn validate_config(config: &ParallelConfig) -> Result<()> {
    let exec = &config.execution;
    if exec.max_parallel_cycles == 0 {
        return Err(anyhow!("maxParallelCycles must be greater than 0"));
    }
    if exec.agent_timeout_secs == 0 {
        return Err(anyhow!("agentTimeoutSecs must be greater than 0"));
    }
    if exec.backoff_multiplier < 1.0 {
        return Err(anyhow!("backoffMultiplier must be at least 1.0"));
    }
    if exec.initial_backoff_ms > exec.max_backoff_ms {
        return Err(anyhow!("initialBackoffMs cannot exceed maxBackoffMs"));
    }
    check_ratio("rejectConflictProbability", exec.reject_conflict_probability)?;

    for role in AgentRole::ALL {
        let pool = config.pools.for_role(role);
        if pool.max_size == 0 {
            return Err(anyhow!("pools.{}.maxSize must be greater than 0", role));
        }
        if pool.min_size > pool.max_size {
            return Err(anyhow!(
                "pools.{}.minSize ({}) cannot exceed maxSize ({})",
                role,
                pool.min_size,
                pool.max_size
            ));
        }
        if pool.memory_mb == 0 || pool.cpu_share <= 0.0 {
            return Err(anyhow!("pools.{} ceilings must be positive", role));
        }
    }

    let scaling = &config.scaling;
    check_ratio("scaling.upperUtilization", scaling.upper_utilization)?;
    check_ratio("scaling.lowerUtilization", scaling.lower_utilization)?;
    if scaling.lower_utilization >= scaling.upper_utilization {
        return Err(anyhow!("scaling.lowerUtilization must be below upperUtilization"));
    }
    if scaling.max_growth_ratio <= 0.0 {
        return Err(anyhow!("scaling.maxGrowthRatio must be positive"));
    }

    let res = &config.resources;
    if res.cpu_share < 0.0 {
        return Err(anyhow!("resources.cpuShare cannot be negative"));
    }
    check_fraction("resources.reserveFraction", res.reserve_fraction)?;
    if res.per_agent_memory_mb == 0 || res.per_agent_cpu_share <= 0.0 || res.per_agent_disk_mb == 0 {
        return Err(anyhow!("resources per-agent caps must be positive"));
    }
    if res.max_boost_multiplier < 1.0 {
        return Err(anyhow!("resources.maxBoostMultiplier must be at least 1.0"));
    }
    check_ratio("resources.trimFraction", res.trim_fraction)?;
    if res.low_utilization >= res.high_utilization {
        return Err(anyhow!("resources.lowUtilization must be below highUtilization"));
    }

    let tokens = &config.tokens;
    if tokens.total_budget == 0 {
        return Err(anyhow!("tokens.totalBudget must be greater than 0"));
    }
    check_fraction("tokens.reserveFraction", tokens.reserve_fraction)?;
    check_fraction("tokens.sharingDiscount", tokens.sharing_discount)?;
    check_ratio("tokens.shrinkBelowEfficiency", tokens.shrink_below_efficiency)?;
    check_ratio("tokens.growAboveUtilization", tokens.grow_above_utilization)?;
    let m = &tokens.phase_multipliers;
    if [m.design, m.test_red, m.code_green, m.refactor, m.commit]
        .iter()
        .any(|v| *v <= 0.0)
    {
        return Err(anyhow!("tokens.phaseMultipliers must be positive"));
    }

    let conflicts = &config.conflicts;
    if conflicts.escalation_timeout_secs == 0 {
        return Err(anyhow!("conflicts.escalationTimeoutSecs must be greater than 0"));
    }
    check_ratio("conflicts.historyWeight", conflicts.history_weight)?;
    check_ratio("conflicts.sharedAgentWeight", conflicts.shared_agent_weight)?;
    check_ratio("conflicts.historyFlagThreshold", conflicts.history_flag_threshold)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = ParallelConfig::default();
        assert_eq!(config.execution.max_parallel_cycles, 3);
        assert_eq!(config.tokens.total_budget, 200_000);
        assert_eq!(config.conflicts.escalation_timeout_secs, 14_400);
        assert_eq!(config.pools.code.max_size, 3);
        assert_eq!(config.conflicts.escalation_fallback, EscalationFallback::ForceSequential);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_loads_project_config_with_both_key_styles() {
        let temp_dir = create_test_dir();
        write_config(
            &temp_dir.path().join(".tdd-parallel"),
            r#"
[execution]
max_parallel_cycles = 2
agentTimeoutSecs = 5

[pools.code]
minSize = 1
maxSize = 4

[tokens]
totalBudget = 100000
"#,
        );

        let loader = ConfigLoader::new()
            .with_global_path(None)
            .with_project_path(temp_dir.path());
        let config = loader.load().unwrap();
        assert_eq!(config.execution.max_parallel_cycles, 2);
        assert_eq!(config.execution.agent_timeout_secs, 5);
        assert_eq!(config.pools.code.max_size, 4);
        assert_eq!(config.pools.qa.max_size, 2);
        assert_eq!(config.tokens.total_budget, 100_000);
    }

    #[test]
    fn test_project_layer_wins_over_global() {
        let temp_dir = create_test_dir();
        let global = write_config(
            &temp_dir.path().join("global"),
            "[execution]\nmaxParallelCycles = 5\nmaxRetries = 7\n",
        );
        let project_root = temp_dir.path().join("project");
        write_config(
            &project_root.join(".tdd-parallel"),
            "[execution]\nmaxParallelCycles = 2\n",
        );

        let config = ConfigLoader::new()
            .with_global_path(Some(global))
            .with_project_path(&project_root)
            .load()
            .unwrap();
        assert_eq!(config.execution.max_parallel_cycles, 2);
        assert_eq!(config.execution.max_retries, 7);
    }

    #[test]
    fn test_handles_missing_config_files_gracefully() {
        let temp_dir = create_test_dir();
        let loader = ConfigLoader::new()
            .with_global_path(None)
            .with_project_path(temp_dir.path());
        assert!(loader.load_from_path(&temp_dir.path().join("nope.toml")).unwrap().is_none());
        let config = loader.load().unwrap();
        assert_eq!(config.execution.max_parallel_cycles, 3);
    }

    #[test]
    fn test_rejects_min_above_max() {
        let mut config = ParallelConfig::default();
        config.pools.qa.min_size = 5;
        config.pools.qa.max_size = 2;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("pools.qa.minSize"));
    }

    #[test]
    fn test_rejects_bad_fractions() {
        let mut config = ParallelConfig::default();
        config.tokens.reserve_fraction = 1.0;
        assert!(validate_config(&config).is_err());

        let mut config = ParallelConfig::default();
        config.resources.reserve_fraction = -0.1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_capacities() {
        let mut config = ParallelConfig::default();
        config.execution.max_parallel_cycles = 0;
        assert!(validate_config(&config).is_err());

        let mut config = ParallelConfig::default();
        config.tokens.total_budget = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_escalation_fallback_parses() {
        let config: ParallelConfig =
            toml::from_str("[conflicts]\nescalationFallback = \"abandon\"\n").unwrap();
        assert_eq!(config.conflicts.escalation_fallback, EscalationFallback::Abandon);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = create_test_dir();
        let path = temp_dir.path().join("nested").join("config.toml");
        let mut config = ParallelConfig::default();
        config.execution.max_parallel_cycles = 4;

        let loader = ConfigLoader::new().with_global_path(None);
        loader.save_to_path(&path, &config).unwrap();
        let loaded = loader.load_from_path(&path).unwrap().unwrap();
        assert_eq!(loaded.execution.max_parallel_cycles, 4);
    }
}
