//! Runtime configuration.
//!
//! All knobs are plain data, serde-derived so embedders can keep them in
//! a TOML file next to their own settings. Values are clamped into safe
//! bounds before use; a hostile config can degrade throughput but not
//! break collector or stack invariants.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Percentage of the surviving heap that must be newly allocated
    /// before the next collection cycle starts (200 = wait for 2x).
    pub gc_pause: u32,
    /// Work per step as a percentage of `gc_step_size` (100 = one byte of
    /// traversal per byte of debt).
    pub gc_step_mul: u32,
    /// Bytes of debt paid per collector step.
    pub gc_step_size: u32,
    /// Value-stack cap, in slots.
    pub max_stack: usize,
    /// Nested native/interpreter re-entries before "C stack overflow".
    pub max_ccalls: usize,
}

impl Config {
    pub const DEFAULT_PAUSE: u32 = 200;
    pub const DEFAULT_STEP_MUL: u32 = 100;
    pub const DEFAULT_STEP_SIZE: u32 = 8 * 1024;

    /// Clamp every tunable into its safe range.
    pub fn clamped(mut self) -> Self {
        self.gc_pause = self.gc_pause.clamp(50, 1000);
        self.gc_step_mul = self.gc_step_mul.clamp(10, 10_000);
        self.gc_step_size = self.gc_step_size.clamp(1024, 1 << 20);
        self.max_stack = self.max_stack.clamp(256, cript_core::limits::MAX_STACK);
        self.max_ccalls = self.max_ccalls.clamp(16, cript_core::limits::MAX_CCALLS);
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        toml::from_str::<Config>(text)
            .map(Config::clamped)
            .map_err(ConfigError::Parse)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gc_pause: Self::DEFAULT_PAUSE,
            gc_step_mul: Self::DEFAULT_STEP_MUL,
            gc_step_size: Self::DEFAULT_STEP_SIZE,
            max_stack: cript_core::limits::MAX_STACK,
            max_ccalls: cript_core::limits::MAX_CCALLS,
        }
    }
}

/// Configuration loading failure.
#[derive(Debug)]
pub enum ConfigError {
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "bad runtime config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_already_in_bounds() {
        let c = Config::default();
        let d = c.clone().clamped();
        assert_eq!(c.gc_pause, d.gc_pause);
        assert_eq!(c.max_stack, d.max_stack);
    }

    #[test]
    fn toml_roundtrip_and_clamping() {
        let c = Config::from_toml_str("gc_pause = 5\nmax_stack = 1").unwrap();
        assert_eq!(c.gc_pause, 50);
        assert_eq!(c.max_stack, 256);
        let c = Config::from_toml_str("gc_step_size = 65536").unwrap();
        assert_eq!(c.gc_step_size, 65536);
        assert!(Config::from_toml_str("gc_pause = \"fast\"").is_err());
    }
}
