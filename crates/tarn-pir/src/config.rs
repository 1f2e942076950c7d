//! Compiler configuration.
//!
//! Parsed from the environment exactly once, at driver construction; the
//! rest of the compiler only ever sees the immutable struct.

use regex::Regex;

/// What `PIR_ENABLE` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnableMode {
    /// Compile hot closures on request
    #[default]
    On,
    /// Compilation is a no-op
    Off,
    /// Compile every closure handed to the driver
    Force,
    /// Compile but do not install into dispatch tables
    ForceDryRun,
}

#[derive(Debug)]
pub struct CompilerConfig {
    pub enable: EnableMode,
    /// Baseline byte-size cap; bigger functions are skipped
    pub max_input_size: usize,
    /// Passes whose name matches are not scheduled
    pub pass_blacklist: Option<Regex>,
    /// Emit a host print call into every deopt block
    pub debug_deopts: bool,
    /// Randomly invert lowered assumption branches
    pub deopt_chaos: bool,
    pub deopt_chaos_seed: u64,
    /// Record per-pass wall-clock time
    pub measure: bool,
    /// Per-phase budget: maximum pass applications per scheduled slot
    pub phase_budget: usize,
    /// Inliner cap on callee size, in instructions
    pub max_inline_size: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            enable: EnableMode::On,
            max_input_size: 6000,
            pass_blacklist: None,
            debug_deopts: false,
            deopt_chaos: false,
            deopt_chaos_seed: 0,
            measure: false,
            phase_budget: 64,
            max_inline_size: 200,
        }
    }
}

impl CompilerConfig {
    /// Read the `PIR_*` environment variables once.
    pub fn from_env() -> CompilerConfig {
        let mut cfg = CompilerConfig::default();
        if let Ok(v) = std::env::var("PIR_ENABLE") {
            cfg.enable = match v.as_str() {
                "off" => EnableMode::Off,
                "force" => EnableMode::Force,
                "force_dryrun" => EnableMode::ForceDryRun,
                _ => EnableMode::On,
            };
        }
        if let Ok(v) = std::env::var("PIR_MAX_INPUT_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.max_input_size = n;
            }
        }
        if let Ok(v) = std::env::var("PIR_PASS_BLACKLIST") {
            cfg.pass_blacklist = Regex::new(&v).ok();
        }
        cfg.debug_deopts = std::env::var("PIR_DEBUG_DEOPTS").is_ok();
        cfg.deopt_chaos = std::env::var("PIR_DEOPT_CHAOS").is_ok();
        if let Ok(v) = std::env::var("PIR_DEOPT_CHAOS_SEED") {
            if let Ok(n) = v.parse() {
                cfg.deopt_chaos_seed = n;
            }
        }
        cfg.measure = std::env::var("PIR_MEASURE_COMPILER").is_ok();
        cfg
    }

    /// Whether a pass is blacklisted by name.
    pub fn pass_disabled(&self, name: &str) -> bool {
        self.pass_blacklist.as_ref().map(|re| re.is_match(name)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CompilerConfig::default();
        assert_eq!(cfg.enable, EnableMode::On);
        assert!(!cfg.pass_disabled("constant-fold"));
    }

    #[test]
    fn test_blacklist() {
        let cfg = CompilerConfig {
            pass_blacklist: Regex::new("inline|gvn").ok(),
            ..Default::default()
        };
        assert!(cfg.pass_disabled("inline"));
        assert!(cfg.pass_disabled("gvn"));
        assert!(!cfg.pass_disabled("cleanup"));
    }
}
