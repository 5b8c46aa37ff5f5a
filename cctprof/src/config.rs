// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cct::MIN_ARENA_BYTES;
use crate::cursor::UnwindLimits;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_FRAME_BUFFER_CAPACITY: usize = 32;
pub const DEFAULT_MAX_UNWIND_STEPS: usize = 4096;
pub const DEFAULT_TROLL_MAX_WORDS: usize = 16 * 1024;
pub const DEFAULT_ARENA_BYTES: usize = 64 * 1024 * 1024;

/// Whether all threads insert into one tree or each into its own.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeMode {
    /// One tree for the process. Identical paths sampled on different
    /// threads share nodes.
    #[default]
    Shared,
    /// One tree per thread, all carved from the same arena.
    PerThread,
}

impl FromStr for TreeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(TreeMode::Shared),
            "per-thread" | "per_thread" | "perthread" => Ok(TreeMode::PerThread),
            _ => anyhow::bail!("unknown tree mode {s:?}, expected \"shared\" or \"per-thread\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerConfiguration {
    frame_buffer_capacity: usize,
    max_unwind_steps: usize,
    troll_max_words: usize,
    arena_bytes: usize,
    tree_mode: TreeMode,
    // Keep failed unwinds under the partial-unwind root.
    record_partial_unwinds: bool,
    log_level: String,
}

impl Default for ProfilerConfiguration {
    fn default() -> Self {
        Self {
            frame_buffer_capacity: DEFAULT_FRAME_BUFFER_CAPACITY,
            max_unwind_steps: DEFAULT_MAX_UNWIND_STEPS,
            troll_max_words: DEFAULT_TROLL_MAX_WORDS,
            arena_bytes: DEFAULT_ARENA_BYTES,
            tree_mode: TreeMode::Shared,
            record_partial_unwinds: false,
            log_level: "info".to_owned(),
        }
    }
}

impl ProfilerConfiguration {
    pub fn new(
        frame_buffer_capacity: usize,
        max_unwind_steps: usize,
        troll_max_words: usize,
        arena_bytes: usize,
        tree_mode: TreeMode,
        record_partial_unwinds: bool,
        log_level: String,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(frame_buffer_capacity > 0, "frame buffer capacity must be non-zero");
        anyhow::ensure!(max_unwind_steps > 0, "unwind step bound must be non-zero");
        anyhow::ensure!(troll_max_words > 0, "trolling window must be non-zero");
        anyhow::ensure!(
            arena_bytes >= MIN_ARENA_BYTES,
            "arena of {arena_bytes} bytes cannot hold a tree, need at least {}",
            MIN_ARENA_BYTES
        );
        anyhow::ensure!(!log_level.trim().is_empty(), "log level must not be empty");
        Ok(Self {
            frame_buffer_capacity,
            max_unwind_steps,
            troll_max_words,
            arena_bytes,
            tree_mode,
            record_partial_unwinds,
            log_level,
        })
    }

    /// Reads `CCTPROF_FRAME_BUFFER_CAPACITY`, `CCTPROF_MAX_UNWIND_STEPS`,
    /// `CCTPROF_TROLL_MAX_WORDS`, `CCTPROF_ARENA_BYTES`, `CCTPROF_TREE_MODE`,
    /// `CCTPROF_RECORD_PARTIAL_UNWINDS` and `CCTPROF_LOG_LEVEL`. Unset
    /// variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
        {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
            }
        }

        let defaults = Self::default();
        Self::new(
            parsed(&lookup, "CCTPROF_FRAME_BUFFER_CAPACITY", defaults.frame_buffer_capacity)?,
            parsed(&lookup, "CCTPROF_MAX_UNWIND_STEPS", defaults.max_unwind_steps)?,
            parsed(&lookup, "CCTPROF_TROLL_MAX_WORDS", defaults.troll_max_words)?,
            parsed(&lookup, "CCTPROF_ARENA_BYTES", defaults.arena_bytes)?,
            parsed(&lookup, "CCTPROF_TREE_MODE", defaults.tree_mode)?,
            parsed(&lookup, "CCTPROF_RECORD_PARTIAL_UNWINDS", defaults.record_partial_unwinds)?,
            lookup("CCTPROF_LOG_LEVEL").unwrap_or(defaults.log_level),
        )
    }

    pub fn frame_buffer_capacity(&self) -> usize {
        self.frame_buffer_capacity
    }

    pub fn max_unwind_steps(&self) -> usize {
        self.max_unwind_steps
    }

    pub fn troll_max_words(&self) -> usize {
        self.troll_max_words
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena_bytes
    }

    pub fn tree_mode(&self) -> TreeMode {
        self.tree_mode
    }

    pub fn record_partial_unwinds(&self) -> bool {
        self.record_partial_unwinds
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn unwind_limits(&self) -> UnwindLimits {
        UnwindLimits {
            max_steps: self.max_unwind_steps,
            troll_max_words: self.troll_max_words,
        }
    }

    pub fn set_tree_mode(&mut self, tree_mode: TreeMode) {
        self.tree_mode = tree_mode;
    }

    pub fn set_record_partial_unwinds(&mut self, record: bool) {
        self.record_partial_unwinds = record;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> anyhow::Result<ProfilerConfiguration> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProfilerConfiguration::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(ProfilerConfiguration::default(), config);
        assert_eq!(32, config.frame_buffer_capacity());
        assert_eq!(4096, config.max_unwind_steps());
        assert_eq!(TreeMode::Shared, config.tree_mode());
        assert!(!config.record_partial_unwinds());
        assert_eq!("info", config.log_level());
    }

    #[test]
    fn environment_overrides() {
        let config = from_map(&[
            ("CCTPROF_FRAME_BUFFER_CAPACITY", "8"),
            ("CCTPROF_TREE_MODE", "per-thread"),
            ("CCTPROF_RECORD_PARTIAL_UNWINDS", "true"),
            ("CCTPROF_LOG_LEVEL", "cctprof=debug"),
        ])
        .unwrap();
        assert_eq!(8, config.frame_buffer_capacity());
        assert_eq!(TreeMode::PerThread, config.tree_mode());
        assert!(config.record_partial_unwinds());
        assert_eq!("cctprof=debug", config.log_level());
    }

    #[test]
    fn rejects_bad_values() {
        let err = from_map(&[("CCTPROF_MAX_UNWIND_STEPS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("CCTPROF_MAX_UNWIND_STEPS"));
        assert!(from_map(&[("CCTPROF_TROLL_MAX_WORDS", "0")]).is_err());
        assert!(from_map(&[("CCTPROF_ARENA_BYTES", "16")]).is_err());
        assert!(from_map(&[("CCTPROF_TREE_MODE", "forest")]).is_err());
    }

    #[test]
    fn serde() {
        let config = ProfilerConfiguration::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"tree_mode\":\"Shared\""));
        let back: ProfilerConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
