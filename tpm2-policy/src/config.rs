// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session manager configuration
//!
//! Capacities are fixed for the lifetime of a [`crate::SessionManager`];
//! the registry never grows past them.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{TpmAlgId, HR_HANDLE_MASK};
use crate::types::alg_serde;

pub const ENV_MAX_LOADED_SESSIONS: &str = "TPM2_POLICY_MAX_LOADED_SESSIONS";
pub const ENV_MAX_ACTIVE_SESSIONS: &str = "TPM2_POLICY_MAX_ACTIVE_SESSIONS";
pub const ENV_CONTEXT_SLOT: &str = "TPM2_POLICY_CONTEXT_SLOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Width of the truncated context counter stored per saved session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSlot {
    U8,
    U16,
}

impl ContextSlot {
    /// Number of distinct truncated values (`W`)
    pub fn range(self) -> u64 {
        match self {
            ContextSlot::U8 => 1 << 8,
            ContextSlot::U16 => 1 << 16,
        }
    }

    /// Low bits of the 64-bit context counter
    pub fn truncate(self, counter: u64) -> u16 {
        (counter & (self.range() - 1)) as u16
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "u8" | "8" => Some(ContextSlot::U8),
            "u16" | "16" => Some(ContextSlot::U16),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions that may be held in RAM at once
    pub max_loaded_sessions: usize,
    /// Sessions that may exist at once, loaded or saved
    pub max_active_sessions: usize,
    pub context_slot: ContextSlot,
    /// Algorithm for context integrity and ticket HMACs
    #[serde(with = "alg_serde")]
    pub context_hash: TpmAlgId,
    /// Shortest accepted caller nonce at session start
    pub nonce_min_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_loaded_sessions: 3,
            max_active_sessions: 64,
            context_slot: ContextSlot::U16,
            context_hash: TpmAlgId::Sha256,
            nonce_min_size: 16,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let mut config: Self = serde_json::from_slice(&data)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable lookup
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let parse_usize = |var: &'static str, value: String| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::Env { var, value })
        };
        if let Some(value) = lookup(ENV_MAX_LOADED_SESSIONS) {
            self.max_loaded_sessions = parse_usize(ENV_MAX_LOADED_SESSIONS, value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ACTIVE_SESSIONS) {
            self.max_active_sessions = parse_usize(ENV_MAX_ACTIVE_SESSIONS, value)?;
        }
        if let Some(value) = lookup(ENV_CONTEXT_SLOT) {
            self.context_slot = ContextSlot::parse(&value).ok_or(ConfigError::Env {
                var: ENV_CONTEXT_SLOT,
                value,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_loaded_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_loaded_sessions must be at least 1".into(),
            ));
        }
        // Values 0..=max_loaded are reserved for "free" and "loaded in slot k"
        if self.max_loaded_sessions as u64 + 2 > self.context_slot.range() {
            return Err(ConfigError::Invalid(format!(
                "max_loaded_sessions {} leaves no saved context values in a {:?} slot",
                self.max_loaded_sessions, self.context_slot
            )));
        }
        if self.max_active_sessions == 0 || self.max_active_sessions > HR_HANDLE_MASK as usize {
            return Err(ConfigError::Invalid(format!(
                "max_active_sessions must be in 1..={HR_HANDLE_MASK}"
            )));
        }
        if !self.context_hash.is_hash() {
            return Err(ConfigError::Invalid("context_hash must be a hash".into()));
        }
        if self.nonce_min_size == 0 {
            return Err(ConfigError::Invalid("nonce_min_size must be nonzero".into()));
        }
        Ok(())
    }
}
