// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization sessions and policy digests
//!
//! This crate implements the session core of a TPM 2.0: the table of loaded
//! sessions, the context identity scheme that lets sessions be saved and
//! reloaded without replay, the policy digest engine, and the tickets that
//! let an authorization be replayed within a time window.
//!
//! ## Components
//!
//! - [`SessionManager`]: create, flush, save and load sessions, startup,
//!   capability queries
//! - [`ContextRegistry`]: context identities with gap avoidance
//! - [`policy`]: policy assertions, PolicyOR and the authorization check
//! - [`ticket`]: auth tickets, verified tickets and timeout checks
//! - [`PolicyScript`]: declarative policies evaluated on a trial session
//!
//! The object table, NV storage, clock and signature checks are consumed
//! through the traits in [`platform`].
//!
//! ## Example
//!
//! ```
//! use tpm2_policy::{policy, SessionConfig, SessionManager, SimPlatform, StartSession, TpmAlgId, TpmCc};
//!
//! let sim = SimPlatform::new();
//! let mut manager = SessionManager::new(SessionConfig::default())?;
//! let session = manager.create_session(&sim, StartSession::trial(TpmAlgId::Sha256))?;
//! manager.execute(session.handle, |s| policy::command_code(s, TpmCc::Unseal.to_u32()))?;
//! let digest = manager.execute(session.handle, |s| policy::get_digest(s))?;
//! assert_eq!(digest.len(), 32);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod constants;
mod context;
mod crypto;
mod error;
mod manager;
mod marshal;
pub mod platform;
pub mod policy;
mod script;
mod session;
mod slots;
pub mod ticket;
mod types;

pub use config::{ConfigError, ContextSlot, SessionConfig};
pub use constants::*;
pub use context::{ActiveId, ContextRegistry, SlotState};
pub use crypto::{hash, hmac, kdfa, HashState};
pub use error::{Result, TpmError};
pub use manager::{HandleList, SessionManager, StartSession, StartedSession, TpmsContext};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use platform::{Platform, SimPlatform};
pub use script::{PolicyScript, PolicyStep};
pub use session::{CommandBinding, HmacState, PolicyState, Session, SessionKind};
pub use slots::{SlotId, SlotRegistry};
pub use types::*;
