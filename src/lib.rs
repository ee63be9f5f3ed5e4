//! # pathwar-hypervisor
//!
//! Control-plane daemon that reconciles a remote inventory of desired
//! level instances with the container stacks actually running on a pool
//! of remote Docker hosts.
//!
//! Each pass of the [`reconciler::Reconciler`] fetches the desired list
//! from the [`inventory::InventoryClient`], consults the
//! [`pool::Pool`]'s observed index, and drives a [`host::HostDriver`]
//! over its SSH [`transport::ShellTransport`] to create, refresh or
//! ignore every instance. Realized endpoints and extracted passphrases
//! are reported back with a conditional PATCH.
//!
//! Reconciliation is eventually consistent and idempotent: a failed
//! instance stays in its previous state and is retried on the next pass.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use config::Config;
pub use error::{Error, Result};
pub use host::{Host, HostDriver};
pub use inventory::{DesiredInstance, InventoryClient};
pub use pool::Pool;
pub use reconciler::{decide, Action, Reconciler};
pub use transport::{CommandOutput, ShellTransport, SshTransport};
pub use types::{Level, LevelId, LevelType, Passphrase};

pub mod compose;
pub mod config;
pub mod error;
pub mod host;
pub mod ingress;
pub mod inventory;
pub mod pool;
pub mod reconciler;
pub mod transport;
pub mod types;
