//! Sitewatch Common - outage state and diagnostic snapshots
//!
//! Shared by the daemon and the snapshot subcommand: site list parsing,
//! configuration, the outage state machine and its durable store, and the
//! snapshot engine with its collectors.

pub mod config;
pub mod error;
pub mod journal;
pub mod outage;
pub mod resolver;
pub mod site_lock;
pub mod sites;
pub mod snapshot;
pub mod state_store;
pub mod timefmt;

pub use config::Config;
pub use error::{Result, WatchError};
pub use outage::{transition, OutageInterval, OutageState, StatusOutcome, Transition};
pub use sites::{load_sites, SiteDescriptor, SiteList};
pub use snapshot::{SnapshotEngine, SnapshotReport, SnapshotTarget};
pub use state_store::{FileStateStore, StateStore};
