//! Sitewatch daemon - probes sites, tracks outages, dispatches snapshots

pub mod cli;
pub mod daemon;
pub mod dispatch;
pub mod logging;
pub mod probe;
pub mod tracker;

pub use dispatch::{ChannelDispatcher, ProcessDispatcher, SnapshotDispatch, SnapshotJob, SnapshotRunner};
pub use probe::{HttpProber, Prober};
pub use tracker::{Clock, SiteOutcome, SystemClock, TickReport, Tracker};
