//! Browser control client and exclusive-lease browser-profile pool
//! (spec §4.1, §4.2).

pub mod client;
pub mod pool;

pub use client::{BrowserControlClient, ControlApiError, OpenWindowResponse, WindowDescriptor, WindowRef};
pub use pool::{BrowserPool, PoolError, PoolStatusCounts, SessionLease};
