//! flame-core — shared request and fragment types plus configuration.
//! All other Flame crates depend on this one.

pub mod config;
pub mod fragment;
pub mod transfer;

pub use config::{ConfigError, FlameConfig};
pub use fragment::{FragmentFlags, FragmentKey, FragmentMapping, LeaseTime};
pub use transfer::{NodeId, Priority, TransferError, TransferRequest};
