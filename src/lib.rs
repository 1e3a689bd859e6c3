//! PingBot Backend Library
//!
//! Presence tracking over messaging platforms: probe messages go out, the
//! delivery/read receipts come back, and the correlation engine turns the
//! round trips into device states, session insights and back-online
//! notifications.

pub mod adapters;
pub mod api;
pub mod config;
pub mod engine;
pub mod models;
pub mod notify;
pub mod realtime;
pub mod storage;

pub use config::Config;
pub use engine::{Classifier, Correlator, InsightsAggregator, SessionRunner, SessionSupervisor};
pub use models::{DeviceState, Platform, SessionKey, TrackerPoint};
