//! PageWarden: website availability and defacement monitoring pipeline.
//!
//! The pipeline probes sites on per-site schedules, captures screenshots
//! through a shared headless browser, compares them against stored baselines
//! with a hybrid pixel/structural/domain engine, and raises deduplicated
//! alerts through configurable channels. A management layer drives it via
//! the store, [`scheduler::SiteChange`] notifications and the live-update
//! [`events::Publisher`].

pub mod alert;
pub mod blob;
pub mod capture;
pub mod config;
pub mod db;
pub mod detect;
pub mod events;
pub mod probe;
pub mod scheduler;
