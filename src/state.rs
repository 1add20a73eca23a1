//! Shared application state threaded through every axum handler.
//!
//! The teacher carries two divergent `AppState` definitions (`lib.rs` and
//! `main.rs`); this crate keeps one, built the richer way: config,
//! probe cache, subscription registry, and a `content_update_id` counter
//! all in a single `Arc`-cloneable handle.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::config::Config;
use crate::events::Subscriptions;
use crate::probe::ProbeCache;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub probe_cache: Arc<ProbeCache>,
    pub subscriptions: Arc<Subscriptions>,
    pub content_update_id: Arc<AtomicU32>,
}

impl AppState {
    pub fn new(config: Arc<Config>, probe_cache: Arc<ProbeCache>) -> Self {
        Self {
            config,
            probe_cache,
            subscriptions: Arc::new(Subscriptions::new()),
            content_update_id: Arc::new(AtomicU32::new(0)),
        }
    }
}
