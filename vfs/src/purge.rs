//! Opportunistic reclamation of obsolete block versions.
//!
//! Commits leave superseded versions behind by design; the purge record
//! written at sync says which `(page, version)` ranges are reclaimable. The
//! scheduler runs the sweep off the commit path: a qualifying sync enqueues
//! a deferred task that yields once before sweeping, so the engine's own
//! work drains first. At most one purge is pending per file. Under the
//! `Manual` policy nothing is scheduled automatically and callers drive
//! [`PurgeScheduler::purge`] themselves.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::{Durability, PurgePolicy};
use crate::error::VfsResult;
use crate::kvs::engine::Kvs;
use crate::store::run_purge;

pub struct PurgeScheduler<K: Kvs> {
    kvs: Arc<K>,
    policy: PurgePolicy,
    purge_at_least: usize,
    durability: Durability,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl<K: Kvs> PurgeScheduler<K> {
    pub fn new(
        kvs: Arc<K>,
        policy: PurgePolicy,
        purge_at_least: usize,
        durability: Durability,
    ) -> Self {
        PurgeScheduler { kvs, policy, purge_at_least, durability, pending: Arc::default() }
    }

    /// Called after a committed sync with the purge record's entry count.
    /// Schedules a deferred purge when the policy allows, the record is
    /// large enough, and none is already pending for this file.
    pub fn maybe_schedule(&self, name: &str, entries: usize) {
        if self.policy == PurgePolicy::Manual || entries < self.purge_at_least {
            return;
        }
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.insert(name.to_string()) {
                return;
            }
        }
        let kvs = self.kvs.clone();
        let pending = self.pending.clone();
        let durability = self.durability;
        let name = name.to_string();
        tokio::spawn(async move {
            // Give the connection's queued work a chance to run first.
            tokio::task::yield_now().await;
            match run_purge(kvs.as_ref(), durability, &name).await {
                Ok(pages) => log::debug!("purged obsolete versions of {pages} pages of {name}"),
                Err(err) => log::warn!("deferred purge of {name} failed: {err}"),
            }
            pending.lock().unwrap().remove(&name);
        });
    }

    /// Runs a purge right now. The manual-policy entry point, also usable
    /// under `Deferred`. Returns the number of pages swept.
    pub async fn purge(&self, name: &str) -> VfsResult<usize> {
        run_purge(self.kvs.as_ref(), self.durability, name).await
    }
}
