//! Runtime options for a VFS instance.

use serde_derive::{Deserialize, Serialize};

/// Durability hint forwarded to the key/value store when a transaction is
/// opened. `Relaxed` additionally suppresses the explicit store sync that
/// normally follows a committed xSync transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Strict,
    Default,
    Relaxed,
}

/// When obsolete block versions are reclaimed.
///
/// `Deferred` schedules a purge task for idle time after a qualifying sync;
/// `Manual` suppresses automatic purges entirely and leaves reclamation to
/// explicit `purge` calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgePolicy {
    Deferred,
    Manual,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VfsOptions {
    pub durability: Durability,

    pub purge: PurgePolicy,

    /// Minimum number of accumulated purge-record entries before an automatic
    /// purge is worth scheduling.
    pub purge_at_least: usize,

    /// Payload size of one block. Must match the page size the engine is
    /// configured with.
    pub block_size: usize,
}

impl Default for VfsOptions {
    fn default() -> Self {
        VfsOptions {
            durability: Durability::Default,
            purge: PurgePolicy::Deferred,
            purge_at_least: 16,
            block_size: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = VfsOptions::default();
        assert_eq!(options.durability, Durability::Default);
        assert_eq!(options.purge, PurgePolicy::Deferred);
        assert_eq!(options.purge_at_least, 16);
        assert_eq!(options.block_size, 4096);
    }

    #[test]
    fn round_trips_through_json() {
        let options = VfsOptions {
            durability: Durability::Relaxed,
            purge: PurgePolicy::Manual,
            purge_at_least: 4,
            block_size: 8192,
        };
        let text = serde_json::to_string(&options).unwrap();
        assert!(text.contains("\"relaxed\""));
        assert!(text.contains("\"manual\""));
        let back: VfsOptions = serde_json::from_str(&text).unwrap();
        assert_eq!(back, options);
    }
}
