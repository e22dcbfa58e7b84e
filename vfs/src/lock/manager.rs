use std::sync::Arc;

use crate::error::{Error, VfsResult};
use crate::lock::service::{LockGrant, LockMode, LockRequest, LockService};

/// Engine lock levels, in escalation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    None = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

impl TryFrom<u8> for LockLevel {
    type Error = Error;

    fn try_from(level: u8) -> VfsResult<LockLevel> {
        match level {
            0 => Ok(LockLevel::None),
            1 => Ok(LockLevel::Shared),
            2 => Ok(LockLevel::Reserved),
            3 => Ok(LockLevel::Pending),
            4 => Ok(LockLevel::Exclusive),
            other => Err(Error::Internal(format!("invalid lock level {other}"))),
        }
    }
}

/// Per-file escalation state machine over the host lock service.
///
/// Two host locks back the five levels. Reaching SHARED takes the file's
/// gate lock exclusively, so a connection inside any transaction keeps every
/// other connection at NONE until it unlocks, which is the single-writer
/// policy the commit protocol assumes. Reaching RESERVED additionally takes the
/// `-reserved` lock, which is what `reserved` probes across connections.
/// PENDING and EXCLUSIVE are bookkeeping under the already-exclusive gate.
///
/// Every acquisition is non-blocking: a denied escalation reports
/// [`Error::Busy`] and leaves the current level untouched.
pub struct LockManager {
    service: Arc<LockService>,
    name: String,
    level: LockLevel,
    gate: Option<LockGrant>,
    reserved: Option<LockGrant>,
}

fn reserved_name(name: &str) -> String {
    format!("{name}-reserved")
}

impl LockManager {
    pub fn new(service: Arc<LockService>, name: String) -> Self {
        LockManager { service, name, level: LockLevel::None, gate: None, reserved: None }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Escalates to `target`. Idempotent when the current level already
    /// satisfies it.
    pub async fn lock(&mut self, target: LockLevel) -> VfsResult<()> {
        if self.level >= target {
            return Ok(());
        }
        if self.level == LockLevel::None {
            let request = LockRequest { mode: LockMode::Exclusive, if_available: true };
            match self.service.acquire(&self.name, request).await {
                Some(grant) => self.gate = Some(grant),
                None => return Err(Error::Busy),
            }
            self.level = LockLevel::Shared;
        }
        if target >= LockLevel::Reserved && self.level < LockLevel::Reserved {
            let request = LockRequest { mode: LockMode::Exclusive, if_available: true };
            match self.service.acquire(&reserved_name(&self.name), request).await {
                Some(grant) => self.reserved = Some(grant),
                None => return Err(Error::Busy),
            }
            self.level = LockLevel::Reserved;
        }
        if target > self.level {
            self.level = target;
        }
        Ok(())
    }

    /// Downgrades to `target`. Does nothing when the current level is
    /// already at or below it.
    pub fn unlock(&mut self, target: LockLevel) {
        if target >= self.level {
            return;
        }
        if target < LockLevel::Reserved {
            self.reserved = None;
        }
        if target < LockLevel::Shared {
            self.gate = None;
        }
        self.level = target;
    }

    /// Whether any connection, this one included, holds RESERVED or higher.
    pub fn reserved(&self) -> bool {
        self.level >= LockLevel::Reserved || self.service.is_held(&reserved_name(&self.name))
    }

    /// Recovery hook: releases this file's host locks no matter who holds
    /// them. The abandoned holder's grants become inert.
    pub fn force_clear(service: &LockService, name: &str) {
        service.force_release(name);
        service.force_release(&reserved_name(name));
    }
}
