use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Scope of one grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug)]
pub struct LockRequest {
    pub mode: LockMode,
    /// When set, a denied request returns `None` instead of waiting.
    pub if_available: bool,
}

#[derive(Default)]
struct Slot {
    shared: usize,
    exclusive: bool,
    /// Bumped by a forced release so grants issued before it become inert.
    generation: u64,
    notify: Option<Arc<Notify>>,
}

impl Slot {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.exclusive,
            LockMode::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn grant_to(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::Exclusive => self.exclusive = true,
        }
    }

}

/// Named shared/exclusive locks for a group of cooperating connections.
/// A grant is held until its [`LockGrant`] is dropped; `force_release`
/// unconditionally frees a name for crash recovery.
pub struct LockService {
    slots: Mutex<HashMap<String, Slot>>,
}

impl LockService {
    pub fn new() -> Self {
        LockService { slots: Mutex::new(HashMap::new()) }
    }

    /// Acquires `name` in the requested mode. Returns `None` only for an
    /// `if_available` request that would have had to wait.
    pub async fn acquire(self: &Arc<Self>, name: &str, request: LockRequest) -> Option<LockGrant> {
        loop {
            let notify = {
                let mut slots = self.slots.lock().unwrap();
                let slot = slots.entry(name.to_string()).or_default();
                if slot.admits(request.mode) {
                    slot.grant_to(request.mode);
                    return Some(self.grant(name, request.mode, slot.generation));
                }
                if request.if_available {
                    return None;
                }
                slot.notify.get_or_insert_with(|| Arc::new(Notify::new())).clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // The holder may have released between dropping the map lock and
            // registering interest; re-check before suspending.
            {
                let mut slots = self.slots.lock().unwrap();
                let slot = slots.entry(name.to_string()).or_default();
                if slot.admits(request.mode) {
                    slot.grant_to(request.mode);
                    return Some(self.grant(name, request.mode, slot.generation));
                }
            }
            notified.await;
        }
    }

    /// Whether any grant is currently held on `name`.
    pub fn is_held(&self, name: &str) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.get(name).map(|s| s.exclusive || s.shared > 0).unwrap_or(false)
    }

    /// Unconditionally releases `name`, no matter which connection holds it.
    /// Outstanding grants become inert and their eventual drop is a no-op.
    pub fn force_release(&self, name: &str) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(name) {
            slot.shared = 0;
            slot.exclusive = false;
            slot.generation += 1;
            if let Some(notify) = &slot.notify {
                notify.notify_waiters();
            }
        }
    }

    fn grant(self: &Arc<Self>, name: &str, mode: LockMode, generation: u64) -> LockGrant {
        LockGrant { service: self.clone(), name: name.to_string(), mode, generation }
    }

    fn release(&self, name: &str, mode: LockMode, generation: u64) {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(name) else { return };
        if slot.generation != generation {
            // Force-released since this grant was issued.
            return;
        }
        match mode {
            LockMode::Shared => slot.shared = slot.shared.saturating_sub(1),
            LockMode::Exclusive => slot.exclusive = false,
        }
        if let Some(notify) = &slot.notify {
            notify.notify_waiters();
        }
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

/// A held lock. Dropping it releases the underlying grant.
pub struct LockGrant {
    service: Arc<LockService>,
    name: String,
    mode: LockMode,
    generation: u64,
}

impl Drop for LockGrant {
    fn drop(&mut self) {
        self.service.release(&self.name, self.mode, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRY_SHARED: LockRequest = LockRequest { mode: LockMode::Shared, if_available: true };
    const TRY_EXCLUSIVE: LockRequest = LockRequest { mode: LockMode::Exclusive, if_available: true };

    #[tokio::test]
    async fn shared_grants_coexist_exclusive_does_not() {
        let service = Arc::new(LockService::new());
        let a = service.acquire("db", TRY_SHARED).await;
        let b = service.acquire("db", TRY_SHARED).await;
        assert!(a.is_some() && b.is_some());
        assert!(service.acquire("db", TRY_EXCLUSIVE).await.is_none());
        drop(a);
        assert!(service.acquire("db", TRY_EXCLUSIVE).await.is_none());
        drop(b);
        assert!(service.acquire("db", TRY_EXCLUSIVE).await.is_some());
    }

    #[tokio::test]
    async fn exclusive_blocks_everything() {
        let service = Arc::new(LockService::new());
        let held = service.acquire("db", TRY_EXCLUSIVE).await.unwrap();
        assert!(service.acquire("db", TRY_SHARED).await.is_none());
        assert!(service.acquire("db", TRY_EXCLUSIVE).await.is_none());
        assert!(service.is_held("db"));
        drop(held);
        assert!(!service.is_held("db"));
    }

    #[tokio::test]
    async fn waiting_acquire_wakes_on_release() {
        let service = Arc::new(LockService::new());
        let held = service.acquire("db", TRY_EXCLUSIVE).await.unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire("db", LockRequest { mode: LockMode::Exclusive, if_available: false })
                    .await
                    .is_some()
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn forced_release_makes_old_grants_inert() {
        let service = Arc::new(LockService::new());
        let stale = service.acquire("db", TRY_EXCLUSIVE).await.unwrap();
        service.force_release("db");

        let fresh = service.acquire("db", TRY_EXCLUSIVE).await;
        assert!(fresh.is_some());
        // The stale guard drops after the name was re-granted; it must not
        // release the fresh holder's grant.
        drop(stale);
        assert!(service.is_held("db"));
        assert!(service.acquire("db", TRY_EXCLUSIVE).await.is_none());
    }

    #[tokio::test]
    async fn names_are_independent() {
        let service = Arc::new(LockService::new());
        let _a = service.acquire("a", TRY_EXCLUSIVE).await.unwrap();
        assert!(service.acquire("b", TRY_EXCLUSIVE).await.is_some());
    }
}
