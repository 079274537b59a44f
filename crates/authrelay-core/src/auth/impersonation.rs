//! Scoped impersonation of an authenticated caller.
//!
//! Impersonation never changes any ambient identity. Instead, an established
//! accepting [`SecurityContext`](super::SecurityContext) hands out a
//! [`ScopedIdentity`] value that carries the caller's principal and is passed
//! explicitly to whatever acts on the caller's behalf. At most one scope is
//! live per context; the scope is released when it is dropped, when
//! [`ScopedIdentity::release`] is called, or when the context reverts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::credentials::Credential;
use super::principal::Principal;
use crate::error::{AuthError, AuthResult};

const NO_SCOPE: u64 = 0;

/// Per-context record of the active scope, if any.
#[derive(Debug, Default)]
pub(crate) struct ImpersonationSlot {
    active: AtomicU64,
    next_generation: AtomicU64,
}

impl ImpersonationSlot {
    fn acquire(&self) -> AuthResult<u64> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.active
            .compare_exchange(NO_SCOPE, generation, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| generation)
            .map_err(|_| AuthError::ImpersonationActive)
    }

    fn release(&self, generation: u64) {
        // A newer scope may own the slot after a revert; leave it alone.
        let _ = self.active.compare_exchange(
            generation,
            NO_SCOPE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn revert(&self) {
        self.active.store(NO_SCOPE, Ordering::Release);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != NO_SCOPE
    }

    fn holds(&self, generation: u64) -> bool {
        self.active.load(Ordering::Acquire) == generation
    }
}

/// The right to act as an authenticated caller for one logical operation.
///
/// Not `Clone`: a scope is owned by exactly one flow and released once.
#[derive(Debug)]
pub struct ScopedIdentity {
    principal: Principal,
    slot: Arc<ImpersonationSlot>,
    generation: u64,
}

impl ScopedIdentity {
    pub(crate) fn acquire(slot: &Arc<ImpersonationSlot>, principal: Principal) -> AuthResult<Self> {
        let generation = slot.acquire()?;
        Ok(Self {
            principal,
            slot: Arc::clone(slot),
            generation,
        })
    }

    /// Whether this scope can still be used.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.slot.holds(self.generation)
    }

    /// The impersonated caller.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ImpersonationReleased`] once the scope is reverted.
    pub fn principal(&self) -> AuthResult<&Principal> {
        if self.is_active() {
            Ok(&self.principal)
        } else {
            Err(AuthError::ImpersonationReleased)
        }
    }

    /// Credential that lets an outbound handshake act as the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ImpersonationReleased`] once the scope is reverted.
    pub fn delegated_credential(&self) -> AuthResult<Credential> {
        Ok(Credential::Impersonated {
            principal: self.principal()?.clone(),
        })
    }

    /// Release the scope now instead of at drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ScopedIdentity {
    fn drop(&mut self) {
        self.slot.release(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;

    fn alice() -> Principal {
        Principal::new("alice", AuthMethod::Password)
    }

    #[test]
    fn test_one_scope_at_a_time() {
        let slot = Arc::new(ImpersonationSlot::default());
        let scope = ScopedIdentity::acquire(&slot, alice()).unwrap();
        assert!(slot.is_active());
        assert_eq!(
            ScopedIdentity::acquire(&slot, alice()).unwrap_err(),
            AuthError::ImpersonationActive
        );

        drop(scope);
        assert!(!slot.is_active());
        let again = ScopedIdentity::acquire(&slot, alice()).unwrap();
        assert_eq!(again.principal().unwrap().name, "alice");
    }

    #[test]
    fn test_revert_invalidates_scope() {
        let slot = Arc::new(ImpersonationSlot::default());
        let scope = ScopedIdentity::acquire(&slot, alice()).unwrap();
        slot.revert();

        assert!(!scope.is_active());
        assert_eq!(scope.principal().unwrap_err(), AuthError::ImpersonationReleased);
        assert!(scope.delegated_credential().is_err());
    }

    #[test]
    fn test_stale_scope_does_not_release_newer_one() {
        let slot = Arc::new(ImpersonationSlot::default());
        let stale = ScopedIdentity::acquire(&slot, alice()).unwrap();
        slot.revert();
        let fresh = ScopedIdentity::acquire(&slot, alice()).unwrap();

        drop(stale);
        assert!(fresh.is_active());
        fresh.release();
        assert!(!slot.is_active());
    }

    #[test]
    fn test_delegated_credential() {
        let slot = Arc::new(ImpersonationSlot::default());
        let scope = ScopedIdentity::acquire(&slot, alice()).unwrap();
        assert_eq!(
            scope.delegated_credential().unwrap(),
            Credential::Impersonated { principal: alice() }
        );
    }

    #[test]
    fn test_released_on_panic() {
        let slot = Arc::new(ImpersonationSlot::default());
        let inner = Arc::clone(&slot);
        let result = std::panic::catch_unwind(move || {
            let _scope = ScopedIdentity::acquire(&inner, alice()).unwrap();
            panic!("handler failed");
        });
        assert!(result.is_err());
        assert!(!slot.is_active());
    }
}
