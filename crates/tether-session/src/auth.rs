//! Caller authorization.
//!
//! Every gateway call carries a [`Caller`] established by the transport
//! layer (a verified bearer token). An [`Authorizer`] decides which
//! identities that caller may drive.

use std::sync::Arc;

use tether_core::{GrantStore, Identity, PersistenceError};

/// An authenticated user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Stable user ID (token subject).
    pub user_id: String,
}

impl Caller {
    /// Caller for `user_id`.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Outcome of resolving a caller's default identity.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Exactly one grant.
    Single(Identity),
    /// No grants.
    None,
    /// More than one grant; the caller must name one.
    Ambiguous(usize),
}

/// Decides what a caller may act on.
pub trait Authorizer: Send + Sync {
    /// Whether `caller` may act on `identity`.
    fn authorize(&self, caller: &Caller, identity: &Identity) -> Result<bool, PersistenceError>;

    /// The identity to use when the caller did not name one.
    fn resolve(&self, caller: &Caller) -> Result<Resolution, PersistenceError>;
}

/// [`Authorizer`] backed by stored operator grants.
pub struct GrantAuthorizer {
    grants: Arc<dyn GrantStore>,
}

impl GrantAuthorizer {
    /// Authorizer reading from `grants`.
    pub fn new(grants: Arc<dyn GrantStore>) -> Self {
        Self { grants }
    }
}

impl Authorizer for GrantAuthorizer {
    fn authorize(&self, caller: &Caller, identity: &Identity) -> Result<bool, PersistenceError> {
        self.grants.is_granted(&caller.user_id, identity)
    }

    fn resolve(&self, caller: &Caller) -> Result<Resolution, PersistenceError> {
        let mut identities = self.grants.identities_for(&caller.user_id)?;
        Ok(match identities.len() {
            0 => Resolution::None,
            1 => Resolution::Single(identities.remove(0)),
            n => Resolution::Ambiguous(n),
        })
    }
}

#[cfg(test)]
mod tests {
    use tether_core::MemoryGrantStore;

    use super::*;

    #[test]
    fn grants_drive_authorization() {
        let grants = Arc::new(MemoryGrantStore::new());
        grants.grant("alice", &Identity::from("u1"));
        let auth = GrantAuthorizer::new(grants.clone());

        assert!(auth.authorize(&Caller::new("alice"), &Identity::from("u1")).unwrap());
        assert!(!auth.authorize(&Caller::new("bob"), &Identity::from("u1")).unwrap());
        assert_eq!(
            auth.resolve(&Caller::new("alice")).unwrap(),
            Resolution::Single(Identity::from("u1"))
        );
        assert_eq!(auth.resolve(&Caller::new("bob")).unwrap(), Resolution::None);

        grants.grant("alice", &Identity::from("u2"));
        assert_eq!(auth.resolve(&Caller::new("alice")).unwrap(), Resolution::Ambiguous(2));
    }
}
