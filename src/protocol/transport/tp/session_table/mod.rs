//! Bounded set of active transport sessions, indexed by [`SessionKey`].
use embassy_time::Instant;

use crate::error::ResourceError;
use crate::protocol::transport::tp::config::TpConfig;
use crate::protocol::transport::tp::session::{Session, SessionKey};

/// Fixed-capacity session storage. A key is active while its session sits in
/// the table; terminal sessions are removed by the owner.
pub struct SessionTable<const N: usize> {
    slots: [Option<Session>; N],
}

impl<const N: usize> Default for SessionTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SessionTable<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Store a new session.
    ///
    /// Fails with [`ResourceError::Busy`] when a session with the same key is
    /// active (the existing one is left untouched) and with
    /// [`ResourceError::NoSessionSlot`] when every slot is taken.
    pub fn insert(&mut self, session: Session) -> Result<SessionKey, ResourceError> {
        let key = session.key();
        if self.contains(&key) {
            return Err(ResourceError::Busy);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(ResourceError::NoSessionSlot)?;
        *slot = Some(session);
        Ok(key)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.iter().find(|session| session.key() == *key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.iter_mut().find(|session| session.key() == *key)
    }

    /// Take the session out of the table.
    pub fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        self.slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(session) if session.key() == *key))
            .and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Earliest deadline or pacing instant across every session.
    pub fn next_wake(&self, config: &TpConfig) -> Option<Instant> {
        self.iter()
            .filter_map(|session| session.next_wake(config))
            .min()
    }
}
