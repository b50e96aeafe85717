// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named principals with a fixed-capacity slot array and a lifecycle state
//! machine.
//!
//! Grounded on the teacher's kernel task table (`sys/kern`): a small,
//! statically bounded array of slots addressed by index, with names
//! resolved to indices on registration and indices handed back to callers
//! as the stable identity (`spec.md` §4.6 calls this the "slot index as the
//! principal id"). Reuse-on-free mirrors how a freed task's generation is
//! recycled rather than leaking forever.

use std::any::Any;
use std::collections::HashMap;
use std::time::Instant;

use runtime_abi::{Error, PrincipalId, Result, MAX_NAME_LEN};

/// Lifecycle state, `spec.md` §4.6. Transitions are advisory: any state may
/// move to any other via [`ServiceRegistry::set_state`] except into/out of
/// [`State::Unregistered`], which only `register`/`unregister` can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Registered,
    Running,
    Paused,
    Error,
    Stopping,
}

pub struct Slot {
    pub name: String,
    pub context: Box<dyn Any + Send + Sync>,
    pub state: State,
    pub last_heartbeat: Instant,
    pub restart_attempts: u32,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: PrincipalId,
    pub name: String,
    pub state: State,
    pub restart_attempts: u32,
    pub critical: bool,
}

/// Fixed-capacity array of principal slots, indexed by [`PrincipalId`].
pub struct ServiceRegistry {
    slots: Vec<Option<Slot>>,
    by_name: HashMap<String, PrincipalId>,
    capacity: usize,
}

impl ServiceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            by_name: HashMap::new(),
            capacity,
        }
    }

    /// Registers `name` with opaque `context`. Validates name length and
    /// uniqueness, finds an empty slot, and stamps the heartbeat to now
    /// (`spec.md` §4.6 step 2).
    pub fn register(
        &mut self,
        name: &str,
        context: Box<dyn Any + Send + Sync>,
        critical: bool,
    ) -> Result<PrincipalId> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::AppContextInvalid);
        }
        if self.by_name.contains_key(name) {
            return Err(Error::ServiceAlreadyRegistered);
        }

        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::ServiceRegistryFull)?;

        self.slots[index] = Some(Slot {
            name: name.to_string(),
            context,
            state: State::Registered,
            last_heartbeat: Instant::now(),
            restart_attempts: 0,
            critical,
        });
        let id = PrincipalId(index as u16);
        self.by_name.insert(name.to_string(), id);
        log::info!("registered {id} as \"{name}\"");
        Ok(id)
    }

    /// Clears the slot and frees the id for reuse. The caller is
    /// responsible for having already torn down subscriptions and quota
    /// records (`spec.md` §4.6 unregistration steps 1-2).
    pub fn unregister(&mut self, id: PrincipalId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        let name = slot.name.clone();
        self.slots[id.index()] = None;
        self.by_name.remove(&name);
        log::info!("unregistered {id} (\"{name}\")");
        Ok(())
    }

    fn slot_mut(&mut self, id: PrincipalId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or(Error::ServiceNotFound)
    }

    fn slot(&self, id: PrincipalId) -> Result<&Slot> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .ok_or(Error::ServiceNotFound)
    }

    pub fn set_state(&mut self, id: PrincipalId, state: State) -> Result<()> {
        self.slot_mut(id)?.state = state;
        Ok(())
    }

    pub fn state(&self, id: PrincipalId) -> Result<State> {
        Ok(self.slot(id)?.state)
    }

    /// Stamps `last_heartbeat = now`. O(1), callable from any thread that
    /// holds the registry lock (`spec.md` §4.6).
    pub fn heartbeat(&mut self, id: PrincipalId) -> Result<()> {
        self.slot_mut(id)?.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn last_heartbeat(&self, id: PrincipalId) -> Result<Instant> {
        Ok(self.slot(id)?.last_heartbeat)
    }

    pub fn is_critical(&self, id: PrincipalId) -> Result<bool> {
        Ok(self.slot(id)?.critical)
    }

    pub fn restart_attempts(&self, id: PrincipalId) -> Result<u32> {
        Ok(self.slot(id)?.restart_attempts)
    }

    pub fn set_restart_attempts(&mut self, id: PrincipalId, attempts: u32) -> Result<()> {
        self.slot_mut(id)?.restart_attempts = attempts;
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<PrincipalId> {
        self.by_name.get(name).copied()
    }

    pub fn context(&self, id: PrincipalId) -> Result<&(dyn Any + Send + Sync)> {
        Ok(self.slot(id)?.context.as_ref())
    }

    pub fn info(&self, id: PrincipalId) -> Result<ServiceInfo> {
        let slot = self.slot(id)?;
        Ok(ServiceInfo {
            id,
            name: slot.name.clone(),
            state: slot.state,
            restart_attempts: slot.restart_attempts,
            critical: slot.critical,
        })
    }

    /// Bounded scan over the slot array, `spec.md` §4.6: "O(N) in the
    /// number of slots (small by design)".
    pub fn list_all(&self) -> Vec<ServiceInfo> {
        (0..self.capacity)
            .filter_map(|i| self.slots[i].as_ref().map(|s| (i, s)))
            .map(|(i, s)| ServiceInfo {
                id: PrincipalId(i as u16),
                name: s.name.clone(),
                state: s.state,
                restart_attempts: s.restart_attempts,
                critical: s.critical,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_stable_id_until_unregister() {
        let mut reg = ServiceRegistry::new(4);
        let id = reg.register("sensor", Box::new(()), false).unwrap();
        assert_eq!(reg.info(id).unwrap().name, "sensor");
        reg.set_state(id, State::Running).unwrap();
        assert_eq!(reg.info(id).unwrap().name, "sensor");
        reg.unregister(id).unwrap();
        assert_eq!(reg.info(id), Err(Error::ServiceNotFound));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = ServiceRegistry::new(4);
        reg.register("sensor", Box::new(()), false).unwrap();
        assert_eq!(
            reg.register("sensor", Box::new(()), false),
            Err(Error::ServiceAlreadyRegistered)
        );
    }

    #[test]
    fn registry_full_is_reported_past_capacity() {
        let mut reg = ServiceRegistry::new(2);
        reg.register("a", Box::new(()), false).unwrap();
        reg.register("b", Box::new(()), false).unwrap();
        assert_eq!(
            reg.register("c", Box::new(()), false),
            Err(Error::ServiceRegistryFull)
        );
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut reg = ServiceRegistry::new(1);
        let id = reg.register("a", Box::new(()), false).unwrap();
        reg.unregister(id).unwrap();
        let id2 = reg.register("b", Box::new(()), false).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn heartbeat_updates_timestamp() {
        let mut reg = ServiceRegistry::new(4);
        let id = reg.register("a", Box::new(()), false).unwrap();
        let first = reg.last_heartbeat(id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        reg.heartbeat(id).unwrap();
        assert!(reg.last_heartbeat(id).unwrap() > first);
    }
}
