//! Per-worker RRef registry.
//!
//! The [`RRefContext`] is the single place a worker records which RRefs it
//! owns and which forks of them are alive elsewhere. Transport callbacks and
//! application code call into it concurrently; one mutex guards both maps and
//! is only held for short, I/O-free critical sections. Messages are sent
//! after the lock is released.

mod fork_table;

pub use fork_table::ForkTable;

use crate::agent::{FutureMessage, InFlight, RpcAgent};
use crate::types::{DistributedError, DistributedResult, EvictionPolicy};
use rref_core::error::RRefError;
use rref_core::message::{Message, MessageType, RRefCreatePayload, RRefForkData};
use rref_core::rref::{OwnerRRef, RRef, UserRRef};
use rref_core::types::{ForkId, RRefId, WorkerId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

struct RegistryState<T> {
    owners: HashMap<RRefId, Arc<OwnerRRef<T>>>,
    forks: HashMap<RRefId, ForkTable>,
    /// Ids whose entry was evicted. Fork messages for them are late or
    /// duplicated and must not bring the entry back.
    evicted: HashSet<RRefId>,
}

impl<T> RegistryState<T> {
    /// Register an empty owner entry unless one exists. Returns whether it
    /// was created.
    fn ensure_owner(&mut self, owner: &WorkerId, rref_id: RRefId) -> bool {
        self.forks.entry(rref_id).or_default();
        if self.owners.contains_key(&rref_id) {
            return false;
        }
        self.owners
            .insert(rref_id, Arc::new(OwnerRRef::new(owner.id(), rref_id)));
        true
    }

    fn is_unreferenced(&self, rref_id: &RRefId) -> bool {
        let forks_empty = self.forks.get(rref_id).map_or(true, ForkTable::is_empty);
        let unshared = self
            .owners
            .get(rref_id)
            .map_or(true, |owner| Arc::strong_count(owner) == 1);
        forks_empty && unshared
    }

    fn evict(&mut self, rref_id: &RRefId) {
        self.owners.remove(rref_id);
        self.forks.remove(rref_id);
        self.evicted.insert(*rref_id);
    }
}

/// Registry of one worker's RRefs.
///
/// Owns RRefId → owner entry and RRefId → live forks. Create one per worker
/// and share it behind an `Arc`.
pub struct RRefContext<T> {
    worker_id: WorkerId,
    agent: OnceLock<Arc<dyn RpcAgent>>,
    policy: EvictionPolicy,
    state: Mutex<RegistryState<T>>,
    /// Unacknowledged child-fork registrations, keyed by the fork id of the
    /// user handle they were forked from.
    children: Mutex<HashMap<ForkId, Arc<InFlight>>>,
}

impl<T> RRefContext<T> {
    /// Create a context that keeps owner entries until swept explicitly.
    pub fn new(worker_id: WorkerId) -> Self {
        Self::with_policy(worker_id, EvictionPolicy::default())
    }

    pub fn with_policy(worker_id: WorkerId, policy: EvictionPolicy) -> Self {
        Self {
            worker_id,
            agent: OnceLock::new(),
            policy,
            state: Mutex::new(RegistryState {
                owners: HashMap::new(),
                forks: HashMap::new(),
                evicted: HashSet::new(),
            }),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Install the worker's agent.
    ///
    /// Seeding again with the same agent is a no-op.
    ///
    /// # Errors
    ///
    /// - [`DistributedError::AgentMismatch`] if the agent belongs to another
    ///   worker.
    /// - [`DistributedError::AgentAlreadySet`] if a different agent was
    ///   installed before.
    pub fn seed_agent(&self, agent: Arc<dyn RpcAgent>) -> DistributedResult<()> {
        if *agent.worker_id() != self.worker_id {
            return Err(DistributedError::AgentMismatch {
                expected: self.worker_id.id(),
                actual: agent.worker_id().id(),
            });
        }
        let installed = self.agent.get_or_init(|| Arc::clone(&agent));
        if same_agent(installed, &agent) {
            Ok(())
        } else {
            Err(DistributedError::AgentAlreadySet)
        }
    }

    /// The agent this context sends through.
    pub fn agent(&self) -> DistributedResult<&Arc<dyn RpcAgent>> {
        self.agent.get().ok_or(DistributedError::AgentNotSet)
    }

    /// Mint a fresh RRef id on this worker.
    pub fn gen_rref_id(&self) -> RRefId {
        RRefId::next(self.worker_id.id())
    }

    /// Mint a fresh fork id on this worker.
    pub fn gen_fork_id(&self) -> ForkId {
        ForkId::next(self.worker_id.id())
    }

    /// Create a new RRef owned by `owner`.
    ///
    /// For this worker the owner entry is registered with an empty value
    /// slot. For any other worker a user handle with fresh ids is returned
    /// and the registry is left alone.
    pub fn create_rref(&self, owner: &WorkerId) -> RRef<T> {
        let rref_id = self.gen_rref_id();
        if self.is_local(owner) {
            let entry = Arc::new(OwnerRRef::new(owner.id(), rref_id));
            {
                let mut state = self.lock();
                state.owners.insert(rref_id, Arc::clone(&entry));
                state.forks.entry(rref_id).or_default();
            }
            debug!("{} created owner {}", self.worker_id, rref_id);
            RRef::Owner(entry)
        } else {
            RRef::User(UserRRef::new(owner.clone(), rref_id, self.gen_fork_id()))
        }
    }

    /// Create an owned RRef holding `value`.
    pub fn create_owned(&self, value: T) -> Arc<OwnerRRef<T>> {
        let rref_id = self.gen_rref_id();
        let entry = Arc::new(OwnerRRef::with_value(self.worker_id.id(), rref_id, value));
        {
            let mut state = self.lock();
            state.owners.insert(rref_id, Arc::clone(&entry));
            state.forks.entry(rref_id).or_default();
        }
        debug!("{} created owner {} with value", self.worker_id, rref_id);
        entry
    }

    /// Resolve an RRef named by a remote message.
    ///
    /// If this worker is the owner the owner entry is fetched or created;
    /// otherwise a user handle wrapping the given identity is returned.
    pub fn get_or_create_rref(&self, owner: &WorkerId, rref_id: RRefId, fork_id: ForkId) -> RRef<T> {
        if self.is_local(owner) {
            RRef::Owner(self.get_or_create_owner_rref(rref_id))
        } else {
            RRef::User(UserRRef::new(owner.clone(), rref_id, fork_id))
        }
    }

    /// Like [`RRefContext::get_or_create_rref`], decoding the identity from a
    /// transmitted payload.
    pub fn get_or_create_rref_from_payload(&self, payload: &[u8]) -> DistributedResult<RRef<T>> {
        let data = RRefForkData::from_payload(payload)?;
        Ok(self.get_or_create_rref(&data.owner, data.rref_id, data.fork_id))
    }

    /// Build a user handle for an RRef owned elsewhere.
    ///
    /// # Errors
    ///
    /// Fails with [`RRefError::OwnerCreatesUser`] when `owner` is this
    /// worker.
    pub fn create_user_rref(
        &self,
        owner: &WorkerId,
        rref_id: RRefId,
        fork_id: ForkId,
    ) -> DistributedResult<UserRRef> {
        if self.is_local(owner) {
            return Err(RRefError::OwnerCreatesUser(owner.id()).into());
        }
        Ok(UserRRef::new(owner.clone(), rref_id, fork_id))
    }

    /// Fetch the owner entry for `rref_id`, creating it if absent.
    ///
    /// Concurrent calls for the same id all return the same entry. Calling
    /// this for an evicted id registers it afresh.
    pub fn get_or_create_owner_rref(&self, rref_id: RRefId) -> Arc<OwnerRRef<T>> {
        let (entry, created) = {
            let mut state = self.lock();
            state.evicted.remove(&rref_id);
            let created = state.ensure_owner(&self.worker_id, rref_id);
            (Arc::clone(&state.owners[&rref_id]), created)
        };
        if created {
            debug!("{} materialized owner {}", self.worker_id, rref_id);
        }
        entry
    }

    /// The owner entry for `rref_id`, if registered.
    pub fn owner_rref(&self, rref_id: RRefId) -> Option<Arc<OwnerRRef<T>>> {
        self.lock().owners.get(&rref_id).cloned()
    }

    /// The owner entry a remote message names, created on first contact.
    ///
    /// # Errors
    ///
    /// - [`RRefError::NotOwner`] if `data` names another owner.
    /// - [`RRefError::UnknownRRef`] if the entry was evicted.
    pub fn resolve_owner(&self, data: &RRefForkData) -> DistributedResult<Arc<OwnerRRef<T>>> {
        self.check_owner(data)?;
        let (entry, created) = {
            let mut state = self.lock();
            if state.evicted.contains(&data.rref_id) {
                return Err(RRefError::UnknownRRef(data.rref_id).into());
            }
            let created = state.ensure_owner(&self.worker_id, data.rref_id);
            (Arc::clone(&state.owners[&data.rref_id]), created)
        };
        if created {
            debug!("{} materialized owner {} from message", self.worker_id, data.rref_id);
        }
        Ok(entry)
    }

    /// Register the fork carried by `payload`.
    ///
    /// Returns whether the fork set changed. Duplicates, forks released
    /// before their add arrived and forks of evicted entries are no-ops.
    pub fn add_fork(&self, payload: &[u8]) -> DistributedResult<bool> {
        let data = RRefForkData::from_payload(payload)?;
        self.add_fork_data(&data)
    }

    pub fn add_fork_data(&self, data: &RRefForkData) -> DistributedResult<bool> {
        self.check_owner(data)?;
        let (created, added) = {
            let mut state = self.lock();
            if state.evicted.contains(&data.rref_id) {
                trace!("{} ignored add of fork {} of evicted {}", self.worker_id, data.fork_id, data.rref_id);
                return Ok(false);
            }
            let created = state.ensure_owner(&self.worker_id, data.rref_id);
            let added = state
                .forks
                .entry(data.rref_id)
                .or_default()
                .insert(data.fork_id);
            (created, added)
        };

        if created {
            debug!("{} materialized owner {} from fork message", self.worker_id, data.rref_id);
        }
        if added {
            debug!("{} added fork {} of {}", self.worker_id, data.fork_id, data.rref_id);
        } else {
            trace!("{} ignored add of fork {}", self.worker_id, data.fork_id);
        }
        Ok(added)
    }

    /// Release the fork carried by `payload`.
    ///
    /// Returns whether the fork was live. Releasing an absent fork is a
    /// no-op apart from remembering it, so that a late add is dropped.
    pub fn del_fork(&self, payload: &[u8]) -> DistributedResult<bool> {
        let data = RRefForkData::from_payload(payload)?;
        self.del_fork_data(&data)
    }

    pub fn del_fork_data(&self, data: &RRefForkData) -> DistributedResult<bool> {
        self.check_owner(data)?;
        let (created, removed, evicted) = {
            let mut state = self.lock();
            if state.evicted.contains(&data.rref_id) {
                trace!("{} ignored release of fork {} of evicted {}", self.worker_id, data.fork_id, data.rref_id);
                return Ok(false);
            }
            let created = state.ensure_owner(&self.worker_id, data.rref_id);
            let removed = state
                .forks
                .entry(data.rref_id)
                .or_default()
                .remove(data.fork_id);
            let evicted = removed
                && self.policy == EvictionPolicy::WhenUnreferenced
                && state.is_unreferenced(&data.rref_id);
            if evicted {
                state.evict(&data.rref_id);
            }
            (created, removed, evicted)
        };

        if created {
            debug!("{} materialized owner {} from fork message", self.worker_id, data.rref_id);
        }
        if removed {
            debug!("{} released fork {} of {}", self.worker_id, data.fork_id, data.rref_id);
        } else {
            trace!("{} ignored release of fork {}", self.worker_id, data.fork_id);
        }
        if evicted {
            debug!("{} evicted owner {}", self.worker_id, data.rref_id);
        }
        Ok(removed)
    }

    /// Hand out a new fork of a locally owned RRef.
    ///
    /// The fork is registered before it is returned, so the receiving user
    /// needs no add message of its own.
    pub fn fork_owner(&self, rref_id: RRefId) -> DistributedResult<RRefForkData> {
        let fork_id = self.gen_fork_id();
        {
            let mut state = self.lock();
            if !state.owners.contains_key(&rref_id) {
                return Err(RRefError::UnknownRRef(rref_id).into());
            }
            state.forks.entry(rref_id).or_default().insert(fork_id);
        }
        debug!("{} forked owner {} as {}", self.worker_id, rref_id, fork_id);
        Ok(RRefForkData::new(self.worker_id.clone(), rref_id, fork_id))
    }

    /// Live forks of `rref_id`; empty if unknown.
    pub fn forks_of(&self, rref_id: RRefId) -> HashSet<ForkId> {
        self.lock()
            .forks
            .get(&rref_id)
            .map(ForkTable::live)
            .unwrap_or_default()
    }

    pub fn fork_count(&self, rref_id: RRefId) -> usize {
        self.lock().forks.get(&rref_id).map_or(0, ForkTable::len)
    }

    /// Number of registered owner entries.
    pub fn owner_count(&self) -> usize {
        self.lock().owners.len()
    }

    /// Drop every owner entry without live forks that no handle outside the
    /// registry holds. Released-fork memory of those entries goes with them;
    /// only the evicted id is remembered, so later fork messages for it are
    /// ignored.
    ///
    /// Returns the number of entries evicted.
    pub fn evict_unreferenced(&self) -> usize {
        let evicted: Vec<RRefId> = {
            let mut state = self.lock();
            let candidates: Vec<RRefId> = state
                .owners
                .keys()
                .copied()
                .filter(|id| state.is_unreferenced(id))
                .collect();
            for id in &candidates {
                state.evict(id);
            }
            candidates
        };
        if !evicted.is_empty() {
            info!("{} evicted {} unreferenced owners", self.worker_id, evicted.len());
        }
        evicted.len()
    }

    fn is_local(&self, worker: &WorkerId) -> bool {
        worker.id() == self.worker_id.id()
    }

    fn check_owner(&self, data: &RRefForkData) -> DistributedResult<()> {
        if self.is_local(&data.owner) {
            Ok(())
        } else {
            Err(RRefError::NotOwner {
                rref_id: data.rref_id,
                owner: data.owner.id(),
                worker: self.worker_id.id(),
            }
            .into())
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_children(&self) -> MutexGuard<'_, HashMap<ForkId, Arc<InFlight>>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Messages to owners. None of these wait for the owner; the returned
/// futures complete with its reply.
impl<T> RRefContext<T> {
    /// Tell the owner that `user` exists, optionally handing it the value.
    pub fn notify_owner_create(&self, user: &UserRRef, value: Option<&T>) -> DistributedResult<FutureMessage>
    where
        T: Serialize,
    {
        let value = value.map(serde_json::to_value).transpose()?;
        let payload = RRefCreatePayload {
            fork: user.fork_data(),
            value,
        };
        let message = Message::encode(MessageType::RRefCreate, &payload)?;
        Ok(self.agent()?.send(user.owner(), message))
    }

    /// Fork a user handle for another worker.
    ///
    /// Mints the new fork id here and registers it at the owner. The
    /// returned fork data is what the receiving worker turns into its handle.
    /// The registration counts against `user` until the owner acknowledges
    /// it, whether or not the returned future is awaited.
    ///
    /// Must be called within a Tokio runtime.
    pub fn fork_user(&self, user: &UserRRef) -> DistributedResult<(RRefForkData, FutureMessage)> {
        let runtime = Handle::try_current().map_err(|_| DistributedError::NoRuntime)?;
        let agent = self.agent()?;
        let fork = RRefForkData::new(user.owner().clone(), user.id(), self.gen_fork_id());
        let message = Message::new(MessageType::RRefAddFork, fork.to_payload()?);

        let children = Arc::clone(self.lock_children().entry(user.fork_id()).or_default());
        let (slot, registered) = FutureMessage::tracked(&children);
        let reply = agent.send(user.owner(), message);
        runtime.spawn(async move { slot.complete(reply.await) });
        Ok((fork, registered))
    }

    /// Release a user handle at its owner.
    ///
    /// Transports deliver concurrently, so the release is only sent once the
    /// owner has acknowledged every fork made from `user`.
    pub async fn release_user(&self, user: UserRRef) -> DistributedResult<FutureMessage> {
        let agent = Arc::clone(self.agent()?);
        let pending = self.lock_children().remove(&user.fork_id());
        if let Some(pending) = pending {
            if pending.count() > 0 {
                debug!(
                    "{} waits for {} forks of {} before release",
                    self.worker_id,
                    pending.count(),
                    user.fork_id()
                );
            }
            pending.drained().await;
        }
        let message = Message::new(MessageType::RRefDelFork, user.fork_data().to_payload()?);
        Ok(agent.send(user.owner(), message))
    }

    /// Fetch the value behind `user` from its owner.
    ///
    /// Completes once the owner has a value.
    pub async fn fetch_value(&self, user: &UserRRef) -> DistributedResult<T>
    where
        T: DeserializeOwned,
    {
        let message = Message::new(MessageType::RRefFetch, user.fork_data().to_payload()?);
        let reply = self.agent()?.send(user.owner(), message).await?;
        match reply.message_type() {
            MessageType::RRefFetchRet => Ok(reply.decode()?),
            MessageType::Exception => Err(DistributedError::RemoteException(
                reply.exception_text().unwrap_or_default(),
            )),
            other => Err(DistributedError::UnexpectedReply(other)),
        }
    }
}

fn same_agent(a: &Arc<dyn RpcAgent>, b: &Arc<dyn RpcAgent>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
