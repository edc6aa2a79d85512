// ── Mnemo Engine: Robot Groups ──────────────────────────────────────────────
//
// A named set of robots sharing one working memory. Members split into
// `active` (owners of writes, round-robin) and `passive` (read-only
// standbys that keep a warm copy and can be promoted on failover).
//
// Convergence model: a write through any active member is synchronized into
// every member's `robot_nodes.working_memory` flags — synchronously by the
// group itself, and again by the group's change channel for anything the
// direct pass missed (other group instances, late joiners). Both paths are
// idempotent, so duplicate application is harmless and ordering across
// publishers does not matter.
//
// Every member's in-process working memory runs with the group's token
// budget, so the deduplicated union never exceeds it once the members are
// in sync.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChangeKind, GroupStatus, RecallHit, SyncReport};
use crate::engine::agent::{Agent, Engine, RecallOptions};
use crate::engine::change_bus::Subscription;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

struct GroupInner {
    active: Vec<Agent>,
    passive: Vec<Agent>,
    rr_next: usize,
}

impl GroupInner {
    fn all(&self) -> Vec<Agent> {
        self.active.iter().chain(self.passive.iter()).cloned().collect()
    }

    fn position(&self, name: &str) -> Option<(bool, usize)> {
        if let Some(i) = self.active.iter().position(|a| a.name() == name) {
            return Some((true, i));
        }
        self.passive.iter().position(|a| a.name() == name).map(|i| (false, i))
    }
}

/// A robot group over a shared engine.
pub struct RobotGroup {
    name: String,
    engine: Arc<Engine>,
    max_tokens: usize,
    inner: Arc<Mutex<GroupInner>>,
    _subscription: Subscription,
}

impl RobotGroup {
    /// Create an empty group and start its change-channel listener.
    pub fn new(engine: Arc<Engine>, name: &str, max_tokens: usize) -> EngineResult<Self> {
        if name.is_empty() {
            return Err(EngineError::validation("group", "name must not be empty"));
        }
        if max_tokens == 0 {
            return Err(EngineError::validation("max_tokens", "must be at least 1"));
        }

        let inner = Arc::new(Mutex::new(GroupInner {
            active: Vec::new(),
            passive: Vec::new(),
            rr_next: 0,
        }));

        // The listener applies incoming events to every member except the
        // originator. Handlers are silent (no republish) so one write never
        // echoes around the channel.
        let listener_inner = inner.clone();
        let subscription = engine.bus().subscribe(
            name,
            Arc::new(move |event| {
                let members: Vec<Agent> = {
                    let inner = listener_inner.lock();
                    inner.all().into_iter().filter(|a| a.robot().id != event.robot_id).collect()
                };
                for member in members {
                    let result = match (event.event, event.node_id) {
                        (ChangeKind::Added, Some(node_id)) => member.apply_added(node_id),
                        (ChangeKind::Evicted, Some(node_id)) => member.apply_evicted(node_id),
                        (ChangeKind::Cleared, _) => member.apply_cleared(),
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!("[group] sync of {} failed: {e}", member.name());
                    }
                }
            }),
        );

        Ok(Self {
            name: name.to_string(),
            engine,
            max_tokens,
            inner,
            _subscription: subscription,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Membership ──────────────────────────────────────────────────────

    /// Add a write-owning member. Fails on duplicates in either set.
    pub fn add_active(&self, robot_name: &str) -> EngineResult<()> {
        self.add_member(robot_name, true)
    }

    /// Add a read-only standby. Fails on duplicates in either set.
    pub fn add_passive(&self, robot_name: &str) -> EngineResult<()> {
        self.add_member(robot_name, false)
    }

    fn add_member(&self, robot_name: &str, active: bool) -> EngineResult<()> {
        {
            let inner = self.inner.lock();
            if inner.position(robot_name).is_some() {
                return Err(EngineError::validation(
                    "member",
                    format!("{robot_name:?} is already in the group"),
                ));
            }
        }
        let mut agent = self.engine.agent_with_budget(robot_name, self.max_tokens)?;
        agent.set_channel(Some(self.name.clone()));

        {
            let mut inner = self.inner.lock();
            if active {
                inner.active.push(agent);
            } else {
                inner.passive.push(agent);
            }
        }
        // Late joiners inherit the group's current working set.
        self.sync_robot(robot_name)?;
        info!(
            "[group:{}] added {} member {robot_name}",
            self.name,
            if active { "active" } else { "passive" }
        );
        Ok(())
    }

    /// Remove a member from either set.
    pub fn remove(&self, robot_name: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        match inner.position(robot_name) {
            Some((true, i)) => {
                inner.active.remove(i);
                Ok(())
            }
            Some((false, i)) => {
                inner.passive.remove(i);
                Ok(())
            }
            None => Err(EngineError::not_found("member", robot_name)),
        }
    }

    /// Move a passive member into the active set.
    pub fn promote(&self, robot_name: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        match inner.position(robot_name) {
            Some((false, i)) => {
                let agent = inner.passive.remove(i);
                inner.active.push(agent);
                Ok(())
            }
            Some((true, _)) => Err(EngineError::validation(
                "member",
                format!("{robot_name:?} is already active"),
            )),
            None => Err(EngineError::not_found("member", robot_name)),
        }
    }

    /// Move an active member into the passive set. The last active member
    /// cannot be demoted.
    pub fn demote(&self, robot_name: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        match inner.position(robot_name) {
            Some((true, i)) => {
                if inner.active.len() == 1 {
                    return Err(EngineError::validation(
                        "member",
                        "cannot demote the last active member",
                    ));
                }
                let agent = inner.active.remove(i);
                inner.passive.push(agent);
                Ok(())
            }
            Some((false, _)) => Err(EngineError::validation(
                "member",
                format!("{robot_name:?} is already passive"),
            )),
            None => Err(EngineError::not_found("member", robot_name)),
        }
    }

    /// Promote the first passive member. Fails when no standby exists.
    pub fn failover(&self) -> EngineResult<String> {
        let promoted = {
            let mut inner = self.inner.lock();
            if inner.passive.is_empty() {
                return Err(EngineError::validation("group", "no passive members to fail over to"));
            }
            let agent = inner.passive.remove(0);
            let name = agent.name().to_string();
            inner.active.push(agent);
            name
        };
        info!("[group:{}] failover: promoted {promoted}", self.name);
        Ok(promoted)
    }

    pub fn active_names(&self) -> Vec<String> {
        self.inner.lock().active.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn passive_names(&self) -> Vec<String> {
        self.inner.lock().passive.iter().map(|a| a.name().to_string()).collect()
    }

    /// Clone a member's agent handle (shared working memory).
    pub fn member(&self, robot_name: &str) -> Option<Agent> {
        let inner = self.inner.lock();
        inner
            .active
            .iter()
            .chain(inner.passive.iter())
            .find(|a| a.name() == robot_name)
            .cloned()
    }

    // ── Writes & reads ──────────────────────────────────────────────────

    /// Write through an active member (the stated originator, or round-robin)
    /// and synchronize the node into every other member.
    pub async fn remember(
        &self,
        content: &str,
        tags: &[String],
        metadata: &std::collections::HashMap<String, serde_json::Value>,
        originator: Option<&str>,
    ) -> EngineResult<i64> {
        let writer = self.pick_writer(originator)?;
        let node_id = writer.remember(content, tags, metadata).await?;

        // Direct synchronization; the channel covers anyone this pass
        // cannot see.
        let others: Vec<Agent> = {
            let inner = self.inner.lock();
            inner.all().into_iter().filter(|a| a.robot().id != writer.robot().id).collect()
        };
        for member in others {
            member.apply_added(node_id)?;
        }
        Ok(node_id)
    }

    fn pick_writer(&self, originator: Option<&str>) -> EngineResult<Agent> {
        let mut inner = self.inner.lock();
        if inner.active.is_empty() {
            return Err(EngineError::validation("group", "no active members"));
        }
        match originator {
            Some(name) => inner
                .active
                .iter()
                .find(|a| a.name() == name)
                .cloned()
                .ok_or_else(|| {
                    EngineError::validation(
                        "originator",
                        format!("{name:?} is not an active member"),
                    )
                }),
            None => {
                let i = inner.rr_next % inner.active.len();
                inner.rr_next = inner.rr_next.wrapping_add(1);
                Ok(inner.active[i].clone())
            }
        }
    }

    /// Hybrid recall scoped to nodes associated with any current member.
    pub async fn recall(&self, query: &str, mut opts: RecallOptions) -> EngineResult<Vec<RecallHit>> {
        let (reader, robot_ids) = {
            let inner = self.inner.lock();
            let reader = inner
                .active
                .first()
                .or_else(|| inner.passive.first())
                .cloned()
                .ok_or_else(|| EngineError::validation("group", "group has no members"))?;
            let ids: Vec<i64> = inner.all().iter().map(|a| a.robot().id).collect();
            (reader, ids)
        };

        let scope: HashSet<i64> =
            self.engine.store().node_ids_for_robots(&robot_ids)?.into_iter().collect();
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        opts.scope = Some(scope);
        reader.recall(query, opts).await
    }

    // ── Synchronization ─────────────────────────────────────────────────

    /// Distinct node ids across every member's working set.
    fn union_ids(&self) -> EngineResult<BTreeSet<i64>> {
        let members = self.inner.lock().all();
        let mut union = BTreeSet::new();
        for member in &members {
            union.extend(self.engine.store().working_set_ids(member.robot().id)?);
        }
        Ok(union)
    }

    /// Bring one member up to the union of the group's working sets.
    /// Returns how many nodes were added to it.
    pub fn sync_robot(&self, robot_name: &str) -> EngineResult<usize> {
        let member = self
            .member(robot_name)
            .ok_or_else(|| EngineError::not_found("member", robot_name))?;
        let union = self.union_ids()?;
        let held: HashSet<i64> =
            self.engine.store().working_set_ids(member.robot().id)?.into_iter().collect();

        let mut added = 0;
        for node_id in union {
            if !held.contains(&node_id) {
                member.apply_added(node_id)?;
                added += 1;
            }
        }
        Ok(added)
    }

    /// Bring every member up to the union.
    pub fn sync_all(&self) -> EngineResult<SyncReport> {
        let union = self.union_ids()?;
        let members = self.inner.lock().all();

        let mut members_updated = 0;
        for member in &members {
            let held: HashSet<i64> =
                self.engine.store().working_set_ids(member.robot().id)?.into_iter().collect();
            let mut changed = false;
            for node_id in &union {
                if !held.contains(node_id) {
                    member.apply_added(*node_id)?;
                    changed = true;
                }
            }
            if changed {
                members_updated += 1;
            }
        }
        Ok(SyncReport { synced_nodes: union.len(), members_updated })
    }

    /// Move the working-memory flag for everything `src` holds onto `dst`.
    pub fn transfer_working_memory(
        &self,
        src: &str,
        dst: &str,
        clear_source: bool,
    ) -> EngineResult<usize> {
        let src_agent =
            self.member(src).ok_or_else(|| EngineError::not_found("member", src))?;
        let dst_agent =
            self.member(dst).ok_or_else(|| EngineError::not_found("member", dst))?;

        let held = self.engine.store().working_set_ids(src_agent.robot().id)?;
        for node_id in &held {
            dst_agent.apply_added(*node_id)?;
            if clear_source {
                src_agent.apply_evicted(*node_id)?;
            }
        }
        Ok(held.len())
    }

    /// True iff every member's working set is set-equal.
    pub fn in_sync(&self) -> EngineResult<bool> {
        let members = self.inner.lock().all();
        let mut reference: Option<Vec<i64>> = None;
        for member in &members {
            let ids = self.engine.store().working_set_ids(member.robot().id)?;
            match &reference {
                None => reference = Some(ids),
                Some(expected) if *expected != ids => return Ok(false),
                _ => {}
            }
        }
        Ok(true)
    }

    /// Membership, capacity, and sync snapshot.
    pub fn status(&self) -> EngineResult<GroupStatus> {
        let union = self.union_ids()?;
        let ids: Vec<i64> = union.iter().copied().collect();
        let nodes = self.engine.store().get_nodes(&ids)?;
        let token_count: usize = nodes.values().map(|n| n.token_count).sum();

        Ok(GroupStatus {
            name: self.name.clone(),
            active: self.active_names(),
            passive: self.passive_names(),
            node_count: union.len(),
            token_count,
            max_tokens: self.max_tokens,
            utilization: (token_count as f64 / self.max_tokens as f64).clamp(0.0, 1.0),
            in_sync: self.in_sync()?,
        })
    }
}
