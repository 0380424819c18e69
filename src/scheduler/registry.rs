use crate::{
    buffer::{DoubleBuffered, ParityFlip},
    key::UnitKey,
    rolling::RollingAverage,
    sync::{AtomicU64, Ordering},
    types::{IndexMap, SyncUnsafeCell, UnitId},
    unit::{StateWord, UnitKind, UnitState, WorkUnit},
};
use core::num::NonZeroU32;
use derive_more::Debug;
use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;

/// Error returned when the client-visible graph is structurally invalid.
///
/// Structural errors are surfaced at the offending call and never
/// recovered internally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The dependency graph contains cycle(s); no valid execution order
    /// exists.
    #[error("dependency graph contains cycle(s)")]
    Cycle,
    /// A handle passed to a graph operation is not registered.
    #[error("work unit {0:?} is not registered")]
    UnknownUnit(UnitId),
    /// A unit was asked to depend on itself.
    #[error("work unit {0:?} cannot depend on itself")]
    SelfDependency(UnitId),
}

/// One entry of a sorted dispatch sequence.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchEntry {
    pub(crate) key: UnitKey,
    pub(crate) idx: u16,
}

/// Sorted dispatch sequences, either freshly derived or staged by the
/// sorter work unit for adoption at the next frame start.
#[derive(Debug)]
pub(crate) struct StagedOrders {
    pub(crate) main: Vec<DispatchEntry>,
    pub(crate) rest: Vec<DispatchEntry>,
}

/// The part of a unit only its per-frame owner thread touches: the body
/// itself and the runtime history folded in after each run.
#[derive(Debug)]
pub(crate) struct UnitBody {
    pub(crate) unit: Box<dyn WorkUnit>,
    pub(crate) history: RollingAverage,
}

/// One registered work unit.
///
/// Only forward edges are stored on the node; the reverse (dependent)
/// projection is derived into the cache, keeping the node small and
/// edge insertion O(1).
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) id: UnitId,
    pub(crate) kind: UnitKind,
    pub(crate) state: StateWord,
    /// Rolling-average runtime in microseconds, readable mid-frame by
    /// the sorter unit.
    pub(crate) avg_us: AtomicU64,
    pub(crate) deps: Vec<UnitId>,
    pub(crate) body: SyncUnsafeCell<UnitBody>,
}

/// Work-unit registry plus the derived dependency cache.
///
/// Read-only for the duration of a frame; every mutating operation runs
/// between frames and marks the cache dirty where derived structures are
/// affected.
#[derive(Debug)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    /// Handle to dense index; iteration order is registration order,
    /// which defines the monopoly phase order.
    index: IndexMap<UnitId, u16>,
    next_id: u32,
    history_length: usize,
    /// Predecessor slot indices per slot; rebuilt with the cache.
    preds: Vec<Vec<u16>>,
    /// Transitive dependent count per slot; rebuilt with the cache.
    dependents: Vec<u32>,
    order_main: Vec<DispatchEntry>,
    order_rest: Vec<DispatchEntry>,
    dirty: bool,
    thread_logs: Vec<DoubleBuffered<String>>,
    #[debug(skip)]
    resources: Vec<Arc<dyn ParityFlip>>,
}

impl Registry {
    pub(crate) fn new(history_length: usize) -> Self {
        Self {
            slots: Vec::new(),
            index: IndexMap::default(),
            next_id: 1,
            history_length,
            preds: Vec::new(),
            dependents: Vec::new(),
            order_main: Vec::new(),
            order_rest: Vec::new(),
            dirty: false,
            thread_logs: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, unit: Box<dyn WorkUnit>, kind: UnitKind) -> UnitId {
        let idx = u16::try_from(self.slots.len()).expect("Registry::insert: [1]");
        let id = NonZeroU32::new(self.next_id).expect("Registry::insert: [2]");
        self.next_id = self.next_id.checked_add(1).expect("Registry::insert: [3]");
        self.slots.push(Slot {
            id,
            kind,
            state: StateWord::new(),
            avg_us: AtomicU64::new(0),
            deps: Vec::new(),
            body: SyncUnsafeCell::new(UnitBody {
                unit,
                history: RollingAverage::new(self.history_length),
            }),
        });
        let previous = self.index.insert(id, idx);
        assert!(previous.is_none(), "Registry::insert: [4]");
        self.dirty = true;
        id
    }

    pub(crate) fn add_dependency(
        &mut self,
        dependent: UnitId,
        predecessor: UnitId,
    ) -> Result<(), GraphError> {
        if dependent == predecessor {
            return Err(GraphError::SelfDependency(dependent));
        }
        if !self.index.contains_key(&predecessor) {
            return Err(GraphError::UnknownUnit(predecessor));
        }
        let &idx = self
            .index
            .get(&dependent)
            .ok_or(GraphError::UnknownUnit(dependent))?;
        let deps = &mut self.slots[idx as usize].deps;
        if !deps.contains(&predecessor) {
            deps.push(predecessor);
            self.dirty = true;
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: UnitId) -> Result<Box<dyn WorkUnit>, GraphError> {
        let idx = self
            .index
            .shift_remove(&id)
            .ok_or(GraphError::UnknownUnit(id))?;
        let slot = self.slots.swap_remove(idx as usize);
        if (idx as usize) < self.slots.len() {
            let moved_id = self.slots[idx as usize].id;
            let entry = self.index.get_mut(&moved_id).expect("Registry::remove: [1]");
            *entry = idx;
        }
        for survivor in &mut self.slots {
            survivor.deps.retain(|&dep| dep != id);
        }
        self.dirty = true;
        Ok(slot.body.into_inner().unit)
    }

    /// Rebuild every derived structure: dense predecessor indices, the
    /// reverse-edge projection, transitive dependent counts, and the
    /// sorted dispatch sequences. Consuming the whole registry in the
    /// Kahn pass doubles as the cycle check.
    pub(crate) fn rebuild(&mut self) -> Result<(), GraphError> {
        let len = self.slots.len();

        let mut preds = Vec::with_capacity(len);
        for slot in &self.slots {
            let mut indices = Vec::with_capacity(slot.deps.len());
            for dep in &slot.deps {
                let &idx = self.index.get(dep).ok_or(GraphError::UnknownUnit(*dep))?;
                indices.push(idx);
            }
            preds.push(indices);
        }

        let mut children: Vec<Vec<u16>> = vec![Vec::new(); len];
        for (idx, indices) in preds.iter().enumerate() {
            let idx = u16::try_from(idx).expect("Registry::rebuild: [1]");
            for &pred in indices {
                children[pred as usize].push(idx);
            }
        }

        let mut indegree: Vec<usize> = preds.iter().map(Vec::len).collect();
        let mut queue: VecDeque<u16> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(idx, _)| u16::try_from(idx).expect("Registry::rebuild: [2]"))
            .collect();
        let mut processed = 0usize;
        while let Some(idx) = queue.pop_front() {
            processed += 1;
            for &child in &children[idx as usize] {
                let degree = &mut indegree[child as usize];
                *degree = degree.checked_sub(1).expect("Registry::rebuild: [3]");
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
        if processed != len {
            return Err(GraphError::Cycle);
        }

        // Transitive dependent counts: units reachable over reverse edges.
        let mut dependents = vec![0u32; len];
        let mut visited = vec![false; len];
        let mut stack = Vec::new();
        for (idx, count) in dependents.iter_mut().enumerate() {
            visited.iter_mut().for_each(|seen| *seen = false);
            stack.push(u16::try_from(idx).expect("Registry::rebuild: [4]"));
            while let Some(node) = stack.pop() {
                for &child in &children[node as usize] {
                    if !visited[child as usize] {
                        visited[child as usize] = true;
                        *count += 1;
                        stack.push(child);
                    }
                }
            }
        }

        self.preds = preds;
        self.dependents = dependents;
        let orders = self.build_orders();
        self.order_main = orders.main;
        self.order_rest = orders.rest;
        self.dirty = false;
        Ok(())
    }

    /// Derive freshly sorted dispatch sequences from the cached
    /// dependent counts and the current runtime averages.
    pub(crate) fn build_orders(&self) -> StagedOrders {
        let mut main = Vec::new();
        let mut rest = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            let entry = DispatchEntry {
                key: UnitKey {
                    dependents: self.dependents.get(idx).copied().unwrap_or(0),
                    perf_us: slot.avg_us.load(Ordering::Relaxed),
                    id: slot.id,
                },
                idx: u16::try_from(idx).expect("Registry::build_orders: [1]"),
            };
            match slot.kind {
                UnitKind::MainAffinity => main.push(entry),
                UnitKind::Normal | UnitKind::Async => rest.push(entry),
                UnitKind::Monopoly => {}
            }
        }
        main.sort_unstable_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
        rest.sort_unstable_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
        StagedOrders { main, rest }
    }

    /// Re-sort the dispatch sequences in place without touching the
    /// dependency cache.
    pub(crate) fn resort(&mut self) {
        let orders = self.build_orders();
        self.apply_staged(orders);
    }

    pub(crate) fn apply_staged(&mut self, orders: StagedOrders) {
        debug_assert!(
            orders.main.len() + orders.rest.len()
                <= self.slots.len(),
            "Registry::apply_staged: stale orders"
        );
        self.order_main = orders.main;
        self.order_rest = orders.rest;
    }

    /// Per-frame bookkeeping run by the main thread before any unit:
    /// rewind every state word, optionally warm the dispatch entries'
    /// cache lines, and flip every double-buffered facility.
    pub(crate) fn reset_frame(&mut self, skip_warm: bool) {
        for slot in &self.slots {
            slot.state.reset();
        }
        if !skip_warm {
            for entry in self.order_main.iter().chain(&self.order_rest) {
                std::hint::black_box(self.slots[entry.idx as usize].state.load());
            }
        }
        for log in &mut self.thread_logs {
            log.flip();
            log.current_mut().clear();
        }
        for resource in &self.resources {
            resource.flip_parity();
        }
    }

    pub(crate) fn ensure_thread_logs(&mut self, thread_count: usize) {
        if self.thread_logs.len() != thread_count {
            self.thread_logs
                .resize_with(thread_count, DoubleBuffered::default);
        }
    }

    pub(crate) fn reset_histories(&mut self, history_length: usize) {
        self.history_length = history_length;
        for slot in &mut self.slots {
            slot.body.get_mut().history = RollingAverage::new(history_length);
        }
    }

    pub(crate) fn add_resource(&mut self, resource: Arc<dyn ParityFlip>) {
        self.resources.push(resource);
    }

    pub(crate) fn slot(&self, idx: u16) -> &Slot {
        &self.slots[idx as usize]
    }

    pub(crate) fn preds(&self, idx: u16) -> &[u16] {
        &self.preds[idx as usize]
    }

    pub(crate) fn order_main(&self) -> &[DispatchEntry] {
        &self.order_main
    }

    pub(crate) fn order_rest(&self) -> &[DispatchEntry] {
        &self.order_rest
    }

    pub(crate) fn monopoly_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.index
            .values()
            .copied()
            .filter(|&idx| self.slots[idx as usize].kind == UnitKind::Monopoly)
    }

    pub(crate) fn thread_log(&self, thread_index: usize) -> &DoubleBuffered<String> {
        &self.thread_logs[thread_index]
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.thread_logs.len()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn failed_units(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load() == UnitState::Failed)
            .count()
    }

    /// The full dispatch sequence, affinity entries first, as
    /// `(handle, key)` pairs.
    pub(crate) fn dispatch_sequence(&self) -> Vec<(UnitId, UnitKey)> {
        self.order_main
            .iter()
            .chain(&self.order_rest)
            .map(|entry| (entry.key.id, entry.key))
            .collect()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{scheduler::FrameContext, unit::UnitError};

    #[derive(std::fmt::Debug)]
    struct Noop;

    impl WorkUnit for Noop {
        fn run(&mut self, _ctx: &FrameContext<'_>) -> Result<(), UnitError> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        Registry::new(4)
    }

    #[test]
    fn transitive_dependent_counts_in_a_diamond() {
        let mut registry = registry();
        let a = registry.insert(Box::new(Noop), UnitKind::Normal);
        let b = registry.insert(Box::new(Noop), UnitKind::Normal);
        let c = registry.insert(Box::new(Noop), UnitKind::Normal);
        let d = registry.insert(Box::new(Noop), UnitKind::Normal);
        registry.add_dependency(b, a).unwrap();
        registry.add_dependency(c, a).unwrap();
        registry.add_dependency(d, b).unwrap();
        registry.add_dependency(d, c).unwrap();
        registry.rebuild().unwrap();

        let sequence = registry.dispatch_sequence();
        assert_eq!(sequence[0].0, a);
        // D is reachable through both arms but counted once.
        assert_eq!(sequence[0].1.dependents, 3);
        let keys: Vec<(UnitId, u32)> = sequence
            .iter()
            .map(|&(id, key)| (id, key.dependents))
            .collect();
        assert!(keys.contains(&(b, 1)));
        assert!(keys.contains(&(c, 1)));
        assert!(keys.contains(&(d, 0)));
    }

    #[test]
    fn cycles_fail_the_rebuild() {
        let mut registry = registry();
        let a = registry.insert(Box::new(Noop), UnitKind::Normal);
        let b = registry.insert(Box::new(Noop), UnitKind::Normal);
        registry.add_dependency(b, a).unwrap();
        registry.add_dependency(a, b).unwrap();
        assert_eq!(registry.rebuild(), Err(GraphError::Cycle));
        assert!(registry.is_dirty());
    }

    #[test]
    fn structural_errors_name_the_offender() {
        let mut registry = registry();
        let a = registry.insert(Box::new(Noop), UnitKind::Normal);
        assert_eq!(
            registry.add_dependency(a, a),
            Err(GraphError::SelfDependency(a))
        );
        let ghost = UnitId::new(99).unwrap();
        assert_eq!(
            registry.add_dependency(a, ghost),
            Err(GraphError::UnknownUnit(ghost))
        );
        assert!(matches!(
            registry.remove(ghost),
            Err(GraphError::UnknownUnit(id)) if id == ghost
        ));
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut registry = registry();
        let a = registry.insert(Box::new(Noop), UnitKind::Normal);
        let b = registry.insert(Box::new(Noop), UnitKind::Normal);
        registry.add_dependency(b, a).unwrap();
        registry.add_dependency(b, a).unwrap();
        registry.rebuild().unwrap();
        let b_idx = registry.index[&b];
        assert_eq!(registry.preds(b_idx).len(), 1);
    }

    #[test]
    fn removal_reindexes_the_moved_slot() {
        let mut registry = registry();
        let a = registry.insert(Box::new(Noop), UnitKind::Normal);
        let b = registry.insert(Box::new(Noop), UnitKind::Normal);
        let c = registry.insert(Box::new(Noop), UnitKind::Normal);
        registry.add_dependency(c, a).unwrap();
        registry.remove(a).unwrap();
        registry.rebuild().unwrap();

        let sequence = registry.dispatch_sequence();
        let ids: Vec<UnitId> = sequence.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&b));
        assert!(ids.contains(&c));
        // C's edge to the removed unit is gone.
        let c_idx = registry.index[&c];
        assert!(registry.preds(c_idx).is_empty());
    }

    #[test]
    fn monopolies_keep_registration_order_and_leave_the_lanes() {
        let mut registry = registry();
        let first = registry.insert(Box::new(Noop), UnitKind::Monopoly);
        let normal = registry.insert(Box::new(Noop), UnitKind::Normal);
        let second = registry.insert(Box::new(Noop), UnitKind::Monopoly);
        registry.rebuild().unwrap();

        let monopolies: Vec<UnitId> = registry
            .monopoly_indices()
            .map(|idx| registry.slot(idx).id)
            .collect();
        assert_eq!(monopolies, vec![first, second]);
        let lanes = registry.dispatch_sequence();
        assert_eq!(lanes.len(), 1);
        assert_eq!(lanes[0].0, normal);
    }
}
