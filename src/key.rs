use crate::types::UnitId;
use core::cmp::Ordering;

/// Sort record that orders the dispatch sequence.
///
/// Lexicographic: more depended-on units sort earlier, longer-running
/// units break the tie, and the handle makes the order total and stable.
/// The dependent count is transitive (the number of units whose
/// predecessor closure contains this unit), which approximates
/// critical-path priority better than the immediate count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitKey {
    /// Number of units whose predecessor closure contains this unit.
    pub dependents: u32,
    /// Rolling-average runtime of the unit's body, in microseconds.
    pub perf_us: u64,
    /// Handle of the unit this key describes.
    pub id: UnitId,
}

impl Ord for UnitKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dependents
            .cmp(&self.dependents)
            .then_with(|| other.perf_us.cmp(&self.perf_us))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for UnitKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
