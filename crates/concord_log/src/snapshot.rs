//! State checkpoints for partial replay.

use std::sync::Arc;

/// Identity of a captured snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub(crate) u64);

/// A captured `(state, event_index)` checkpoint.
///
/// The state equals the fold of the reducer over the first `event_index`
/// log entries at capture time. The checkpoint is valid only while that
/// prefix is unchanged; insertion or removal before `event_index`
/// invalidates it.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot<S> {
    pub id: SnapshotId,
    pub state: Arc<S>,
    pub event_index: usize,
}
