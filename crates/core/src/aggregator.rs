//! Shared per-bed state and the sequence counter.
//!
//! Inbound handlers run one thread per connection and all funnel through
//! [`Aggregator::apply`]. Merge, snapshot and persist happen inside a single
//! critical section, so a persisted snapshot never reflects a half-merged
//! update and sequence ids hit the disk in order.

use crate::error::Result;
use crate::snapshot::{now_ms, BedRecord, Snapshot, Source};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug)]
struct State {
    beds: BTreeMap<String, BedRecord>,
    sequence: i64,
}

/// Mutex-guarded bed map producing immutable [`Snapshot`]s.
#[derive(Debug)]
pub struct Aggregator {
    source: Source,
    state: Mutex<State>,
}

impl Aggregator {
    /// Start empty, continuing the sequence after `last_sequence`.
    pub fn new(source: Source, last_sequence: i64) -> Self {
        Self {
            source,
            state: Mutex::new(State {
                beds: BTreeMap::new(),
                sequence: last_sequence,
            }),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Last sequence id handed out.
    pub fn sequence(&self) -> i64 {
        self.lock().sequence
    }

    /// Merge `update` into `bed`, take a snapshot and hand it to `persist`,
    /// all while holding the lock.
    ///
    /// If `persist` fails, the merge and the sequence bump stand (the next
    /// successful persist carries them) and the error is returned so the
    /// caller can skip this cycle.
    pub fn apply<F>(&self, bed: &str, update: BedRecord, persist: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()>,
    {
        let mut state = self.lock();
        state.beds.entry(bed.to_string()).or_default().merge(update);
        let snapshot = self.next_snapshot(&mut state);
        debug!(bed, sequence = snapshot.sequence_id, "merged bed update");
        persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Replace every bed at once (generator cycle) and persist.
    pub fn replace_all<F>(&self, beds: BTreeMap<String, BedRecord>, persist: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()>,
    {
        let mut state = self.lock();
        state.beds = beds;
        let snapshot = self.next_snapshot(&mut state);
        persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Snapshot and persist without any new data.
    pub fn tick<F>(&self, persist: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()>,
    {
        let mut state = self.lock();
        let snapshot = self.next_snapshot(&mut state);
        persist(&snapshot)?;
        Ok(snapshot)
    }

    fn next_snapshot(&self, state: &mut State) -> Snapshot {
        state.sequence += 1;
        let mut snapshot = Snapshot::new(now_ms(), state.sequence, self.source);
        for (bed, record) in &state.beds {
            snapshot.insert_bed(bed.clone(), record.clone());
        }
        snapshot
    }

    /// A handler that panicked mid-update can't leave the map half-merged
    /// (merge is a single `extend`), so the poisoned state is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("aggregator mutex poisoned; recovering state");
            poisoned.into_inner()
        })
    }
}
