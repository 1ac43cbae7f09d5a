//! Lock-step coordination of the build phase.

use tessera_common::Result;
use tessera_exchange::{Collective, CollectiveExt};

/// Global "is last" detection, synchronized every `sync_iter` build calls.
///
/// All workers call [`IsLastSync::step`] once per build call; since the host
/// keeps calling until the global flag is returned, every rank reaches the
/// same sync iterations.
#[derive(Debug, Clone)]
pub struct IsLastSync {
    sync_iter: usize,
    iter: usize,
    global_last: bool,
}

impl IsLastSync {
    pub fn new(sync_iter: usize) -> Self {
        Self {
            sync_iter: sync_iter.max(1),
            iter: 0,
            global_last: false,
        }
    }

    pub fn iterations(&self) -> usize {
        self.iter
    }

    pub fn is_global_last(&self) -> bool {
        self.global_last
    }

    /// `Some(global_last)` on a sync iteration, `None` otherwise.
    pub fn step(&mut self, collective: &dyn Collective, local_last: bool) -> Result<Option<bool>> {
        self.iter += 1;
        if self.global_last {
            return Ok(Some(true));
        }
        if collective.size() == 1 {
            self.global_last = local_last;
            return Ok(Some(local_last));
        }
        if self.iter % self.sync_iter != 0 {
            return Ok(None);
        }
        self.global_last = collective.all_and(local_last)?;
        Ok(Some(self.global_last))
    }
}

/// Collective exchange decision: shuffle when any worker's shuffle buffer is
/// over the threshold, or unconditionally once global completion is known.
pub fn should_shuffle(
    collective: &dyn Collective,
    over_threshold: bool,
    global_last: bool,
) -> Result<bool> {
    if global_last {
        return Ok(true);
    }
    collective.any_or(over_threshold)
}
