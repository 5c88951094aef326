use crate::NUM_RECS;

/// Marks an unused history slot; it is also what an erased header slot reads as.
pub const NO_SESSION: u32 = u32::MAX;

/// Start sectors of the most recent recording sessions, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionTracker {
    starts: [u32; NUM_RECS],
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub const fn new() -> Self {
        Self {
            starts: [NO_SESSION; NUM_RECS],
        }
    }

    /// Restores the history embedded in the last written sector header. That history already
    /// contains the session which was live when the header was written, so the interrupted
    /// session is closed and the oldest entry dropped by taking it as is.
    pub fn from_header(sessions: [u32; NUM_RECS]) -> Self {
        Self { starts: sessions }
    }

    /// Closes a session: drops the oldest start and appends `start`.
    pub fn push(&mut self, start: u32) {
        self.starts = self.with_pending(start);
    }

    /// The history as it will look once the session starting at `start` is closed. This is
    /// what gets written into sector headers while that session is recording.
    pub fn with_pending(&self, start: u32) -> [u32; NUM_RECS] {
        let mut shifted = self.starts;
        shifted.copy_within(1.., 0);
        shifted[NUM_RECS - 1] = start;
        shifted
    }

    pub fn starts(&self) -> &[u32; NUM_RECS] {
        &self.starts
    }

    /// Recorded sessions, oldest first, skipping empty slots.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.starts.iter().copied().filter(|&s| s != NO_SESSION)
    }

    pub fn latest(&self) -> Option<u32> {
        self.iter().last()
    }
}
