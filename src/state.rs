use serde::{Deserialize, Serialize};

/// Progress marker of a run through the region list, persisted inside
/// checkpoint metadata
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// index of the active region
    pub region_index: usize,
    /// index of the active target within the region, never decreases inside it
    pub target_index: usize,
    /// how many times the active target's location has been reached so far
    pub hits: u64,
    /// last fired location, what relative targets resolve against
    pub anchor: Option<u64>,
    /// set once a warmup region completed
    pub warmed_up: bool,
    /// simulated instructions at the last event, monotonic
    pub instructions: u64,
}

impl RunState {
    /// Move to the next target of the same region
    pub fn next_target(&mut self) {
        self.target_index += 1;
        self.hits = 0;
    }

    /// Cross a region boundary
    pub fn next_region(&mut self) {
        self.region_index += 1;
        self.target_index = 0;
        self.hits = 0;
    }

    pub fn record_instructions(&mut self, instructions: u64) {
        self.instructions = self.instructions.max(instructions);
    }
}
