use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Why the machine handed control back
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub enum ExitEvent {
    /// the workload exited
    Exit,
    /// a scheduled instruction limit elapsed
    MaxInstructions,
    /// a watched location was reached
    RegionBegin,
    /// the workload asked for a checkpoint
    Checkpoint,
    /// work-begin marker in the workload
    WorkBegin,
    /// work-end marker in the workload
    WorkEnd,
    /// the machine model failed
    Fail,
}

impl fmt::Display for ExitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitEvent::Exit => "exit",
            ExitEvent::MaxInstructions => "max-instructions",
            ExitEvent::RegionBegin => "region-begin",
            ExitEvent::Checkpoint => "checkpoint",
            ExitEvent::WorkBegin => "work-begin",
            ExitEvent::WorkEnd => "work-end",
            ExitEvent::Fail => "fail",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    pub core: usize,
    pub pc: u64,
    /// instructions simulated so far, all cores
    pub instructions: u64,
}

pub type StatCounters = BTreeMap<String, u64>;

/// The simulated machine as seen by the execution-control engine.
///
/// Everything behind this trait (processor and memory models, cache hierarchy,
/// workload loading) is out of scope here; the engine only starts and resumes
/// it, watches where it is, and moves its state in and out of checkpoints.
pub trait Machine {
    /// Hand control to the machine until the next event
    fn start(&mut self) -> ExitEvent;

    /// Continue after an event
    fn resume(&mut self) -> ExitEvent;

    fn current_location(&self) -> Position;

    /// Raise `MaxInstructions` once `count` more instructions ran on `core`
    fn schedule_instruction_limit(&mut self, core: usize, count: u64);

    /// Raise `MaxInstructions` once `count` more instructions ran on all
    /// cores together, the count `Position::instructions` reports
    fn schedule_total_instruction_limit(&mut self, count: u64);

    /// Locations that raise `RegionBegin` when reached, replacing earlier ones
    fn watch_pcs(&mut self, pcs: &[u64]);

    /// Opaque snapshot of the architectural state
    fn machine_state(&self) -> Vec<u8>;

    /// Must leave the machine untouched when it fails
    fn load_machine_state(&mut self, state: &[u8]) -> std::io::Result<()>;

    fn stats(&self) -> StatCounters;

    /// Zero all statistics counters, nothing else
    fn reset_stats(&mut self);

    /// Memory size in bytes
    fn memory_size(&self) -> u64;

    fn core_count(&self) -> usize;
}
