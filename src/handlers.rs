//! Exit-event handlers: what to do each time the machine hands back control
use crate::{
    CheckpointMetadata, CheckpointStore, Decision, Error, ExitEvent, Machine, RegionKind,
    RegionTracker, Result, SimPoint, StatsController,
};
use log::{debug, info};
use std::{path::PathBuf, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// continue simulating
    Resume,
    /// end the run
    Stop,
}

/// Everything a handler may touch while the machine is suspended
pub struct SimContext<'a> {
    pub machine: &'a mut dyn Machine,
    pub tracker: &'a mut RegionTracker,
    pub stats: &'a mut StatsController,
    pub store: &'a CheckpointStore,
    /// the event being handled
    pub event: ExitEvent,
}

impl SimContext<'_> {
    /// Save the machine as it stands, positioned at the tracker's state
    pub fn save_checkpoint(&mut self, name: &str) -> Result<PathBuf> {
        let metadata = CheckpointMetadata::capture(&*self.machine, self.tracker);
        self.save_with(name, &metadata)
    }

    pub fn save_with(&mut self, name: &str, metadata: &CheckpointMetadata) -> Result<PathBuf> {
        self.store
            .save(name, &self.machine.machine_state(), metadata)
    }
}

/// A resumable decision source: one call per event, one decision per call.
///
/// `Ok(None)` means the handler has nothing left to say, which ends the run.
pub trait EventHandler {
    /// Called once before the machine starts
    fn on_start(&mut self, _cx: &mut SimContext<'_>) -> Result<()> {
        Ok(())
    }

    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>>;
}

/// Ends the run on the first event
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminate;

impl EventHandler for Terminate {
    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        debug!("Terminating on {}", cx.event);
        Ok(Some(Action::Stop))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Reset,
    Dump,
    Checkpoint,
    Resume,
    Stop,
}

impl FromStr for Step {
    type Err = String;

    fn from_str(word: &str) -> std::result::Result<Self, Self::Err> {
        match word {
            "reset" => Ok(Step::Reset),
            "dump" => Ok(Step::Dump),
            "checkpoint" => Ok(Step::Checkpoint),
            "resume" => Ok(Step::Resume),
            "stop" => Ok(Step::Stop),
            _ => Err(format!("unknown decision {word:?}")),
        }
    }
}

/// Plays back a list of decision words, e.g. `reset resume dump stop`.
///
/// `reset`, `dump` and `checkpoint` run immediately; `resume` or `stop` end
/// the handling of the current event. Words are read lazily, so a bad word
/// only fails once an event reaches it.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    words: Vec<String>,
    cursor: usize,
    checkpoints: usize,
}

impl ScriptedHandler {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
            cursor: 0,
            checkpoints: 0,
        }
    }

    /// Split a whitespace separated script
    pub fn parse(script: &str) -> Self {
        Self::new(script.split_whitespace())
    }
}

impl EventHandler for ScriptedHandler {
    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        while let Some(word) = self.words.get(self.cursor) {
            let step: Step = word.parse().map_err(|message| {
                Error::EventProtocol(format!(
                    "{} at word {} while handling {}",
                    message, self.cursor, cx.event
                ))
            })?;
            self.cursor += 1;
            match step {
                Step::Reset => cx.stats.reset(cx.machine),
                Step::Dump => {
                    cx.stats.dump(cx.machine, &cx.event.to_string())?;
                }
                Step::Checkpoint => {
                    let name = format!("checkpoint-{}", self.checkpoints);
                    self.checkpoints += 1;
                    cx.save_checkpoint(&name)?;
                }
                Step::Resume => return Ok(Some(Action::Resume)),
                Step::Stop => return Ok(Some(Action::Stop)),
            }
        }
        Ok(None)
    }
}

/// Checkpoint at every event and keep going
#[derive(Debug, Clone, Default)]
pub struct SaveCheckpoints {
    saved: Vec<PathBuf>,
}

impl SaveCheckpoints {
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

impl EventHandler for SaveCheckpoints {
    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        let instructions = cx.machine.current_location().instructions;
        let path = cx.save_checkpoint(&format!("cpt.{}", instructions))?;
        self.saved.push(path);
        Ok(Some(Action::Resume))
    }
}

/// Takes one checkpoint per catalog region as its markers are reached.
///
/// A checkpoint named `region-<id>-checkpoint` resumes at the start of that
/// region, ready to be restored against a catalog describing the region.
#[derive(Debug, Clone, Default)]
pub struct RegionCheckpoints;

impl EventHandler for RegionCheckpoints {
    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        let position = cx.machine.current_location();
        match cx.tracker.advance(position.pc)? {
            Decision::Continue | Decision::WarmupEnded => Ok(Some(Action::Resume)),
            Decision::RegionEnded => {
                let Some(id) = cx.tracker.previous_region().map(|region| region.id.clone())
                else {
                    return Err(Error::EventProtocol(
                        "region ended without a region behind the tracker".to_string(),
                    ));
                };
                let metadata =
                    CheckpointMetadata::capture(&*cx.machine, cx.tracker).starting_region(&id);
                let path = cx.save_with(&format!("region-{}-checkpoint", id), &metadata)?;
                println!(
                    "Region {} checkpoint at 0x{:x} after {} instructions: {}",
                    id,
                    position.pc,
                    position.instructions,
                    path.display()
                );
                if cx.tracker.is_finished() && cx.tracker.options().exit_when_empty {
                    Ok(Some(Action::Stop))
                } else {
                    Ok(Some(Action::Resume))
                }
            }
            Decision::AllRegionsExhausted => Ok(Some(Action::Stop)),
        }
    }
}

/// Measures regions after a restore: the warmup interval is dumped and the
/// statistics reset when warmup ends, the detail interval dumped when the
/// region ends
#[derive(Debug, Clone, Default)]
pub struct ResetAndDump;

impl EventHandler for ResetAndDump {
    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        let pc = cx.machine.current_location().pc;
        let decision = cx.tracker.advance(pc)?;
        let label = cx
            .tracker
            .previous_region()
            .map(|region| match region.kind {
                RegionKind::Warmup => format!("region {} warmup", region.id),
                RegionKind::Detail => format!("region {}", region.id),
            })
            .unwrap_or_default();
        match decision {
            Decision::Continue => Ok(Some(Action::Resume)),
            Decision::WarmupEnded => {
                println!("Warmup region ended. Resetting stats.");
                cx.stats.boundary(cx.machine, &label)?;
                Ok(Some(Action::Resume))
            }
            Decision::RegionEnded => {
                println!("Region ended. Dumping stats.");
                cx.stats.dump(cx.machine, &label)?;
                if cx.tracker.is_finished() && cx.tracker.options().exit_when_empty {
                    Ok(Some(Action::Stop))
                } else {
                    Ok(Some(Action::Resume))
                }
            }
            Decision::AllRegionsExhausted => Ok(Some(Action::Stop)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarmupPhase {
    Warmup,
    Detail,
    Done,
}

/// Measures one simpoint after restoring its checkpoint: warmup, then one
/// interval of detail. Lengths count instructions on all cores, as the
/// schedule does.
#[derive(Debug, Clone)]
pub struct SimPointWarmup {
    warmup: u64,
    interval: u64,
    phase: WarmupPhase,
}

impl SimPointWarmup {
    pub fn new(simpoint: &SimPoint, interval: u64) -> Self {
        Self {
            warmup: simpoint.warmup,
            interval,
            phase: WarmupPhase::Warmup,
        }
    }
}

impl EventHandler for SimPointWarmup {
    fn on_start(&mut self, cx: &mut SimContext<'_>) -> Result<()> {
        if self.warmup > 0 {
            cx.machine.schedule_total_instruction_limit(self.warmup);
            self.phase = WarmupPhase::Warmup;
        } else {
            cx.machine.schedule_total_instruction_limit(self.interval);
            self.phase = WarmupPhase::Detail;
        }
        Ok(())
    }

    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        match self.phase {
            WarmupPhase::Warmup => {
                info!("Warmup of {} instructions done", self.warmup);
                cx.stats.boundary(cx.machine, "simpoint warmup")?;
                cx.machine.schedule_total_instruction_limit(self.interval);
                self.phase = WarmupPhase::Detail;
                Ok(Some(Action::Resume))
            }
            WarmupPhase::Detail => {
                info!("Simpoint interval of {} instructions done", self.interval);
                cx.stats.dump(cx.machine, "simpoint")?;
                self.phase = WarmupPhase::Done;
                Ok(Some(Action::Stop))
            }
            WarmupPhase::Done => Ok(None),
        }
    }
}

/// Takes `simpoint-<i>` at each simpoint's checkpoint point, stopping after
/// the last one
#[derive(Debug, Clone)]
pub struct SimPointCheckpoints {
    /// (simpoint position, instruction count) sorted by instruction count
    points: Vec<(usize, u64)>,
    next: usize,
}

impl SimPointCheckpoints {
    pub fn new(simpoints: &[SimPoint]) -> Self {
        let mut points: Vec<(usize, u64)> = simpoints
            .iter()
            .enumerate()
            .map(|(i, simpoint)| (i, simpoint.checkpoint_point()))
            .collect();
        points.sort_by_key(|(_, point)| *point);
        Self { points, next: 0 }
    }

    fn is_done(&self) -> bool {
        self.next >= self.points.len()
    }

    /// Save every checkpoint due at the current position, then schedule the
    /// next one
    fn catch_up(&mut self, cx: &mut SimContext<'_>) -> Result<()> {
        let instructions = cx.machine.current_location().instructions;
        while let Some(&(index, point)) = self.points.get(self.next) {
            if point > instructions {
                cx.machine
                    .schedule_total_instruction_limit(point - instructions);
                break;
            }
            let path = cx.save_checkpoint(&format!("simpoint-{}", index))?;
            println!(
                "SimPoint {} checkpoint after {} instructions: {}",
                index,
                instructions,
                path.display()
            );
            self.next += 1;
        }
        Ok(())
    }
}

impl EventHandler for SimPointCheckpoints {
    fn on_start(&mut self, cx: &mut SimContext<'_>) -> Result<()> {
        self.catch_up(cx)
    }

    fn next(&mut self, cx: &mut SimContext<'_>) -> Result<Option<Action>> {
        if self.is_done() {
            return Ok(None);
        }
        self.catch_up(cx)?;
        if self.is_done() {
            Ok(Some(Action::Stop))
        } else {
            Ok(Some(Action::Resume))
        }
    }
}
