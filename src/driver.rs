use crate::{
    Action, CheckpointMetadata, CheckpointStore, EventHandler, ExitEvent, Machine, RegionTracker,
    Result, SimContext, StatsController, Terminate,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    SuspendedAtEvent(ExitEvent),
    Restoring,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// event that ended the run
    pub last_event: ExitEvent,
    pub events: usize,
    pub instructions: u64,
    pub regions_completed: usize,
}

/// Runs the machine, handing every exit event to the handler registered for
/// it, until a handler stops or the tracker runs out of regions
pub struct RunDriver<M: Machine> {
    machine: M,
    tracker: RegionTracker,
    stats: StatsController,
    store: CheckpointStore,
    handlers: HashMap<ExitEvent, Box<dyn EventHandler>>,
    default_handler: Terminate,
    state: DriverState,
    restore_from: Option<PathBuf>,
    restored: Option<CheckpointMetadata>,
    max_instructions: Option<u64>,
}

impl<M: Machine> RunDriver<M> {
    pub fn new(machine: M, tracker: RegionTracker, store: CheckpointStore) -> Self {
        Self {
            machine,
            tracker,
            stats: StatsController::new(),
            store,
            handlers: HashMap::new(),
            default_handler: Terminate,
            state: DriverState::Running,
            restore_from: None,
            restored: None,
            max_instructions: None,
        }
    }

    pub fn with_stats(mut self, stats: StatsController) -> Self {
        self.stats = stats;
        self
    }

    /// Handle `event` with `handler`; events without one terminate the run
    pub fn on(mut self, event: ExitEvent, handler: impl EventHandler + 'static) -> Self {
        self.handlers.insert(event, Box::new(handler));
        self
    }

    /// Load this checkpoint (relative to the store root) before starting
    pub fn restore_from<P: Into<PathBuf>>(mut self, name: P) -> Self {
        self.restore_from = Some(name.into());
        self
    }

    /// Raise `MaxInstructions` after this many instructions on core 0
    pub fn max_instructions(mut self, count: Option<u64>) -> Self {
        self.max_instructions = count;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn tracker(&self) -> &RegionTracker {
        &self.tracker
    }

    pub fn stats(&self) -> &StatsController {
        &self.stats
    }

    /// Metadata of the checkpoint the run started from
    pub fn restored(&self) -> Option<&CheckpointMetadata> {
        self.restored.as_ref()
    }

    fn refresh_watch(&mut self) -> Result<()> {
        match self.tracker.watch_pc()? {
            Some(pc) => self.machine.watch_pcs(&[pc]),
            None => self.machine.watch_pcs(&[]),
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_until_done();
        self.state = DriverState::Terminated;
        result
    }

    /// Position a copy of the tracker first, so a checkpoint the catalog
    /// cannot place never reaches the machine
    fn restore(&mut self, name: PathBuf) -> Result<()> {
        self.state = DriverState::Restoring;
        let metadata = self.store.read_metadata(&name)?;
        let mut tracker = self.tracker.clone();
        tracker.seed(&metadata)?;
        let metadata = self.store.restore_into(&name, &mut self.machine)?;
        self.tracker = tracker;
        self.restored = Some(metadata);
        Ok(())
    }

    fn run_until_done(&mut self) -> Result<RunSummary> {
        if let Some(name) = self.restore_from.take() {
            self.restore(name)?;
        }

        if let Some(count) = self.max_instructions {
            self.machine.schedule_instruction_limit(0, count);
        }
        for handler in self.handlers.values_mut() {
            let mut cx = SimContext {
                machine: &mut self.machine,
                tracker: &mut self.tracker,
                stats: &mut self.stats,
                store: &self.store,
                event: ExitEvent::Exit,
            };
            handler.on_start(&mut cx)?;
        }
        self.refresh_watch()?;

        self.state = DriverState::Running;
        info!("Starting simulation");
        let mut event = self.machine.start();
        let mut events = 0;
        let mut regions_completed = 0;
        loop {
            events += 1;
            self.state = DriverState::SuspendedAtEvent(event);
            let position = self.machine.current_location();
            self.tracker.record_instructions(position.instructions);
            debug!(
                "Got {} at 0x{:x} on core {} after {} instructions",
                event, position.pc, position.core, position.instructions
            );

            let regions_before = self.tracker.state().region_index;
            let mut cx = SimContext {
                machine: &mut self.machine,
                tracker: &mut self.tracker,
                stats: &mut self.stats,
                store: &self.store,
                event,
            };
            let action = match self.handlers.get_mut(&event) {
                Some(handler) => handler.next(&mut cx)?,
                None => self.default_handler.next(&mut cx)?,
            };
            regions_completed += self.tracker.state().region_index - regions_before;

            let exhausted =
                self.tracker.exhausted_reported() && self.tracker.options().exit_when_empty;
            match action {
                Some(Action::Resume) if !exhausted && event != ExitEvent::Exit => {
                    self.refresh_watch()?;
                    self.state = DriverState::Running;
                    event = self.machine.resume();
                }
                Some(Action::Resume) if event == ExitEvent::Exit => {
                    info!("Workload exited");
                    break;
                }
                Some(Action::Resume) => {
                    info!("All regions exhausted");
                    break;
                }
                Some(Action::Stop) => {
                    info!("Handler for {} stopped the simulation", event);
                    break;
                }
                None => {
                    info!("Handler for {} has nothing left, stopping", event);
                    break;
                }
            }
        }

        let instructions = self.machine.current_location().instructions;
        println!(
            "Simulation ended on {} after {} events and {} instructions",
            event, events, instructions
        );
        Ok(RunSummary {
            last_event: event,
            events,
            instructions,
            regions_completed,
        })
    }

    pub fn into_parts(self) -> (M, RegionTracker, StatsController) {
        (self.machine, self.tracker, self.stats)
    }
}
