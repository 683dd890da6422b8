use crate::{
    CheckpointMetadata, Error, Location, Region, RegionCatalog, RegionKind, Result, RunState,
    Target,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerOptions {
    /// re-anchor relative targets on every fired location, otherwise the
    /// anchor stays at the first fired (or restored) location
    pub update_relatives: bool,
    /// report exhaustion once all targets fired, otherwise keep continuing
    pub exit_when_empty: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            update_relatives: true,
            exit_when_empty: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// nothing completed, keep running
    Continue,
    /// the last target of a warmup region fired
    WarmupEnded,
    /// the last target of a detail region fired
    RegionEnded,
    /// no targets left
    AllRegionsExhausted,
}

/// Walks the ordered region list as locations arrive
#[derive(Debug, Clone)]
pub struct RegionTracker {
    origin: String,
    regions: Vec<Region>,
    options: TrackerOptions,
    state: RunState,
    /// resolved location of every fired target, per region
    fired: Vec<Vec<Option<u64>>>,
    exhausted_reported: bool,
}

impl RegionTracker {
    pub fn new(catalog: &RegionCatalog, options: TrackerOptions) -> Self {
        Self::build(catalog.origin.clone(), catalog.regions(), options)
    }

    /// Every region needs at least one target
    pub fn from_regions(
        origin: impl Into<String>,
        regions: Vec<Region>,
        options: TrackerOptions,
    ) -> Result<Self> {
        let origin = origin.into();
        if let Some(region) = regions.iter().find(|region| region.targets.is_empty()) {
            return Err(Error::configuration(
                &origin,
                format!("{} region {} has no targets", region.kind, region.id),
            ));
        }
        Ok(Self::build(origin, regions, options))
    }

    fn build(origin: impl Into<String>, regions: Vec<Region>, options: TrackerOptions) -> Self {
        let fired = regions
            .iter()
            .map(|region| vec![None; region.targets.len()])
            .collect();
        Self {
            origin: origin.into(),
            regions,
            options,
            state: RunState::default(),
            fired,
            exhausted_reported: false,
        }
    }

    /// A single region delimited by a (start, end) pair: reaching `start`
    /// ends the fast-forward part, reaching `end` ends the measured part
    pub fn elfie(start: Target, end: Target, options: TrackerOptions) -> Self {
        Self::build(
            "elfie",
            vec![
                Region {
                    id: "elfie".to_string(),
                    kind: RegionKind::Warmup,
                    targets: vec![start],
                    weight: None,
                },
                Region {
                    id: "elfie".to_string(),
                    kind: RegionKind::Detail,
                    targets: vec![end],
                    weight: None,
                },
            ],
            options,
        )
    }

    pub fn options(&self) -> TrackerOptions {
        self.options
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn current_region(&self) -> Option<&Region> {
        self.regions.get(self.state.region_index)
    }

    /// Region the tracker has most recently left, if any
    pub fn previous_region(&self) -> Option<&Region> {
        self.state
            .region_index
            .checked_sub(1)
            .and_then(|index| self.regions.get(index))
    }

    /// All targets fired
    pub fn is_finished(&self) -> bool {
        self.state.region_index >= self.regions.len()
    }

    /// `advance` answered `AllRegionsExhausted` at least once
    pub fn exhausted_reported(&self) -> bool {
        self.exhausted_reported
    }

    pub fn record_instructions(&mut self, instructions: u64) {
        self.state.record_instructions(instructions);
    }

    fn resolve(&self, region: &Region, target_index: usize) -> Result<u64> {
        let target = &region.targets[target_index];
        target.location.resolve(self.state.anchor).ok_or_else(|| {
            let reason = match self.state.anchor {
                None => "no location has fired yet".to_string(),
                Some(anchor) => format!("offset leaves the address space from anchor 0x{anchor:x}"),
            };
            Error::EventProtocol(format!(
                "{}: {} cannot resolve relative target, {}",
                self.origin,
                region.describe(target_index),
                reason
            ))
        })
    }

    /// Location the instruction-stream monitor should watch for the active
    /// target, `None` once finished
    pub fn watch_pc(&self) -> Result<Option<u64>> {
        match self.current_region() {
            Some(region) => self.resolve(region, self.state.target_index).map(Some),
            None => Ok(None),
        }
    }

    pub fn advance(&mut self, pc: u64) -> Result<Decision> {
        let Some(region) = self.regions.get(self.state.region_index) else {
            if self.options.exit_when_empty {
                self.exhausted_reported = true;
                return Ok(Decision::AllRegionsExhausted);
            }
            return Ok(Decision::Continue);
        };

        let target_index = self.state.target_index;
        let target = region.targets[target_index];
        let kind = region.kind;
        let num_targets = region.targets.len();
        let expected = self.resolve(region, target_index)?;
        if pc != expected {
            return Ok(Decision::Continue);
        }

        self.state.hits += 1;
        if self.state.hits < target.count {
            debug!(
                "Reached 0x{:x} {}/{} times",
                expected, self.state.hits, target.count
            );
            return Ok(Decision::Continue);
        }

        // the target fires
        self.fired[self.state.region_index][target_index] = Some(expected);
        if self.options.update_relatives || self.state.anchor.is_none() {
            self.state.anchor = Some(expected);
        }
        if target_index + 1 < num_targets {
            self.state.next_target();
            return Ok(Decision::Continue);
        }

        self.state.next_region();
        let id = &self.regions[self.state.region_index - 1].id;
        match kind {
            RegionKind::Warmup => {
                info!("Warmup of region {} ended at 0x{:x}", id, expected);
                self.state.warmed_up = true;
                Ok(Decision::WarmupEnded)
            }
            RegionKind::Detail => {
                info!("Region {} ended at 0x{:x}", id, expected);
                Ok(Decision::RegionEnded)
            }
        }
    }

    /// Position the tracker where a checkpoint left off.
    ///
    /// With a region id the region is looked up by id, so a checkpoint taken
    /// while walking a full catalog can be restored against a single selected
    /// region. Without one the recorded run state is taken as is.
    pub fn seed(&mut self, metadata: &CheckpointMetadata) -> Result<()> {
        let recorded = metadata.run_state;
        let mut state = recorded;
        if let Some(id) = &metadata.region_id {
            let by_kind = |kind: RegionKind| {
                self.regions
                    .iter()
                    .position(|region| &region.id == id && region.kind == kind)
            };
            let index = if metadata.warmed_up {
                by_kind(RegionKind::Detail).or_else(|| by_kind(RegionKind::Warmup))
            } else {
                by_kind(RegionKind::Warmup).or_else(|| by_kind(RegionKind::Detail))
            };
            let Some(index) = index else {
                return Err(Error::configuration(
                    &self.origin,
                    format!("checkpoint region {id:?} is not in the catalog"),
                ));
            };
            state.region_index = index;
            state.target_index = metadata.target_index;
            if index != recorded.region_index || metadata.target_index != recorded.target_index {
                state.hits = 0;
            }
            state.warmed_up = metadata.warmed_up;
        }

        let valid = match self.regions.get(state.region_index) {
            Some(region) => state.target_index < region.targets.len(),
            None => state.region_index == self.regions.len() && state.target_index == 0,
        };
        if !valid {
            return Err(Error::configuration(
                &self.origin,
                format!(
                    "checkpoint position region {} target {} is outside the catalog",
                    state.region_index, state.target_index
                ),
            ));
        }

        info!(
            "Resuming at region index {} target {} (anchor {:?}, warmed up: {})",
            state.region_index, state.target_index, state.anchor, state.warmed_up
        );
        self.state = state;
        Ok(())
    }

    /// Regions with every fired relative target replaced by the location it
    /// resolved to
    pub fn resolved_regions(&self) -> Vec<Region> {
        self.regions
            .iter()
            .zip(&self.fired)
            .map(|(region, fired)| {
                let mut region = region.clone();
                for (target, resolved) in region.targets.iter_mut().zip(fired) {
                    if let (Location::Relative(_), Some(pc)) = (target.location, resolved) {
                        target.location = Location::Absolute(*pc);
                    }
                }
                region
            })
            .collect()
    }

    pub fn resolved_catalog(&self) -> Result<RegionCatalog> {
        RegionCatalog::from_regions(self.origin.clone(), &self.resolved_regions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CatalogEntry;

    fn detail(id: &str, targets: Vec<Target>) -> Region {
        Region {
            id: id.to_string(),
            kind: RegionKind::Detail,
            targets,
            weight: None,
        }
    }

    #[test]
    fn test_warmup_then_detail() {
        let catalog = RegionCatalog::parse_csv("scenario.csv", "0x1000,2,,warmup\n0x2000,1,,detail\n")
            .unwrap();
        let mut tracker = RegionTracker::new(&catalog, TrackerOptions::default());
        let decisions: Vec<Decision> = [0x1000, 0x1000, 0x2000]
            .into_iter()
            .map(|pc| tracker.advance(pc).unwrap())
            .collect();
        assert_eq!(
            decisions,
            [Decision::Continue, Decision::WarmupEnded, Decision::RegionEnded]
        );
        assert!(tracker.state().warmed_up);
        assert_eq!(tracker.advance(0x3000).unwrap(), Decision::AllRegionsExhausted);
    }

    #[test]
    fn test_absolute_targets_exhaust() {
        let n = 5;
        let regions = (0..n)
            .map(|i| detail(&i.to_string(), vec![Target::absolute(0x400000 + i * 4, 1)]))
            .collect();
        let mut tracker =
            RegionTracker::from_regions("test", regions, TrackerOptions::default()).unwrap();
        for i in 0..n {
            // unrelated locations in between change nothing
            assert_eq!(tracker.advance(0xdead).unwrap(), Decision::Continue);
            assert_eq!(tracker.advance(0x400000 + i * 4).unwrap(), Decision::RegionEnded);
        }
        assert!(tracker.is_finished());
        assert!(!tracker.exhausted_reported());
        assert_eq!(tracker.advance(0x400000).unwrap(), Decision::AllRegionsExhausted);
        assert!(tracker.exhausted_reported());
    }

    #[test]
    fn test_no_exit_when_empty() {
        let options = TrackerOptions {
            exit_when_empty: false,
            ..Default::default()
        };
        let mut tracker = RegionTracker::new(&RegionCatalog::empty(), options);
        for pc in [0, 1, 2] {
            assert_eq!(tracker.advance(pc).unwrap(), Decision::Continue);
        }
        assert!(!tracker.exhausted_reported());

        let mut tracker = RegionTracker::new(&RegionCatalog::empty(), TrackerOptions::default());
        assert_eq!(tracker.advance(0).unwrap(), Decision::AllRegionsExhausted);
    }

    #[test]
    fn test_repeat_count_is_exact() {
        let regions = vec![detail(
            "loop",
            vec![Target::absolute(0x10, 3), Target::absolute(0x20, 1)],
        )];
        let mut tracker =
            RegionTracker::from_regions("test", regions, TrackerOptions::default()).unwrap();
        // 0x20 before the first target fired is not counted
        assert_eq!(tracker.advance(0x20).unwrap(), Decision::Continue);
        assert_eq!(tracker.advance(0x10).unwrap(), Decision::Continue);
        assert_eq!(tracker.advance(0x10).unwrap(), Decision::Continue);
        assert_eq!(tracker.state().target_index, 0);
        assert_eq!(tracker.advance(0x10).unwrap(), Decision::Continue);
        assert_eq!(tracker.state().target_index, 1);
        assert_eq!(tracker.state().hits, 0);
        // a fourth visit belongs to nobody
        assert_eq!(tracker.advance(0x10).unwrap(), Decision::Continue);
        assert_eq!(tracker.advance(0x20).unwrap(), Decision::RegionEnded);
    }

    fn relative_regions() -> Vec<Region> {
        vec![
            detail("1", vec![Target::absolute(0x1000, 1)]),
            detail(
                "2",
                vec![Target::relative(0x10, 1), Target::relative(0x20, 1)],
            ),
        ]
    }

    #[test]
    fn test_update_relatives() {
        let mut tracker =
            RegionTracker::from_regions("test", relative_regions(), TrackerOptions::default())
                .unwrap();
        assert_eq!(tracker.advance(0x1000).unwrap(), Decision::RegionEnded);
        assert_eq!(tracker.watch_pc().unwrap(), Some(0x1010));
        assert_eq!(tracker.advance(0x1010).unwrap(), Decision::Continue);
        // re-anchored on the relative target that just fired
        assert_eq!(tracker.watch_pc().unwrap(), Some(0x1030));
        assert_eq!(tracker.advance(0x1020).unwrap(), Decision::Continue);
        assert_eq!(tracker.advance(0x1030).unwrap(), Decision::RegionEnded);

        let resolved = tracker.resolved_catalog().unwrap();
        assert_eq!(
            resolved.entries[1],
            CatalogEntry {
                id: "2".to_string(),
                warmup: vec![],
                targets: vec![Target::absolute(0x1010, 1), Target::absolute(0x1030, 1)],
                weight: None,
            }
        );
    }

    #[test]
    fn test_fixed_anchor() {
        let options = TrackerOptions {
            update_relatives: false,
            ..Default::default()
        };
        let mut tracker =
            RegionTracker::from_regions("test", relative_regions(), options).unwrap();
        assert_eq!(tracker.advance(0x1000).unwrap(), Decision::RegionEnded);
        assert_eq!(tracker.advance(0x1010).unwrap(), Decision::Continue);
        assert_eq!(tracker.watch_pc().unwrap(), Some(0x1020));
        assert_eq!(tracker.advance(0x1020).unwrap(), Decision::RegionEnded);
    }

    #[test]
    fn test_region_without_targets() {
        let regions = vec![
            detail("1", vec![Target::absolute(0x10, 1)]),
            detail("2", vec![]),
        ];
        match RegionTracker::from_regions("test", regions, TrackerOptions::default()) {
            Err(Error::Configuration { message, .. }) => {
                assert!(message.contains("region 2 has no targets"))
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_unresolvable_relative() {
        let regions = vec![detail("1", vec![Target::relative(8, 1)])];
        let mut tracker =
            RegionTracker::from_regions("test", regions, TrackerOptions::default()).unwrap();
        assert!(matches!(tracker.watch_pc(), Err(Error::EventProtocol(_))));
        match tracker.advance(8) {
            Err(Error::EventProtocol(message)) => assert!(message.contains("region 1 target 0")),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_seed_by_region_id() {
        let catalog = RegionCatalog::parse_json(
            "looppoint.json",
            r#"{
                "1": {"targets": [{"pc": 16, "count": 1}]},
                "2": {"warmup": [{"offset": 4, "count": 2}], "targets": [{"pc": 64, "count": 1}]}
            }"#,
        )
        .unwrap();
        let mut tracker = RegionTracker::new(&catalog.select("2").unwrap(), TrackerOptions::default());
        let metadata = CheckpointMetadata {
            region_id: Some("2".to_string()),
            target_index: 0,
            warmed_up: false,
            run_state: RunState {
                region_index: 1,
                anchor: Some(0x20),
                instructions: 1000,
                ..Default::default()
            },
            ..CheckpointMetadata::new(1 << 30, 1, RunState::default())
        };
        tracker.seed(&metadata).unwrap();
        assert_eq!(tracker.state().region_index, 0);
        assert_eq!(tracker.state().instructions, 1000);
        assert_eq!(tracker.watch_pc().unwrap(), Some(0x24));
        assert_eq!(tracker.advance(0x24).unwrap(), Decision::Continue);
        assert_eq!(tracker.advance(0x24).unwrap(), Decision::WarmupEnded);
        assert_eq!(tracker.advance(64).unwrap(), Decision::RegionEnded);

        let missing = CheckpointMetadata {
            region_id: Some("9".to_string()),
            ..metadata.clone()
        };
        assert!(matches!(
            tracker.seed(&missing),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_seed_without_region_id() {
        let mut tracker =
            RegionTracker::from_regions("test", relative_regions(), TrackerOptions::default())
                .unwrap();
        let run_state = RunState {
            region_index: 1,
            target_index: 1,
            anchor: Some(0x2000),
            ..Default::default()
        };
        tracker
            .seed(&CheckpointMetadata::new(1 << 30, 1, run_state))
            .unwrap();
        assert_eq!(tracker.watch_pc().unwrap(), Some(0x2020));

        let outside = RunState {
            region_index: 1,
            target_index: 2,
            ..Default::default()
        };
        assert!(tracker.seed(&CheckpointMetadata::new(1 << 30, 1, outside)).is_err());
        // the failed seed left the earlier position alone
        assert_eq!(tracker.state().target_index, 1);
    }
}
