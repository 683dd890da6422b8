use crate::{Error, Machine, Result, StatCounters};
use cli_table::{Cell, Table, print_stdout};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

/// One emission of the statistics counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsDump {
    /// which interval the counters cover, e.g. "warmup" or "region 2"
    pub label: String,
    pub counters: StatCounters,
}

impl StatsDump {
    /// Text block in the usual `name value` layout
    pub fn render(&self) -> String {
        let width = self
            .counters
            .keys()
            .map(|name| name.len())
            .max()
            .unwrap_or(0)
            .max(24);
        let mut text = String::new();
        text.push_str("---------- Begin Simulation Statistics ----------\n");
        text.push_str(&format!("# {}\n", self.label));
        for (name, value) in &self.counters {
            text.push_str(&format!("{name:<width$} {value:>20}\n"));
        }
        text.push_str("---------- End Simulation Statistics   ----------\n\n");
        text
    }
}

pub trait StatsSink {
    fn emit(&mut self, dump: &StatsDump) -> Result<()>;
}

/// Appends every dump to a text file
#[derive(Debug, Clone)]
pub struct TextSink {
    path: PathBuf,
}

impl TextSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StatsSink for TextSink {
    fn emit(&mut self, dump: &StatsDump) -> Result<()> {
        let io_err = |source| Error::StatsIo {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(dump.render().as_bytes()).map_err(io_err)?;
        Ok(())
    }
}

/// Prints every dump as a table on stdout
#[derive(Debug, Clone, Default)]
pub struct TableSink;

impl StatsSink for TableSink {
    fn emit(&mut self, dump: &StatsDump) -> Result<()> {
        println!("Statistics for {}:", dump.label);
        let table = dump
            .counters
            .iter()
            .map(|(name, value)| vec![name.cell(), value.cell()])
            .collect::<Vec<_>>()
            .table()
            .title(vec!["Statistic".cell(), "Value".cell()]);
        print_stdout(table).map_err(|source| Error::StatsIo {
            path: PathBuf::from("<stdout>"),
            source,
        })
    }
}

/// Reset and dump of the machine's statistics at region boundaries
#[derive(Default)]
pub struct StatsController {
    sinks: Vec<Box<dyn StatsSink>>,
    dumps: Vec<StatsDump>,
    resets: usize,
}

impl StatsController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl StatsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Every dump emitted so far, oldest first
    pub fn dumps(&self) -> &[StatsDump] {
        &self.dumps
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Zero the counters; machine state is left alone
    pub fn reset(&mut self, machine: &mut dyn Machine) {
        debug!("Resetting statistics");
        machine.reset_stats();
        self.resets += 1;
    }

    /// Emit the current counters. Dumping again without a reset or further
    /// simulation emits the same totals.
    pub fn dump(&mut self, machine: &dyn Machine, label: &str) -> Result<&StatsDump> {
        let dump = StatsDump {
            label: label.to_string(),
            counters: machine.stats(),
        };
        info!("Dumping statistics for {}", label);
        for sink in &mut self.sinks {
            sink.emit(&dump)?;
        }
        self.dumps.push(dump);
        Ok(&self.dumps[self.dumps.len() - 1])
    }

    /// Warmup to detail transition: the warmup interval is dumped before the
    /// counters are zeroed for the detail interval
    pub fn boundary(&mut self, machine: &mut dyn Machine, label: &str) -> Result<()> {
        self.dump(machine, label)?;
        self.reset(machine);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExitEvent, TraceMachine, TraceRecord};

    fn machine() -> TraceMachine {
        let trace = (0..10).map(|i| TraceRecord { pc: i, core: 0 }).collect();
        TraceMachine::new(trace, 1, 1 << 20)
    }

    #[test]
    fn test_dump_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m5out").join("stats.txt");
        let mut machine = machine();
        machine.schedule_instruction_limit(0, 4);
        assert_eq!(machine.start(), ExitEvent::MaxInstructions);

        let mut stats = StatsController::new().with_sink(TextSink::new(&path));
        stats.dump(&machine, "interval").unwrap();
        stats.dump(&machine, "interval").unwrap();
        assert_eq!(stats.dumps()[0], stats.dumps()[1]);
        assert_eq!(stats.dumps()[0].counters["simInsts"], 4);

        let text = std::fs::read_to_string(&path).unwrap();
        let block = stats.dumps()[0].render();
        assert_eq!(text, format!("{block}{block}"));
    }

    #[test]
    fn test_boundary_dumps_before_reset() {
        let mut machine = machine();
        machine.schedule_instruction_limit(0, 3);
        machine.start();

        let mut stats = StatsController::new();
        stats.boundary(&mut machine, "warmup").unwrap();
        assert_eq!(stats.dumps()[0].counters["simInsts"], 3);
        assert_eq!(stats.resets(), 1);
        assert_eq!(machine.stats()["simInsts"], 0);
        // machine state is untouched by a reset
        assert_eq!(machine.current_location().instructions, 3);

        machine.schedule_instruction_limit(0, 2);
        machine.resume();
        stats.dump(&machine, "detail").unwrap();
        assert_eq!(stats.dumps()[1].counters["simInsts"], 2);
    }
}
