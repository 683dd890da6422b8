//! Instruction traces and a machine that replays them
//!
//! Trace file layout: a zstd stream of 10-byte records (`pc: u64`,
//! `core: u16`, little endian), followed by two uncompressed little-endian
//! u64 values: the number of records and the number of cores.
use crate::{ExitEvent, Machine, Position, StatCounters};
use std::{
    collections::HashSet,
    io::{BufWriter, Cursor, Error, ErrorKind, Read, Result, Write},
    path::Path,
};
use zstd::{Encoder, stream::read::Decoder};

const RECORD_SIZE: usize = 10;
const FOOTER_SIZE: usize = 16;
const BUFFER_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceRecord {
    pub pc: u64,
    pub core: u16,
}

impl TraceRecord {
    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..8].copy_from_slice(&self.pc.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.core.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut pc = [0u8; 8];
        pc.copy_from_slice(&bytes[0..8]);
        let mut core = [0u8; 2];
        core.copy_from_slice(&bytes[8..10]);
        Self {
            pc: u64::from_le_bytes(pc),
            core: u16::from_le_bytes(core),
        }
    }
}

pub struct TraceFileEncoder<W: Write> {
    encoder: Encoder<'static, BufWriter<W>>,
    num_records: u64,
    num_cores: u64,
    buffer: Vec<u8>,
}

impl<W: Write> TraceFileEncoder<W> {
    pub fn open(writer: W) -> Result<Self> {
        Ok(Self {
            encoder: Encoder::new(BufWriter::new(writer), 0)?,
            num_records: 0,
            num_cores: 0,
            buffer: Vec::with_capacity(BUFFER_SIZE * RECORD_SIZE),
        })
    }

    pub fn record(&mut self, record: TraceRecord) -> Result<()> {
        self.buffer.extend_from_slice(&record.to_bytes());
        self.num_records += 1;
        self.num_cores = self.num_cores.max(record.core as u64 + 1);
        if self.buffer.len() == BUFFER_SIZE * RECORD_SIZE {
            // flush
            self.encoder.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        if !self.buffer.is_empty() {
            self.encoder.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        let mut writer = self.encoder.finish()?;
        // write num_records and num_cores
        writer.write_all(&self.num_records.to_le_bytes())?;
        writer.write_all(&self.num_cores.to_le_bytes())?;
        writer.flush()?;
        writer.into_inner().map_err(|err| err.into_error())
    }
}

pub struct TraceFileDecoder<'a> {
    // raw trace file content
    pub content: &'a [u8],

    // parsed footer
    pub num_records: usize,
    pub num_cores: usize,
}

impl<'a> TraceFileDecoder<'a> {
    pub fn open(content: &'a [u8]) -> Result<TraceFileDecoder<'a>> {
        if content.len() < FOOTER_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "trace file is truncated"));
        }
        let mut tmp_u64 = [0u8; 8];
        tmp_u64.copy_from_slice(&content[content.len() - 16..content.len() - 8]);
        let num_records = u64::from_le_bytes(tmp_u64) as usize;
        tmp_u64.copy_from_slice(&content[content.len() - 8..content.len()]);
        let num_cores = u64::from_le_bytes(tmp_u64) as usize;
        Ok(Self {
            content,
            num_records,
            num_cores,
        })
    }

    pub fn records(&self) -> Result<TraceRecordIterator<'a>> {
        let compressed = &self.content[0..self.content.len() - FOOTER_SIZE];
        Ok(TraceRecordIterator {
            decoder: Decoder::new(Cursor::new(compressed))?,
            buf: vec![0u8; 1024 * 256],
            pending: vec![],
        })
    }

    pub fn read_all(&self) -> Result<Vec<TraceRecord>> {
        let mut records = Vec::with_capacity(self.num_records);
        for chunk in self.records()? {
            records.extend(chunk?);
        }
        if records.len() != self.num_records {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "trace footer announces {} records, found {}",
                    self.num_records,
                    records.len()
                ),
            ));
        }
        Ok(records)
    }
}

/// Yields decoded records chunk by chunk
pub struct TraceRecordIterator<'a> {
    decoder: Decoder<'a, std::io::BufReader<Cursor<&'a [u8]>>>,
    buf: Vec<u8>,
    // bytes of a record split across reads
    pending: Vec<u8>,
}

impl Iterator for TraceRecordIterator<'_> {
    type Item = Result<Vec<TraceRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        // ask for more data from decoder
        match self.decoder.read(&mut self.buf) {
            Ok(0) if self.pending.is_empty() => None,
            Ok(0) => {
                self.pending.clear();
                Some(Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "trace ends inside a record",
                )))
            }
            Ok(size) => {
                self.pending.extend_from_slice(&self.buf[..size]);
                let complete = self.pending.len() / RECORD_SIZE * RECORD_SIZE;
                let records = self.pending[..complete]
                    .chunks_exact(RECORD_SIZE)
                    .map(TraceRecord::from_bytes)
                    .collect();
                self.pending = self.pending.split_off(complete);
                Some(Ok(records))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

pub fn read_trace<P: AsRef<Path>>(path: P) -> Result<(Vec<TraceRecord>, usize)> {
    let content = std::fs::read(path)?;
    let file = TraceFileDecoder::open(&content)?;
    Ok((file.read_all()?, file.num_cores))
}

pub fn write_trace<P: AsRef<Path>>(path: P, records: &[TraceRecord]) -> Result<()> {
    let mut encoder = TraceFileEncoder::open(std::fs::File::create(path)?)?;
    for record in records {
        encoder.record(*record)?;
    }
    encoder.finish()?.sync_all()
}

const STATE_MAGIC: &[u8; 4] = b"RPTM";

/// A machine whose instruction stream is a recorded trace: every record is
/// one retired instruction on the given core.
///
/// Records naming a core beyond the machine's fold onto the available cores.
#[derive(Debug, Clone)]
pub struct TraceMachine {
    trace: Vec<TraceRecord>,
    cores: usize,
    memory_size: u64,

    // architectural state, what goes into the state blob
    cursor: usize,
    core_instructions: Vec<u64>,
    last_pc: Vec<u64>,

    // monitor state
    limits: Vec<Option<u64>>,
    total_limit: Option<usize>,
    watch: HashSet<u64>,
    pending: Option<ExitEvent>,
    last_core: usize,

    // statistics since the last reset
    sim_insts: u64,
    watch_hits: u64,
    committed: Vec<u64>,
}

impl TraceMachine {
    pub fn new(trace: Vec<TraceRecord>, cores: usize, memory_size: u64) -> Self {
        let cores = cores.max(1);
        Self {
            trace,
            cores,
            memory_size,
            cursor: 0,
            core_instructions: vec![0; cores],
            last_pc: vec![0; cores],
            limits: vec![None; cores],
            total_limit: None,
            watch: HashSet::new(),
            pending: None,
            last_core: 0,
            sim_insts: 0,
            watch_hits: 0,
            committed: vec![0; cores],
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, cores: usize, memory_size: u64) -> Result<Self> {
        let (trace, _) = read_trace(path)?;
        Ok(Self::new(trace, cores, memory_size))
    }

    pub fn trace_len(&self) -> usize {
        self.trace.len()
    }

    fn run(&mut self) -> ExitEvent {
        if let Some(event) = self.pending.take() {
            return event;
        }
        while let Some(record) = self.trace.get(self.cursor).copied() {
            let core = record.core as usize % self.cores;
            self.cursor += 1;
            self.core_instructions[core] += 1;
            self.last_pc[core] = record.pc;
            self.last_core = core;
            self.sim_insts += 1;
            self.committed[core] += 1;

            let core_limit_hit = self.limits[core] == Some(self.core_instructions[core]);
            if core_limit_hit {
                self.limits[core] = None;
            }
            let total_limit_hit = self.total_limit == Some(self.cursor);
            if total_limit_hit {
                self.total_limit = None;
            }
            let limit_hit = core_limit_hit || total_limit_hit;
            let watch_hit = self.watch.contains(&record.pc);
            if watch_hit {
                self.watch_hits += 1;
            }
            match (watch_hit, limit_hit) {
                (true, true) => {
                    self.pending = Some(ExitEvent::MaxInstructions);
                    return ExitEvent::RegionBegin;
                }
                (true, false) => return ExitEvent::RegionBegin,
                (false, true) => return ExitEvent::MaxInstructions,
                (false, false) => {}
            }
        }
        ExitEvent::Exit
    }
}

impl Machine for TraceMachine {
    fn start(&mut self) -> ExitEvent {
        self.run()
    }

    fn resume(&mut self) -> ExitEvent {
        self.run()
    }

    fn current_location(&self) -> Position {
        Position {
            core: self.last_core,
            pc: self.last_pc[self.last_core],
            instructions: self.cursor as u64,
        }
    }

    fn schedule_instruction_limit(&mut self, core: usize, count: u64) {
        let core = core % self.cores;
        self.limits[core] = Some(self.core_instructions[core] + count);
    }

    fn schedule_total_instruction_limit(&mut self, count: u64) {
        self.total_limit = Some(self.cursor + count as usize);
    }

    fn watch_pcs(&mut self, pcs: &[u64]) {
        self.watch = pcs.iter().copied().collect();
    }

    fn machine_state(&self) -> Vec<u8> {
        let mut state = Vec::with_capacity(16 + self.cores * 16);
        state.extend_from_slice(STATE_MAGIC);
        state.extend_from_slice(&(self.cursor as u64).to_le_bytes());
        state.extend_from_slice(&(self.cores as u32).to_le_bytes());
        for core in 0..self.cores {
            state.extend_from_slice(&self.core_instructions[core].to_le_bytes());
            state.extend_from_slice(&self.last_pc[core].to_le_bytes());
        }
        state.extend_from_slice(&(self.last_core as u32).to_le_bytes());
        state
    }

    fn load_machine_state(&mut self, state: &[u8]) -> Result<()> {
        let invalid = |message: String| Error::new(ErrorKind::InvalidData, message);
        let read_u64 = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&state[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        let read_u32 = |offset: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&state[offset..offset + 4]);
            u32::from_le_bytes(bytes) as usize
        };

        if state.len() < 16 || &state[0..4] != STATE_MAGIC {
            return Err(invalid("not a trace machine state".to_string()));
        }
        let cursor = read_u64(4) as usize;
        let cores = read_u32(12);
        if state.len() != 16 + cores * 16 + 4 {
            return Err(invalid(format!(
                "state of {} bytes does not match {} cores",
                state.len(),
                cores
            )));
        }
        if cores > self.cores {
            return Err(invalid(format!(
                "state has {} cores, machine has {}",
                cores, self.cores
            )));
        }
        if cursor > self.trace.len() {
            return Err(invalid(format!(
                "state is {} instructions into a trace of {}",
                cursor,
                self.trace.len()
            )));
        }
        let mut core_instructions = vec![0; self.cores];
        let mut last_pc = vec![0; self.cores];
        for core in 0..cores {
            core_instructions[core] = read_u64(16 + core * 16);
            last_pc[core] = read_u64(24 + core * 16);
        }
        if core_instructions.iter().sum::<u64>() != cursor as u64 {
            return Err(invalid(
                "per-core instruction counts do not add up".to_string(),
            ));
        }
        let last_core = read_u32(16 + cores * 16);
        if last_core >= self.cores {
            return Err(invalid(format!("last core {} out of range", last_core)));
        }

        self.cursor = cursor;
        self.core_instructions = core_instructions;
        self.last_pc = last_pc;
        self.last_core = last_core;
        self.limits = vec![None; self.cores];
        self.total_limit = None;
        self.pending = None;
        Ok(())
    }

    fn stats(&self) -> StatCounters {
        let mut counters = StatCounters::new();
        counters.insert("simInsts".to_string(), self.sim_insts);
        counters.insert("watchHits".to_string(), self.watch_hits);
        for (core, committed) in self.committed.iter().enumerate() {
            counters.insert(format!("cores{}.committedInsts", core), *committed);
        }
        counters
    }

    fn reset_stats(&mut self) {
        self.sim_insts = 0;
        self.watch_hits = 0;
        self.committed.fill(0);
    }

    fn memory_size(&self) -> u64 {
        self.memory_size
    }

    fn core_count(&self) -> usize {
        self.cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(pcs: &[u64]) -> Vec<TraceRecord> {
        pcs.iter()
            .enumerate()
            .map(|(i, pc)| TraceRecord {
                pc: *pc,
                core: (i % 2) as u16,
            })
            .collect()
    }

    #[test]
    fn test_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        // more than one encoder buffer and more than one decoder read
        let trace: Vec<TraceRecord> = (0..100_000u64)
            .map(|i| TraceRecord {
                pc: 0x400000 + (i % 77) * 4,
                core: (i % 3) as u16,
            })
            .collect();
        write_trace(&path, &trace).unwrap();
        let (decoded, num_cores) = read_trace(&path).unwrap();
        assert_eq!(num_cores, 3);
        assert_eq!(decoded, trace);
    }

    #[test]
    fn test_truncated_trace() {
        assert!(TraceFileDecoder::open(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_watch_and_limit() {
        let mut machine = TraceMachine::new(records(&[1, 2, 3, 2, 5, 6]), 2, 1 << 20);
        machine.watch_pcs(&[2]);
        assert_eq!(machine.start(), ExitEvent::RegionBegin);
        assert_eq!(machine.current_location().instructions, 2);
        assert_eq!(machine.current_location().core, 1);

        // core 1 retires the instruction at index 3 next, then 5
        machine.schedule_instruction_limit(1, 2);
        assert_eq!(machine.resume(), ExitEvent::RegionBegin);
        assert_eq!(machine.resume(), ExitEvent::MaxInstructions);
        assert_eq!(machine.current_location().pc, 6);
        assert_eq!(machine.resume(), ExitEvent::Exit);
        assert_eq!(machine.resume(), ExitEvent::Exit);
        assert_eq!(machine.stats()["watchHits"], 2);
        assert_eq!(machine.stats()["simInsts"], 6);
    }

    #[test]
    fn test_total_limit_counts_all_cores() {
        let mut machine = TraceMachine::new(records(&[1, 2, 3, 4, 5, 6, 7, 8]), 2, 1 << 20);
        machine.schedule_total_instruction_limit(3);
        assert_eq!(machine.start(), ExitEvent::MaxInstructions);
        assert_eq!(machine.current_location().instructions, 3);
        assert_eq!(machine.current_location().pc, 3);

        // the per-core limit for the same count lands later
        machine.schedule_instruction_limit(0, 3);
        machine.schedule_total_instruction_limit(3);
        assert_eq!(machine.resume(), ExitEvent::MaxInstructions);
        assert_eq!(machine.current_location().instructions, 6);
        assert_eq!(machine.resume(), ExitEvent::Exit);
        assert_eq!(machine.current_location().instructions, 8);
    }

    #[test]
    fn test_simultaneous_events() {
        let mut machine = TraceMachine::new(records(&[1, 2, 3]), 1, 1 << 20);
        machine.watch_pcs(&[2]);
        machine.schedule_instruction_limit(0, 2);
        assert_eq!(machine.start(), ExitEvent::RegionBegin);
        assert_eq!(machine.resume(), ExitEvent::MaxInstructions);
        assert_eq!(machine.current_location().instructions, 2);
        assert_eq!(machine.resume(), ExitEvent::Exit);
    }

    #[test]
    fn test_state_round_trip() {
        let trace = records(&[10, 20, 30, 40, 50]);
        let mut machine = TraceMachine::new(trace.clone(), 2, 1 << 20);
        machine.schedule_instruction_limit(0, 2);
        assert_eq!(machine.start(), ExitEvent::MaxInstructions);
        let state = machine.machine_state();

        let mut other = TraceMachine::new(trace.clone(), 4, 1 << 20);
        other.load_machine_state(&state).unwrap();
        assert_eq!(other.current_location(), machine.current_location());
        assert_eq!(other.resume(), ExitEvent::Exit);
        assert_eq!(other.stats()["simInsts"], 2);

        let mut single = TraceMachine::new(trace, 1, 1 << 20);
        let before = single.machine_state();
        assert!(single.load_machine_state(&state).is_err());
        assert!(single.load_machine_state(b"garbage").is_err());
        assert_eq!(single.machine_state(), before);
    }
}
