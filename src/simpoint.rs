//! SimPoint: pick representative fixed-size intervals of a run and simulate
//! only those, each after a short warmup
use crate::{Error, Result, TraceRecord, get_tqdm_style};
use indicatif::ProgressIterator;
use linfa::{
    Dataset,
    traits::{Fit, Predict},
};
use linfa_clustering::KMeans;
use log::{info, warn};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

/// SimPoint phase: a phase is a cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimPointPhase {
    /// the number of slices in the phase
    pub weight: u64,
    /// the starting instruction of the representative slice
    pub start_instruction: u64,
    /// the ending instruction of the representative slice
    pub end_instruction: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimPointResult {
    /// Path to trace file
    pub trace_path: PathBuf,
    /// SimPoint slice size in instructions
    pub size: u64,
    pub total_instructions: u64,
    /// number of slices the run was cut into
    pub num_slices: u64,
    /// SimPoint phases
    pub phases: Vec<SimPointPhase>,
}

impl SimPointResult {
    /// Simpoints of the representative slices, weighted by phase size
    pub fn to_schedule(&self, warmup_interval: u64) -> Result<SimPointSchedule> {
        let indices: Vec<u64> = self
            .phases
            .iter()
            .map(|phase| phase.start_instruction / self.size.max(1))
            .collect();
        let weights: Vec<f64> = self
            .phases
            .iter()
            .map(|phase| phase.weight as f64 / self.num_slices.max(1) as f64)
            .collect();
        SimPointSchedule::new(self.size, &indices, &weights, warmup_interval)
    }
}

/// One representative interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimPoint {
    /// interval number in the whole run
    pub index: u64,
    pub weight: f64,
    /// first instruction of the interval
    pub start: u64,
    /// instructions simulated before `start` to warm up
    pub warmup: u64,
}

impl SimPoint {
    /// where the checkpoint for this simpoint is taken
    pub fn checkpoint_point(&self) -> u64 {
        self.start - self.warmup
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimPointSchedule {
    pub interval: u64,
    pub warmup_interval: u64,
    pub simpoints: Vec<SimPoint>,
}

impl SimPointSchedule {
    pub fn new(interval: u64, indices: &[u64], weights: &[f64], warmup_interval: u64) -> Result<Self> {
        let origin = "simpoint schedule";
        if interval == 0 {
            return Err(Error::configuration(origin, "interval must be positive"));
        }
        if indices.len() != weights.len() {
            return Err(Error::configuration(
                origin,
                format!(
                    "{} simpoints but {} weights",
                    indices.len(),
                    weights.len()
                ),
            ));
        }
        let mut seen = HashSet::new();
        let mut simpoints = vec![];
        for (&index, &weight) in indices.iter().zip(weights) {
            if !seen.insert(index) {
                return Err(Error::configuration(
                    origin,
                    format!("simpoint {index} is listed twice"),
                ));
            }
            if !(0.0..=1.0).contains(&weight) {
                return Err(Error::configuration(
                    origin,
                    format!("simpoint {index}: weight {weight} is outside [0, 1]"),
                ));
            }
            let Some(start) = index.checked_mul(interval) else {
                return Err(Error::configuration(
                    origin,
                    format!("simpoint {index} starts beyond any instruction count"),
                ));
            };
            simpoints.push(SimPoint {
                index,
                weight,
                start,
                warmup: warmup_interval.min(start),
            });
        }
        let total: f64 = weights.iter().sum();
        if total > 1.0 + 1e-6 {
            warn!("simpoint weights add up to {:.4}", total);
        }
        Ok(Self {
            interval,
            warmup_interval,
            simpoints,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let content = std::fs::read(path).map_err(|err| Error::configuration(&origin, err.to_string()))?;
        let schedule: Self = serde_json::from_slice(&content)
            .map_err(|err| Error::configuration(&origin, err.to_string()))?;
        // rebuild to apply the checks
        let indices: Vec<u64> = schedule.simpoints.iter().map(|s| s.index).collect();
        let weights: Vec<f64> = schedule.simpoints.iter().map(|s| s.weight).collect();
        Self::new(schedule.interval, &indices, &weights, schedule.warmup_interval)
            .map_err(|err| Error::configuration(&origin, err.to_string()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::checkpoint_io(path, err.into()))?;
        std::fs::write(path, content).map_err(|err| Error::checkpoint_io(path, err))
    }
}

/// SimPoint slice: a slice is a part of the full simulation trace
#[derive(Debug, Clone, Default)]
struct SimPointSlice {
    /// the starting instruction
    start_instruction: u64,
    /// the ending instruction
    end_instruction: u64,
    /// instructions executed at each address, normalized
    frequency_vector: Vec<f64>,
}

fn finish_slice(start: u64, size: u64, counts: &HashMap<usize, u64>, dim: usize) -> SimPointSlice {
    let sum_insts: u64 = counts.values().sum();
    let mut frequency_vector = vec![0.0; dim];
    for (&column, &count) in counts {
        frequency_vector[column] = count as f64 / sum_insts.max(1) as f64;
    }
    SimPointSlice {
        start_instruction: start,
        end_instruction: start + size,
        frequency_vector,
    }
}

/// BIC(Bayesian Information Criterion) of a clustering
///
/// R: the number of points, d: their dimension, k: the number of clusters,
/// Ri: the number of points in the i-th cluster, sigma^2: the average
/// variance from each point to its cluster center of the i-th cluster
///
/// BIC = sum(-Ri*log(2*pi)/2-Ri*d*log(sigma^2)/2-(Ri-1)/2+Ri*log(Ri/R))-(k+d*k)*log(R)/2
fn bic(vectors: &Array2<f64>, centroids: &Array2<f64>, prediction: &[usize]) -> f64 {
    let r = vectors.nrows();
    let d = vectors.ncols();
    let k = centroids.nrows();
    let mut ri = vec![0usize; k];
    let mut sigma = vec![0f64; k];
    for (i, &cluster) in prediction.iter().enumerate() {
        ri[cluster] += 1;
        let centroid = centroids.index_axis(Axis(0), cluster);
        for j in 0..d {
            let diff = vectors[[i, j]] - centroid[j];
            sigma[cluster] += diff * diff;
        }
    }
    let mut bic = 0.0;
    for i in 0..k {
        // empty clusters add nothing but still cost parameters
        if ri[i] == 0 {
            continue;
        }
        let variance = sigma[i] / ri[i] as f64 + 1e-6;
        bic -= ri[i] as f64 * f64::ln(2.0 * std::f64::consts::PI) / 2.0;
        bic -= ri[i] as f64 * d as f64 * f64::ln(variance) / 2.0;
        bic -= (ri[i] - 1) as f64 / 2.0;
        bic += ri[i] as f64 * f64::ln(ri[i] as f64 / r as f64);
    }
    bic -= (k + d * k) as f64 * f64::ln(r as f64) / 2.0;
    bic
}

/// Cut the trace into slices of `size` instructions and cluster their
/// address frequency vectors, trying up to `max_clusters` clusters
pub fn analyze(
    trace_path: &Path,
    records: &[TraceRecord],
    size: u64,
    max_clusters: usize,
) -> anyhow::Result<SimPointResult> {
    anyhow::ensure!(size > 0, "SimPoint slice size must be positive");
    anyhow::ensure!(!records.is_empty(), "trace {} is empty", trace_path.display());

    let mut columns: HashMap<u64, usize> = HashMap::new();
    let mut slice_counts = vec![];
    let mut current: HashMap<usize, u64> = HashMap::new();
    let mut instructions = 0u64;

    let pbar = indicatif::ProgressBar::new(records.len() as u64);
    pbar.set_style(get_tqdm_style()?);
    for chunk in records.chunks(1 << 16) {
        for record in chunk {
            let next = columns.len();
            let column = *columns.entry(record.pc).or_insert(next);
            *current.entry(column).or_default() += 1;
            instructions += 1;
            if instructions % size == 0 {
                slice_counts.push(std::mem::take(&mut current));
            }
        }
        pbar.inc(chunk.len() as u64);
    }
    pbar.finish();
    // a trailing partial slice is kept like a full one
    if !current.is_empty() {
        slice_counts.push(current);
    }

    let dim = columns.len();
    let slices: Vec<SimPointSlice> = slice_counts
        .iter()
        .enumerate()
        .map(|(i, counts)| finish_slice(i as u64 * size, size, counts, dim))
        .collect();
    println!(
        "Collected {} SimPoint slices over {} addresses, running K-Means",
        slices.len(),
        dim
    );

    let mut vectors = Array2::<f64>::zeros((slices.len(), dim));
    for (i, slice) in slices.iter().enumerate() {
        for (j, val) in slice.frequency_vector.iter().enumerate() {
            vectors[[i, j]] = *val;
        }
    }
    let dataset = Dataset::from(vectors.clone());
    let max_clusters = max_clusters.clamp(1, slices.len());
    let mut models = vec![];
    for num_clusters in (1..max_clusters + 1).progress() {
        let model = KMeans::params(num_clusters)
            .tolerance(1e-2)
            .fit(&dataset)?;
        let prediction = model.predict(&dataset);
        let score = bic(&vectors, model.centroids(), prediction.as_slice().unwrap_or(&[]));
        models.push((model, score));
    }

    models.sort_by(|left, right| left.1.total_cmp(&right.1));

    // find the first model that: larger than 90% of the spread between the largest and smallest BIC
    let smallest_score = models[0].1;
    let largest_score = models[models.len() - 1].1;
    let threshold = smallest_score * 0.1 + largest_score * 0.9;
    let best_model = match models.iter().find(|model| model.1 >= threshold) {
        Some((model, _)) => model,
        None => &models[models.len() - 1].0,
    };

    let prediction = best_model.predict(&dataset);
    let num_clusters = best_model.centroids().nrows();
    info!("Got {} clusters", num_clusters);

    // for each cluster (phase):
    // 1. count points that belong to it
    // 2. find the nearest point to it
    let mut phase_weights = vec![0; num_clusters];
    let mut phase_nearest: Vec<Option<(usize, f64)>> = vec![None; num_clusters];
    for (i, &cluster) in prediction.iter().enumerate() {
        phase_weights[cluster] += 1;
        let mut dist = 0.0;
        for j in 0..dim {
            let diff = vectors[[i, j]] - best_model.centroids()[[cluster, j]];
            dist += diff * diff;
        }
        match phase_nearest[cluster] {
            Some((_, old_dist)) if old_dist <= dist => {}
            _ => phase_nearest[cluster] = Some((i, dist)),
        }
    }

    let mut phases: Vec<SimPointPhase> = phase_nearest
        .iter()
        .zip(&phase_weights)
        .filter_map(|(nearest, weight)| {
            nearest.map(|(i, _)| SimPointPhase {
                weight: *weight,
                start_instruction: slices[i].start_instruction,
                end_instruction: slices[i].end_instruction,
            })
        })
        .collect();
    // sort by start instruction
    phases.sort_by_key(|phase| phase.start_instruction);
    println!("Got {} phases", phases.len());

    Ok(SimPointResult {
        trace_path: trace_path.to_path_buf(),
        size,
        total_instructions: instructions,
        num_slices: slices.len() as u64,
        phases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule() {
        let schedule = SimPointSchedule::new(1_000_000, &[2, 0, 5], &[0.5, 0.25, 0.25], 1_500_000).unwrap();
        let points: Vec<(u64, u64, u64)> = schedule
            .simpoints
            .iter()
            .map(|s| (s.start, s.warmup, s.checkpoint_point()))
            .collect();
        assert_eq!(
            points,
            [
                (2_000_000, 1_500_000, 500_000),
                (0, 0, 0),
                (5_000_000, 1_500_000, 3_500_000)
            ]
        );
    }

    #[test]
    fn test_schedule_errors() {
        assert!(SimPointSchedule::new(100, &[1, 2], &[0.5], 0).is_err());
        assert!(SimPointSchedule::new(100, &[1, 1], &[0.5, 0.5], 0).is_err());
        assert!(SimPointSchedule::new(100, &[1], &[1.5], 0).is_err());
        assert!(SimPointSchedule::new(100, &[1], &[-0.1], 0).is_err());
        assert!(SimPointSchedule::new(0, &[1], &[0.5], 0).is_err());
    }

    #[test]
    fn test_schedule_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simpoints.json");
        let schedule = SimPointSchedule::new(100, &[3, 7], &[0.4, 0.6], 50).unwrap();
        schedule.save(&path).unwrap();
        assert_eq!(SimPointSchedule::load(&path).unwrap(), schedule);
    }

    #[test]
    fn test_analyze() {
        // two alternating program phases, three slices each, with a little
        // noise so no two slices look exactly alike
        let mut records = vec![];
        for (slice, phase) in [0u64, 1, 0, 1, 0, 1].into_iter().enumerate() {
            for i in 0..100u64 {
                let pc = if i < 95 {
                    0x400000 + phase * 0x1000 + (i % 10) * 4
                } else {
                    0x500000 + slice as u64 * 4
                };
                records.push(TraceRecord { pc, core: 0 });
            }
        }
        let result = analyze(Path::new("phases.trace"), &records, 100, 4).unwrap();
        assert_eq!(result.num_slices, 6);
        assert_eq!(result.total_instructions, 600);
        assert_eq!(result.phases.iter().map(|phase| phase.weight).sum::<u64>(), 6);
        for phase in &result.phases {
            assert_eq!(phase.start_instruction % 100, 0);
            assert_eq!(phase.end_instruction, phase.start_instruction + 100);
        }

        let schedule = result.to_schedule(100).unwrap();
        assert_eq!(schedule.simpoints.len(), result.phases.len());
        let total: f64 = schedule.simpoints.iter().map(|s| s.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
