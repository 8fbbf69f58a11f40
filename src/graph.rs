//! Call-graph construction from raw sampler buffers.
//!
//! Sampled stacks are reconstructed root-first, rooted under a synthetic
//! frame, de-cycled so downstream consumers see a DAG, and folded into
//! per-entry-point edge maps carrying counts, CPU time, and distributed
//! memory costs.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::ProbeError;
use crate::pprof;

/// Synthetic root frame prepended to every stack so all sampled threads hang
/// under a common entry point.
pub const ROOT_FRAME: &str = "go";

/// A call relationship between two functions, the unit of the wire format.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: Option<String>,
    pub to: String,
    pub count: i64,
    pub cumulative_cpu_us: i64,
    pub cumulative_mem_bytes: i64,
}

impl Edge {
    fn new(from: Option<&str>, to: &str) -> Self {
        Self {
            from: from.map(str::to_string),
            to: to.to_string(),
            count: 0,
            cumulative_cpu_us: 0,
            cumulative_mem_bytes: 0,
        }
    }

    /// Wire name: `from==>to`, or just `to` for a root invocation.
    pub fn name(from: Option<&str>, to: &str) -> String {
        match from {
            Some(from) => format!("{from}==>{to}"),
            None => to.to_string(),
        }
    }

    /// Statistical sampling can miss intermediate leaves entirely; a zero
    /// count after folding is bumped to one.
    fn set_minimum_count(&mut self) {
        if self.count == 0 {
            self.count = 1;
        }
    }
}

/// A root-level function together with every edge reachable from it.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub name: String,
    pub cpu_us: i64,
    pub mem_bytes: i64,
    pub edges: BTreeMap<String, Edge>,
}

impl EntryPoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cpu_us: 0,
            mem_bytes: 0,
            edges: BTreeMap::new(),
        }
    }

    /// Fold one stack into the edge map. Every edge on the stack receives
    /// the CPU value and its running distributed-memory sum; only the leaf
    /// edge receives the count.
    fn add_stack(&mut self, stack: &[String], count: i64, cpu_us: i64, mem_running: Option<&[i64]>) {
        let mut from: Option<&str> = None;
        let last = stack.len().saturating_sub(1);

        for (i, to) in stack.iter().enumerate() {
            let name = Edge::name(from, to);
            let edge = self
                .edges
                .entry(name)
                .or_insert_with(|| Edge::new(from, to));

            edge.cumulative_cpu_us += cpu_us;
            if let Some(mem) = mem_running {
                edge.cumulative_mem_bytes += mem[i];
            }
            if i == last {
                edge.count += count;
            }
            from = Some(to);
        }
    }

    fn set_minimum_counts(&mut self) {
        for edge in self.edges.values_mut() {
            edge.set_minimum_count();
        }
    }
}

/// One CPU sample retained in order for the timeline pass.
#[derive(Debug, Clone)]
pub struct CpuSample {
    pub stack: Vec<String>,
    pub cpu_us: i64,
    pub mem_bytes: i64,
}

/// The aggregated call graph for one profile round.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub entry_points: BTreeMap<String, EntryPoint>,
    /// Entry point names, largest CPU share first.
    pub entry_points_by_cpu: Vec<String>,
    /// CPU samples in observation order, for timeline reconstruction.
    pub cpu_samples: Vec<CpuSample>,
    pub cpu_sample_rate_hz: u32,
    pub total_cpu_us: i64,
    pub total_mem_bytes: i64,
}

impl Profile {
    pub fn has_data(&self) -> bool {
        !self.entry_points.is_empty()
    }

    /// The entry point with the largest CPU share, used as the graph root.
    pub fn biggest_impact_entry_point(&self) -> Option<&EntryPoint> {
        self.entry_points_by_cpu
            .first()
            .and_then(|name| self.entry_points.get(name))
    }
}

struct RawSample {
    stack: Vec<String>,
    count: i64,
    value: i64,
}

/// Accumulates parsed samples and folds them into a [`Profile`].
pub struct ProfileBuilder {
    cpu_samples: Vec<RawSample>,
    heap_samples: Vec<RawSample>,
    sample_rate_hz: u32,
}

impl ProfileBuilder {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            cpu_samples: Vec::new(),
            heap_samples: Vec::new(),
            sample_rate_hz,
        }
    }

    /// Parse accumulated CPU and heap sampler buffers into a profile.
    pub fn from_buffers(
        cpu_buffers: &[Vec<u8>],
        heap_buffers: &[Vec<u8>],
        sample_rate_hz: u32,
    ) -> Result<Profile, ProbeError> {
        let mut builder = Self::new(sample_rate_hz);

        for buffer in cpu_buffers.iter().filter(|b| !b.is_empty()) {
            let parsed = pprof::Profile::parse(buffer)?;
            builder.ingest(&parsed, SampleKind::Cpu)?;
        }
        for buffer in heap_buffers.iter().filter(|b| !b.is_empty()) {
            let parsed = pprof::Profile::parse(buffer)?;
            builder.ingest(&parsed, SampleKind::Heap)?;
        }

        Ok(builder.finish())
    }

    /// Record a CPU sample: `count` occurrences worth `cpu_us` microseconds.
    /// The stack must already be decycled; [`ProfileBuilder::from_buffers`]
    /// handles that for pprof input.
    pub fn add_cpu_sample(&mut self, stack: Vec<String>, count: i64, cpu_us: i64) {
        self.cpu_samples.push(RawSample {
            stack,
            count,
            value: cpu_us,
        });
    }

    /// Record a heap sample: `count` allocations totalling `mem_bytes`.
    pub fn add_heap_sample(&mut self, stack: Vec<String>, count: i64, mem_bytes: i64) {
        self.heap_samples.push(RawSample {
            stack,
            count,
            value: mem_bytes,
        });
    }

    fn ingest(&mut self, parsed: &pprof::Profile, kind: SampleKind) -> Result<(), ProbeError> {
        let locations = parsed.locations_by_id();
        let functions = parsed.functions_by_id();

        for sample in &parsed.sample {
            let stack = reconstruct_stack(parsed, &locations, &functions, sample)?;
            let count = sample.value.first().copied().unwrap_or(0);
            let value = sample.value.get(1).copied().unwrap_or(0);

            match kind {
                // The sampler reports CPU time in nanoseconds.
                SampleKind::Cpu => self.add_cpu_sample(stack, count, value / 1000),
                SampleKind::Heap => self.add_heap_sample(stack, count, value),
            }
        }
        Ok(())
    }

    /// Fold everything into entry points and finalize counts and ordering.
    pub fn finish(self) -> Profile {
        // Heap costs accumulate on the terminal frame's function; the
        // reference count is the number of heap stacks a function appears in.
        let mut costs: HashMap<&str, i64> = HashMap::new();
        let mut refs: HashMap<&str, i64> = HashMap::new();
        for sample in &self.heap_samples {
            if let Some(leaf) = sample.stack.last() {
                *costs.entry(leaf).or_default() += sample.value;
            }
            let unique: HashSet<&str> = sample.stack.iter().map(String::as_str).collect();
            for name in unique {
                *refs.entry(name).or_default() += 1;
            }
        }

        let mut profile = Profile {
            cpu_sample_rate_hz: self.sample_rate_hz,
            ..Default::default()
        };

        for sample in &self.cpu_samples {
            let Some(root) = sample.stack.first() else {
                continue;
            };
            let entry = profile
                .entry_points
                .entry(root.clone())
                .or_insert_with(|| EntryPoint::new(root));
            entry.cpu_us += sample.value;
            entry.add_stack(&sample.stack, sample.count, sample.value, None);

            profile.total_cpu_us += sample.value;
            if sample.value > 0 {
                profile.cpu_samples.push(CpuSample {
                    stack: sample.stack.clone(),
                    cpu_us: sample.value,
                    mem_bytes: 0,
                });
            }
        }

        for sample in &self.heap_samples {
            let Some(root) = sample.stack.first() else {
                continue;
            };

            // Distribute each frame's share of its function cost, carrying
            // the running sum down the stack.
            let mut running = 0i64;
            let distributed: Vec<i64> = sample
                .stack
                .iter()
                .map(|name| {
                    let cost = costs.get(name.as_str()).copied().unwrap_or(0);
                    let spread = refs.get(name.as_str()).copied().unwrap_or(1).max(1);
                    running += cost / spread * sample.count;
                    running
                })
                .collect();

            let entry = profile
                .entry_points
                .entry(root.clone())
                .or_insert_with(|| EntryPoint::new(root));
            entry.mem_bytes += sample.value;
            entry.add_stack(&sample.stack, 0, 0, Some(&distributed));

            profile.total_mem_bytes += sample.value;
        }

        for entry in profile.entry_points.values_mut() {
            entry.set_minimum_counts();
        }

        let mut by_cpu: Vec<String> = profile.entry_points.keys().cloned().collect();
        by_cpu.sort_by_key(|name| std::cmp::Reverse(profile.entry_points[name].cpu_us));
        profile.entry_points_by_cpu = by_cpu;

        profile
    }
}

#[derive(Clone, Copy)]
enum SampleKind {
    Cpu,
    Heap,
}

/// Rebuild a root-first stack from a pprof sample and prepend the synthetic
/// root. Location ids are leaf-first; inline lines within a location expand
/// innermost-last when walking toward the root.
fn reconstruct_stack(
    parsed: &pprof::Profile,
    locations: &HashMap<u64, &pprof::Location>,
    functions: &HashMap<u64, &pprof::Function>,
    sample: &pprof::Sample,
) -> Result<Vec<String>, ProbeError> {
    let mut stack = Vec::with_capacity(sample.location_id.len() + 1);
    stack.push(ROOT_FRAME.to_string());

    for loc_id in sample.location_id.iter().rev() {
        let location = locations
            .get(loc_id)
            .ok_or_else(|| ProbeError::Sampler(format!("sample references unknown location {loc_id}")))?;
        for line in location.line.iter().rev() {
            let function = functions.get(&line.function_id).ok_or_else(|| {
                ProbeError::Sampler(format!(
                    "location {loc_id} references unknown function {}",
                    line.function_id
                ))
            })?;
            stack.push(parsed.string(function.name).to_string());
        }
    }

    decycle(&mut stack);
    Ok(stack)
}

/// Break recursion cycles by renaming the k-th re-occurrence of a name to
/// `name@k`, walking root to leaf. Downstream consumers require DAG call
/// graphs, and aggregating by id instead would collapse recursion into
/// self-edges the wire format cannot express.
pub fn decycle(stack: &mut [String]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for frame in stack.iter_mut() {
        match seen.get(frame).copied() {
            Some(dup_count) => {
                let original = frame.clone();
                *frame = format!("{frame}@{dup_count}");
                seen.insert(original, dup_count + 1);
            }
            None => {
                seen.insert(frame.clone(), 1);
            }
        }
    }
}
