//! Blackfire wire-format emission.
//!
//! The format is line-based US-ASCII: a `file-format` marker, headers, an
//! optional timeline block, a blank separator, then one line per call-graph
//! edge and a trailing aggregate line. Header names and the `@k` decycling
//! suffix are bit-exact requirements of the agent.

use std::collections::HashMap;
use std::io::Write;

use crate::graph::{Profile, ROOT_FRAME};
use crate::options::ProbeOptions;
use crate::sysinfo;

/// Write a built profile in the Blackfire probe format.
pub fn write_profile<W: Write>(
    w: &mut W,
    profile: &Profile,
    options: &ProbeOptions,
    title: &str,
) -> std::io::Result<()> {
    let graph_root = profile
        .biggest_impact_entry_point()
        .map(|ep| ep.name.as_str())
        .unwrap_or(ROOT_FRAME);

    w.write_all(b"file-format: BlackfireProbe\n")?;

    writeln!(w, "Cost-Dimensions: cpu pmu")?;
    writeln!(w, "graph-root-id: {graph_root}")?;
    writeln!(w, "probed-os: {}", sysinfo::os_name())?;
    writeln!(w, "profiler-type: statistical")?;
    writeln!(w, "probed-language: go")?;
    writeln!(w, "probed-runtime: {}", sysinfo::runtime_id())?;
    writeln!(w, "probed-cpu-sample-rate: {}", profile.cpu_sample_rate_hz)?;
    writeln!(w, "probed-features: {}", probed_features_header(options))?;
    writeln!(w, "Context: {}", context_header())?;

    if !title.is_empty() {
        let metadata =
            serde_json::json!({ "blackfire-metadata": { "title": title } });
        writeln!(w, "Profile-Title: {metadata}")?;
    }

    if options.is_timespan_set() {
        write_timeline(w, profile)?;
    }

    // End of headers.
    w.write_all(b"\n")?;

    if let Some(entry) = profile.biggest_impact_entry_point() {
        for (name, edge) in &entry.edges {
            writeln!(
                w,
                "{name}//{} {} {}",
                edge.count, edge.cumulative_cpu_us, edge.cumulative_mem_bytes
            )?;
        }
    }

    writeln!(
        w,
        "==>{ROOT_FRAME}//1 {} {}",
        profile.total_cpu_us, profile.total_mem_bytes
    )?;

    Ok(())
}

/// Whitelisted probe options as a URL-encoded query string.
fn probed_features_header(options: &ProbeOptions) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in options.allowed() {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

fn context_header() -> String {
    context_header_from_args(&sysinfo::host_args())
}

/// `script=<argv0>&argv[0]=<argv0>&argv[1]=...`, all values URL-escaped.
fn context_header_from_args(args: &[String]) -> String {
    let empty = String::new();
    let script = args.first().unwrap_or(&empty);

    let mut header = String::from("script=");
    header.push_str(&escape(script));
    for (i, arg) in args.iter().enumerate() {
        header.push('&');
        header.push_str(&escape(&format!("argv[{i}]")));
        header.push('=');
        header.push_str(&escape(arg));
    }
    header
}

fn escape(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// One function's lifetime on the sampled timeline.
struct TimelineEntry {
    parent: Option<String>,
    name: String,
    cpu_start: i64,
    cpu_end: i64,
    mem_start: i64,
    mem_end: i64,
}

/// Reconstruct per-function time spans from the ordered CPU sample stacks.
///
/// A linear scan keeps the currently active entries; at each step the longest
/// common prefix with the previous stack stays open, everything deeper in the
/// previous stack closes leaf-to-root, and everything deeper in the current
/// stack opens at the running CPU sum.
fn write_timeline<W: Write>(w: &mut W, profile: &Profile) -> std::io::Result<()> {
    const STACK_TOP: &str = "golang";

    let mut active: HashMap<String, TimelineEntry> = HashMap::new();
    let mut closed: Vec<TimelineEntry> = Vec::new();

    let mut prev: Vec<String> = Vec::new();
    let mut cpu_sum = 0i64;

    for sample in &profile.cpu_samples {
        let mut now: Vec<String> = Vec::with_capacity(sample.stack.len() + 1);
        now.push(STACK_TOP.to_string());
        now.extend(sample.stack.iter().cloned());

        let shortest = prev.len().min(now.len());
        let mut last_match = 0;
        for i in 1..shortest {
            if now[i] != prev[i] {
                break;
            }
            if let Some(entry) = active.get_mut(&now[i]) {
                entry.cpu_end = cpu_sum + sample.cpu_us;
                entry.mem_end = sample.mem_bytes;
            }
            last_match = i;
        }

        for i in (last_match + 1..prev.len()).rev() {
            if let Some(entry) = active.remove(&prev[i]) {
                closed.push(entry);
            }
        }

        for i in last_match + 1..now.len() {
            let parent = if i > 1 { Some(now[i - 1].clone()) } else { None };
            active.insert(
                now[i].clone(),
                TimelineEntry {
                    parent,
                    name: now[i].clone(),
                    cpu_start: cpu_sum,
                    cpu_end: cpu_sum + sample.cpu_us,
                    mem_start: sample.mem_bytes,
                    mem_end: sample.mem_bytes,
                },
            );
        }

        cpu_sum += sample.cpu_us;
        prev = now;
    }

    // The profile is over: every still-open entry ends now, leaf-to-root.
    for i in (1..prev.len()).rev() {
        if let Some(entry) = active.remove(&prev[i]) {
            closed.push(entry);
        }
    }

    for (index, entry) in closed.iter().enumerate() {
        let prefix = match &entry.parent {
            Some(parent) => format!("{parent}==>>"),
            None => String::new(),
        };
        writeln!(
            w,
            "Threshold-{index}-start: {prefix}{}//{} {}",
            entry.name, entry.cpu_start, entry.mem_start
        )?;
        writeln!(
            w,
            "Threshold-{index}-end: {prefix}{}//{} {}",
            entry.name, entry.cpu_end, entry.mem_end
        )?;
    }

    Ok(())
}
