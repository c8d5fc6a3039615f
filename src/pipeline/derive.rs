//! Container-level metrics derived from raw node-exporter families.
//!
//! The building block is a grouped-sample algebra: samples are grouped
//! by their full label set (so per-container identity tags keep the
//! groups apart), values colliding on the same key are summed, and two
//! grouped families can be combined elementwise. New derived metrics
//! are one `grouped` + `subtract` chain away.

use std::collections::HashMap;

use crate::exposition::{MetricFamily, MetricType, SampleKey};

const MEM_TOTAL: &str = "node_memory_MemTotal_bytes";
const MEM_FREE: &str = "node_memory_MemFree_bytes";
const MEM_CACHED: &str = "node_memory_Cached_bytes";
const MEM_BUFFERS: &str = "node_memory_Buffers_bytes";

const MEMORY_USAGE: &str = "container_memory_usage_bytes";
const MEMORY_RSS: &str = "container_memory_rss";
const MEMORY_CACHE: &str = "container_memory_cache";

const MEMORY_USAGE_HELP: &str = "Current memory usage in bytes, including all memory regardless of when it was accessed";
const MEMORY_RSS_HELP: &str = "Size of RSS in bytes";
const MEMORY_CACHE_HELP: &str = "Number of bytes of page cache memory";

/// Computes the synthetic container families over a merged scrape
/// result and applies the fixed renames. Derived and renamed families
/// replace any family already present under their target name.
pub fn derive_container_metrics(families: &mut HashMap<String, MetricFamily>) {
    derive_memory(families);
    rename(
        families,
        "node_cpu_seconds_total",
        "container_cpu_usage_seconds_total",
    );
    rename(families, "node_memory_Mapped_bytes", "container_memory_mapped_file");
}

/// `usage = total - free`, `rss = usage - buffers - cached`. Emitted
/// only when all four input families were scraped; a partial set
/// suppresses the derived output without error.
fn derive_memory(families: &mut HashMap<String, MetricFamily>) {
    let (Some(total), Some(free), Some(cached), Some(buffers)) = (
        families.get(MEM_TOTAL),
        families.get(MEM_FREE),
        families.get(MEM_CACHED),
        families.get(MEM_BUFFERS),
    ) else {
        return;
    };

    let usage = subtract(grouped(total, MEMORY_USAGE), &grouped(free, MEMORY_USAGE));
    let rss = subtract(
        subtract(grouped(total, MEMORY_RSS), &grouped(free, MEMORY_RSS)),
        &sum(grouped(buffers, MEMORY_RSS), &grouped(cached, MEMORY_RSS)),
    );
    let cache = grouped(cached, MEMORY_CACHE);

    let usage_family = family_of(MEMORY_USAGE, total.typ, MEMORY_USAGE_HELP, usage);
    let rss_family = family_of(MEMORY_RSS, total.typ, MEMORY_RSS_HELP, rss);
    let cache_family = family_of(MEMORY_CACHE, cached.typ, MEMORY_CACHE_HELP, cache);

    families.insert(MEMORY_USAGE.to_owned(), usage_family);
    families.insert(MEMORY_RSS.to_owned(), rss_family);
    families.insert(MEMORY_CACHE.to_owned(), cache_family);
}

/// Regroups a family's samples under a new name, preserving type and
/// help. The source entry is removed.
fn rename(families: &mut HashMap<String, MetricFamily>, from: &str, to: &str) {
    let Some(family) = families.remove(from) else {
        return;
    };
    let groups = grouped(&family, to);
    let mut renamed = family_of(to, family.typ, "", groups);
    renamed.help = family.help;
    families.insert(to.to_owned(), renamed);
}

/// Groups samples by `(target name, full label set)`, summing values
/// that collide on the same key.
fn grouped(family: &MetricFamily, name: &str) -> HashMap<SampleKey, f64> {
    let mut groups: HashMap<SampleKey, f64> = HashMap::new();
    for sample in &family.samples {
        let key = SampleKey::of(sample).renamed(name);
        *groups.entry(key).or_insert(0.0) += sample.value;
    }
    groups
}

/// Elementwise `left - right`, aligned by key; a key absent on the
/// right subtracts nothing.
fn subtract(left: HashMap<SampleKey, f64>, right: &HashMap<SampleKey, f64>) -> HashMap<SampleKey, f64> {
    left.into_iter()
        .map(|(key, value)| {
            let rhs = right.get(&key).copied().unwrap_or(0.0);
            (key, value - rhs)
        })
        .collect()
}

/// Elementwise `left + right` over left's keys.
fn sum(left: HashMap<SampleKey, f64>, right: &HashMap<SampleKey, f64>) -> HashMap<SampleKey, f64> {
    left.into_iter()
        .map(|(key, value)| {
            let rhs = right.get(&key).copied().unwrap_or(0.0);
            (key, value + rhs)
        })
        .collect()
}

fn family_of(
    name: &str,
    typ: MetricType,
    help: &str,
    groups: HashMap<SampleKey, f64>,
) -> MetricFamily {
    let mut family = MetricFamily::new(
        name,
        typ,
        (!help.is_empty()).then(|| help.to_owned()),
    );
    // Sorted for stable serialization.
    let mut entries: Vec<(SampleKey, f64)> = groups.into_iter().collect();
    entries.sort_by(|a, b| a.0.labels.cmp(&b.0.labels));
    family.samples = entries
        .into_iter()
        .map(|(key, value)| key.to_sample(value))
        .collect();

    family
}
