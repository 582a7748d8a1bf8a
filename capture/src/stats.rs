use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::dispatch::Ingest;
use crate::interner::SrcLocRef;
use crate::model::{TraceModel, ZoneRef};

/// Aggregated timing for one source location, over closed zones only.
/// Self time subtracts the spans of direct children.
#[derive(Debug, Clone, Default)]
pub struct SourceLocationStats {
    pub count: u64,
    pub min: i64,
    pub max: i64,
    pub total: i64,
    pub sum_sq: f64,
    pub self_min: i64,
    pub self_max: i64,
    pub self_total: i64,
    pub self_sum_sq: f64,
    /// Contributing zones in start order.
    pub zones: Vec<ZoneRef>,
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub by_src_loc: HashMap<SrcLocRef, SourceLocationStats>,
}

impl SourceLocationStats {
    fn record(&mut self, zone: ZoneRef, duration: i64, self_time: i64) {
        if self.count == 0 {
            self.min = duration;
            self.max = duration;
            self.self_min = self_time;
            self.self_max = self_time;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
            self.self_min = self.self_min.min(self_time);
            self.self_max = self.self_max.max(self_time);
        }
        self.count += 1;
        self.total += duration;
        self.sum_sq += duration as f64 * duration as f64;
        self.self_total += self_time;
        self.self_sum_sq += self_time as f64 * self_time as f64;
        self.zones.push(zone);
    }
}

/// One pass over a quiescent model. Open zones contribute nothing.
pub fn build_statistics(model: &TraceModel) -> Statistics {
    let mut stats = Statistics::default();
    for (idx, zone) in model.zones.iter().enumerate() {
        let Some(end) = zone.end else { continue };
        let r = ZoneRef(idx as u32);
        let duration = end - zone.start;
        let child_time: i64 = model
            .zone_children(r)
            .iter()
            .filter_map(|&c| {
                let child = &model.zones[c.0 as usize];
                child.end.map(|e| e - child.start)
            })
            .sum();
        stats
            .by_src_loc
            .entry(zone.src_loc)
            .or_default()
            .record(r, duration, duration - child_time);
    }
    for entry in stats.by_src_loc.values_mut() {
        entry
            .zones
            .sort_by_key(|&z| model.zones[z.0 as usize].start);
    }
    stats
}

/// Builds statistics on a background thread and publishes them through the
/// cell. Readers see nothing until the build completes.
pub fn spawn_statistics(
    ingest: Arc<RwLock<Ingest>>,
    cell: Arc<OnceLock<Statistics>>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("stats-build".into())
        .spawn(move || {
            let stats = {
                let guard = ingest.read();
                build_statistics(&guard.model)
            };
            debug!(locations = stats.by_src_loc.len(), "statistics ready");
            if cell.set(stats).is_err() {
                warn!("statistics already published");
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemFreePolicy;
    use protocol::Record;

    fn model_with_zones() -> TraceModel {
        let mut ing = Ingest::new(MemFreePolicy::Fail);
        let records = vec![
            Record::ZoneBegin { thread: 1, time: 100, src_loc: 0xa, cpu: 0 },
            Record::ZoneBegin { thread: 1, time: 110, src_loc: 0xb, cpu: 0 },
            Record::ZoneEnd { thread: 1, time: 140, cpu: 0 },
            Record::ZoneEnd { thread: 1, time: 200, cpu: 0 },
            Record::ZoneBegin { thread: 1, time: 300, src_loc: 0xa, cpu: 0 },
            Record::ZoneEnd { thread: 1, time: 340, cpu: 0 },
            // Left open, must not contribute.
            Record::ZoneBegin { thread: 1, time: 400, src_loc: 0xa, cpu: 0 },
        ];
        for r in records {
            ing.process(r).unwrap();
        }
        ing.model
    }

    #[test]
    fn per_location_aggregates_and_self_time() {
        let model = model_with_zones();
        let stats = build_statistics(&model);
        assert_eq!(stats.by_src_loc.len(), 2);

        let outer = &stats.by_src_loc[&SrcLocRef::Known(0)];
        assert_eq!(outer.count, 2);
        assert_eq!(outer.total, 100 + 40);
        assert_eq!(outer.min, 40);
        assert_eq!(outer.max, 100);
        // First zone spends 30 inside its child.
        assert_eq!(outer.self_total, 70 + 40);

        let inner = &stats.by_src_loc[&SrcLocRef::Known(1)];
        assert_eq!(inner.count, 1);
        assert_eq!(inner.total, 30);
        assert_eq!(inner.self_total, 30);
    }

    #[test]
    fn zones_listed_in_start_order() {
        let model = model_with_zones();
        let stats = build_statistics(&model);
        let outer = &stats.by_src_loc[&SrcLocRef::Known(0)];
        let starts: Vec<i64> = outer
            .zones
            .iter()
            .map(|&z| model.zones[z.0 as usize].start)
            .collect();
        assert_eq!(starts, vec![100, 300]);
    }

    #[test]
    fn background_build_publishes_once() {
        let ingest = Arc::new(RwLock::new(Ingest::new(MemFreePolicy::Fail)));
        let cell = Arc::new(OnceLock::new());
        assert!(cell.get().is_none());
        let handle = spawn_statistics(ingest, Arc::clone(&cell)).unwrap();
        handle.join().unwrap();
        assert!(cell.get().is_some());
    }
}
