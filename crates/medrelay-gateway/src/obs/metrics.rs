//! Gateway metrics registry.
//!
//! Every family maps a label set to an atomic cell in a `DashMap`. Labels are
//! sorted on the way in, so the same set always hits the same cell and
//! renders in the same order. Durations are recorded as integer microseconds.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

type Labels = Vec<(String, String)>;

fn labels_of(pairs: &[(&str, &str)]) -> Labels {
    let mut labels: Labels = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    labels.sort_unstable();
    labels
}

fn render_labels(labels: &Labels) -> String {
    let mut s = String::new();
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        let v = v.replace('\\', r"\\").replace('"', "\\\"").replace('\n', r"\n");
        let _ = write!(s, "{k}=\"{v}\"");
    }
    s
}

/// One metric family: a cell per distinct label set.
struct Family<C> {
    cells: DashMap<Labels, C>,
}

impl<C: Default> Default for Family<C> {
    fn default() -> Self {
        Self { cells: DashMap::new() }
    }
}

impl<C: Default> Family<C> {
    fn with<R>(&self, pairs: &[(&str, &str)], f: impl FnOnce(&C) -> R) -> R {
        let cell = self.cells.entry(labels_of(pairs)).or_default();
        f(&cell)
    }
}

#[derive(Default)]
pub struct CounterVec(Family<AtomicU64>);

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[(&str, &str)], n: u64) {
        self.0.with(labels, |c| c.fetch_add(n, Ordering::Relaxed));
    }

    /// Value for exactly this label set; 0 if never touched.
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.0
            .cells
            .get(&labels_of(labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} counter");
        for cell in self.0.cells.iter() {
            let v = cell.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}{{{}}} {v}", render_labels(cell.key()));
        }
    }
}

#[derive(Default)]
pub struct GaugeVec(Family<AtomicI64>);

impl GaugeVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn dec(&self, labels: &[(&str, &str)]) {
        self.add(labels, -1);
    }

    pub fn add(&self, labels: &[(&str, &str)], n: i64) {
        self.0.with(labels, |c| c.fetch_add(n, Ordering::Relaxed));
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} gauge");
        for cell in self.0.cells.iter() {
            let v = cell.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}{{{}}} {v}", render_labels(cell.key()));
        }
    }
}

/// Upper bounds in microseconds, 100us up to 1s.
const BOUNDS_MICROS: [u64; 9] = [
    100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000,
];

#[derive(Default)]
struct Buckets {
    count: AtomicU64,
    sum_micros: AtomicU64,
    le: [AtomicU64; BOUNDS_MICROS.len()],
}

#[derive(Default)]
pub struct HistogramVec(Family<Buckets>);

impl HistogramVec {
    /// Record one sample. Buckets are cumulative.
    pub fn observe(&self, labels: &[(&str, &str)], elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.0.with(labels, |b| {
            b.count.fetch_add(1, Ordering::Relaxed);
            b.sum_micros.fetch_add(micros, Ordering::Relaxed);
            for (bound, slot) in BOUNDS_MICROS.iter().zip(&b.le) {
                if micros <= *bound {
                    slot.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} histogram");
        for cell in self.0.cells.iter() {
            let b = cell.value();
            let labels = render_labels(cell.key());
            let sep = if labels.is_empty() { "" } else { "," };
            let count = b.count.load(Ordering::Relaxed);

            for (bound, slot) in BOUNDS_MICROS.iter().zip(&b.le) {
                let n = slot.load(Ordering::Relaxed);
                let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {n}");
            }
            let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {count}");
            let _ = writeln!(out, "{name}_sum{{{labels}}} {}", b.sum_micros.load(Ordering::Relaxed));
            let _ = writeln!(out, "{name}_count{{{labels}}} {count}");
        }
    }
}

#[derive(Default)]
pub struct GatewayMetrics {
    pub connections_accepted: CounterVec,
    pub connections_active: GaugeVec,
    /// Label `type`: frame message type.
    pub frames_in: CounterVec,
    /// Label `kind`: violation kind.
    pub protocol_errors: CounterVec,
    /// Label `outcome`: `DeliveryOutcome::as_str`.
    pub route_outcomes: CounterVec,
    /// Label `action`.
    pub dispatch_duration: HistogramVec,
    /// Label `outcome`: immediate, busy, parked, message, event, timeout,
    /// abandoned.
    pub polls: CounterVec,
    /// Label `direction`: in or out.
    pub file_bytes: CounterVec,
    draining: AtomicBool,
}

impl GatewayMetrics {
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition; `extra` carries gauges computed by the caller.
    pub fn render(&self, extra: &[(&str, u64)]) -> String {
        let mut out = String::new();
        self.connections_accepted.render("medrelay_connections_accepted_total", &mut out);
        self.connections_active.render("medrelay_connections_active", &mut out);
        self.frames_in.render("medrelay_frames_in_total", &mut out);
        self.protocol_errors.render("medrelay_protocol_errors_total", &mut out);
        self.route_outcomes.render("medrelay_route_outcomes_total", &mut out);
        self.dispatch_duration.render("medrelay_dispatch_duration_micros", &mut out);
        self.polls.render("medrelay_polls_total", &mut out);
        self.file_bytes.render("medrelay_file_bytes_total", &mut out);

        let draining = u8::from(self.is_draining());
        let _ = writeln!(out, "# TYPE medrelay_draining gauge");
        let _ = writeln!(out, "medrelay_draining {draining}");
        for (name, v) in extra {
            let _ = writeln!(out, "{name} {v}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_sorted_labels() {
        let m = GatewayMetrics::default();
        m.route_outcomes.inc(&[("outcome", "delivered")]);
        m.route_outcomes.inc(&[("outcome", "delivered")]);
        m.frames_in.add(&[("type", "json_request"), ("dir", "in")], 3);
        m.connections_active.inc(&[]);
        m.connections_active.dec(&[]);

        assert_eq!(m.route_outcomes.get(&[("outcome", "delivered")]), 2);
        assert_eq!(m.route_outcomes.get(&[("outcome", "no_route")]), 0);

        let body = m.render(&[("medrelay_routes_pending", 4)]);
        assert!(body.contains("medrelay_route_outcomes_total{outcome=\"delivered\"} 2"));
        assert!(body.contains("medrelay_frames_in_total{dir=\"in\",type=\"json_request\"} 3"));
        assert!(body.contains("medrelay_connections_active{} 0"));
        assert!(body.contains("medrelay_draining 0"));
        assert!(body.contains("medrelay_routes_pending 4"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let m = GatewayMetrics::default();
        m.dispatch_duration.observe(&[("action", "echo")], Duration::from_micros(700));
        let body = m.render(&[]);
        assert!(body.contains("medrelay_dispatch_duration_micros_bucket{action=\"echo\",le=\"500\"} 0"));
        assert!(body.contains("medrelay_dispatch_duration_micros_bucket{action=\"echo\",le=\"1000\"} 1"));
        assert!(body.contains("medrelay_dispatch_duration_micros_bucket{action=\"echo\",le=\"+Inf\"} 1"));
        assert!(body.contains("medrelay_dispatch_duration_micros_count{action=\"echo\"} 1"));
    }

    #[test]
    fn draining_flag_is_rendered() {
        let m = GatewayMetrics::default();
        m.set_draining();
        assert!(m.is_draining());
        assert!(m.render(&[]).contains("medrelay_draining 1"));
    }
}
