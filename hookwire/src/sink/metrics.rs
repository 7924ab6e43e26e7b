use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use anyhow::Result;
use events::{DecodedEvent, EventBody, XdpAction};
use log::info;

use super::Sink;

#[derive(Default)]
struct ProbeMetrics {
    events: u64,
    /// Oldest and newest timestamps seen. Records from different CPUs may
    /// not be delivered in timestamp order.
    ts_range: Option<(u64, u64)>,
    /// Sum of the packet lengths reported by XDP events.
    bytes: u64,
    verdicts: HashMap<XdpAction, u64>,
}

impl ProbeMetrics {
    fn add(&mut self, event: &DecodedEvent) {
        self.events += 1;
        let ts = event.timestamp;
        self.ts_range = Some(match self.ts_range {
            Some((min, max)) => (min.min(ts), max.max(ts)),
            None => (ts, ts),
        });

        if let EventBody::Xdp(xdp) = &event.body {
            self.bytes += xdp.data_len as u64;
            if let Some(action) = xdp.action {
                *self.verdicts.entry(action).or_default() += 1;
            }
        }
    }

    fn summary(&self, probe: &str) -> String {
        let span = self.ts_range.map(|(min, max)| max - min).unwrap_or(0);
        let mut line = format!("{probe}: {} event(s) over {span}ns", self.events);

        if self.bytes > 0 {
            line.push_str(&format!(", {} byte(s)", self.bytes));
        }

        if !self.verdicts.is_empty() {
            let mut verdicts: Vec<String> = self
                .verdicts
                .iter()
                .map(|(action, count)| format!("{action}={count}"))
                .collect();
            verdicts.sort();
            line.push_str(&format!(", verdicts: {}", verdicts.join(" ")));
        }

        line
    }
}

/// Aggregates per probe statistics and logs them when finished, and
/// optionally at a given interval.
pub(crate) struct MetricsSink {
    probes: BTreeMap<String, ProbeMetrics>,
    report_interval: Option<Duration>,
    last_report: Instant,
}

impl MetricsSink {
    pub(crate) fn new(report_interval: Option<Duration>) -> Self {
        MetricsSink {
            probes: BTreeMap::new(),
            report_interval,
            last_report: Instant::now(),
        }
    }

    /// Number of events seen for a given probe.
    pub(crate) fn events(&self, probe: &str) -> u64 {
        self.probes.get(probe).map(|m| m.events).unwrap_or(0)
    }

    /// One line per probe, sorted by probe id.
    pub(crate) fn summary(&self) -> Vec<String> {
        self.probes
            .iter()
            .map(|(probe, metrics)| metrics.summary(probe))
            .collect()
    }

    fn report(&self) {
        if self.probes.is_empty() {
            info!("No event received");
            return;
        }
        self.summary().iter().for_each(|line| info!("{line}"));
    }
}

impl Sink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    fn deliver(&mut self, event: &DecodedEvent) -> Result<()> {
        // Avoid allocating the key on the hot path.
        match self.probes.get_mut(&event.probe) {
            Some(metrics) => metrics.add(event),
            None => self
                .probes
                .entry(event.probe.clone())
                .or_default()
                .add(event),
        }

        if let Some(interval) = self.report_interval {
            if self.last_report.elapsed() >= interval {
                self.report();
                self.last_report = Instant::now();
            }
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.report();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use events::{ProbeKind, XdpEvent};

    use super::*;

    fn event(probe: &str, ts: u64, body: EventBody) -> DecodedEvent {
        DecodedEvent {
            timestamp: ts,
            hook_id: 1,
            probe: probe.to_string(),
            hook: "xdp".to_string(),
            kind: ProbeKind::Exit,
            body,
        }
    }

    fn xdp(len: u32, action: Option<XdpAction>) -> EventBody {
        EventBody::Xdp(XdpEvent {
            ifindex: 1,
            rx_queue: 0,
            data_len: len,
            action,
        })
    }

    #[test]
    fn aggregate() {
        let mut sink = MetricsSink::new(None);

        sink.deliver(&event("fexit", 1000, xdp(60, Some(XdpAction::Pass))))
            .unwrap();
        sink.deliver(&event("fexit", 1500, xdp(40, Some(XdpAction::Drop))))
            .unwrap();
        sink.deliver(&event("fexit", 3000, xdp(100, Some(XdpAction::Pass))))
            .unwrap();
        sink.deliver(&event("fentry", 10, EventBody::Marker)).unwrap();

        assert_eq!(sink.events("fexit"), 3);
        assert_eq!(sink.events("fentry"), 1);
        assert_eq!(sink.events("unknown"), 0);
        assert_eq!(
            sink.summary(),
            vec![
                "fentry: 1 event(s) over 0ns",
                "fexit: 3 event(s) over 2000ns, 200 byte(s), verdicts: drop=1 pass=2",
            ]
        );
        assert!(sink.finish().is_ok());
    }

    #[test]
    fn out_of_order_timestamps() {
        let mut sink = MetricsSink::new(Some(Duration::ZERO));

        sink.deliver(&event("fentry", 2000, EventBody::Marker)).unwrap();
        sink.deliver(&event("fentry", 1000, EventBody::Marker)).unwrap();
        sink.deliver(&event("fentry", 1500, EventBody::Marker)).unwrap();

        assert_eq!(sink.summary(), vec!["fentry: 3 event(s) over 1000ns"]);
        assert!(sink.finish().is_ok());
    }

    #[test]
    fn periodic_report() {
        let mut sink = MetricsSink::new(Some(Duration::ZERO));

        for ts in 0..10 {
            sink.deliver(&event("fentry", ts, EventBody::Marker)).unwrap();
        }
        assert_eq!(sink.events("fentry"), 10);
    }
}
