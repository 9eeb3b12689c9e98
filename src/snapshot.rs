use chrono::Utc;

use crate::source::HopStatsSource;

/// Fixed logical capacity of a snapshot. Shorter paths are padded with empty
/// records so every serialized snapshot has uniform shape.
pub const MAX_HOPS: usize = 30;

/// Single delimiter used by the persisted history format.
pub const FIELD_SEPARATOR: char = ',';

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Identity of the machine and user running the session, attached once per
/// serialized snapshot line.
#[derive(Debug, Clone, Default)]
pub struct SessionIdentity {
    pub computer: String,
    pub user: String,
}

impl SessionIdentity {
    /// Best-effort detection from the environment; missing variables yield
    /// empty fields rather than an error.
    pub fn detect() -> Self {
        let computer = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_default();
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        Self { computer, user }
    }
}

/// One row of a snapshot. A pad record (hop index 0) has every field empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HopRecord {
    pub host: String,
    /// 1-based hop index; 0 marks a pad record.
    pub index: u32,
    pub loss_percent: u32,
    pub sent: u32,
    pub received: u32,
    pub best: u32,
    pub avg: u32,
    pub worst: u32,
    pub last: u32,
    /// UTC ISO-8601, second precision. Empty for pad records.
    pub timestamp: String,
}

impl HopRecord {
    pub const NO_RESPONSE: &'static str = "No response from host";

    pub fn is_live(&self) -> bool {
        self.index != 0
    }
}

/// Ordered per-hop statistics at one sampling instant. Immutable after
/// construction; always exactly `MAX_HOPS` records long.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Vec<HopRecord>,
    /// UTC ISO-8601 capture instant, serialized at the head of the line.
    pub captured_at: String,
    pub identity: SessionIdentity,
}

impl Snapshot {
    /// Reads the current hop set out of the source and freezes it. Pure
    /// function of the source at call time; no state is retained.
    pub fn build(source: &dyn HopStatsSource, identity: &SessionIdentity) -> Self {
        let stamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let n = source.hop_count().min(MAX_HOPS);

        let mut records = Vec::with_capacity(MAX_HOPS);
        for i in 0..n {
            let mut host = source.hop_name(i);
            if host.is_empty() {
                host = HopRecord::NO_RESPONSE.to_string();
            }
            records.push(HopRecord {
                host,
                index: (i + 1) as u32,
                loss_percent: source.hop_loss_percent(i),
                sent: source.hop_sent(i),
                received: source.hop_received(i),
                best: source.hop_best(i),
                avg: source.hop_avg(i),
                worst: source.hop_worst(i),
                last: source.hop_last(i),
                timestamp: stamp.clone(),
            });
        }
        records.resize(MAX_HOPS, HopRecord::default());

        Self {
            records,
            captured_at: stamp,
            identity: identity.clone(),
        }
    }

    /// Records that came from a real hop, in path order.
    pub fn live_records(&self) -> impl Iterator<Item = &HopRecord> {
        self.records.iter().filter(|r| r.is_live())
    }

    /// Serializes the snapshot as one history line: capture timestamp,
    /// machine and user identity, then the nine-field group for every one of
    /// the `MAX_HOPS` slots. Pad slots contribute empty-but-present fields.
    /// The single trailing delimiter is trimmed.
    pub fn to_history_line(&self) -> String {
        let mut line = String::new();
        line.push_str(&self.captured_at);
        line.push(FIELD_SEPARATOR);
        line.push_str(&self.identity.computer);
        line.push(FIELD_SEPARATOR);
        line.push_str(&self.identity.user);
        line.push(FIELD_SEPARATOR);

        for rec in &self.records {
            if rec.is_live() {
                line.push_str(&format!(
                    "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}",
                    rec.host,
                    rec.index,
                    rec.loss_percent,
                    rec.sent,
                    rec.received,
                    rec.best,
                    rec.avg,
                    rec.worst,
                    rec.last,
                    sep = FIELD_SEPARATOR,
                ));
            } else {
                // Nine empty fields keep the column layout stable.
                for _ in 0..9 {
                    line.push(FIELD_SEPARATOR);
                }
            }
        }
        line.pop();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TraceError};
    use crate::source::AddressFamily;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct FixedSource {
        hops: Vec<(String, u32)>,
    }

    impl HopStatsSource for FixedSource {
        fn initialized(&self) -> bool {
            true
        }
        fn supports_dual_stack(&self) -> bool {
            false
        }
        fn resolve_and_validate(&self, _: &str, _: AddressFamily) -> Result<IpAddr> {
            Err(TraceError::Resolution("fixed source".into()))
        }
        fn run_probe_cycle(&self, _: IpAddr, _: Arc<AtomicBool>) {}
        fn hop_count(&self) -> usize {
            self.hops.len()
        }
        fn hop_name(&self, i: usize) -> String {
            self.hops[i].0.clone()
        }
        fn hop_address(&self, _: usize) -> Option<IpAddr> {
            None
        }
        fn hop_loss_percent(&self, i: usize) -> u32 {
            self.hops[i].1
        }
        fn hop_sent(&self, _: usize) -> u32 {
            10
        }
        fn hop_received(&self, _: usize) -> u32 {
            9
        }
        fn hop_best(&self, _: usize) -> u32 {
            3
        }
        fn hop_avg(&self, _: usize) -> u32 {
            7
        }
        fn hop_worst(&self, _: usize) -> u32 {
            21
        }
        fn hop_last(&self, _: usize) -> u32 {
            5
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            computer: "workstation".into(),
            user: "operator".into(),
        }
    }

    #[test]
    fn short_path_is_padded_to_max_hops() {
        let source = FixedSource {
            hops: vec![("gw.local".into(), 0), ("core.example".into(), 50)],
        };
        let snap = Snapshot::build(&source, &identity());

        assert_eq!(snap.records.len(), MAX_HOPS);
        assert_eq!(snap.live_records().count(), 2);
        for rec in &snap.records[2..] {
            assert_eq!(*rec, HopRecord::default());
        }
    }

    #[test]
    fn empty_hop_name_gets_sentinel() {
        let source = FixedSource {
            hops: vec![(String::new(), 100)],
        };
        let snap = Snapshot::build(&source, &identity());
        assert_eq!(snap.records[0].host, HopRecord::NO_RESPONSE);
    }

    #[test]
    fn history_line_has_thirty_hop_groups() {
        let source = FixedSource {
            hops: vec![("gw.local".into(), 0), ("core.example".into(), 50)],
        };
        let snap = Snapshot::build(&source, &identity());
        let line = snap.to_history_line();

        // 3 session fields + 30 * 9 hop fields, trailing separator trimmed.
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        assert_eq!(fields.len(), 3 + MAX_HOPS * 9);

        assert_eq!(fields[1], "workstation");
        assert_eq!(fields[2], "operator");
        assert_eq!(fields[3], "gw.local");
        assert_eq!(fields[4], "1");
        assert_eq!(fields[5], "0");
        assert_eq!(fields[12], "core.example");
        assert_eq!(fields[14], "50");

        // The 28 pad groups are empty but present.
        for field in &fields[3 + 2 * 9..] {
            assert!(field.is_empty());
        }

        // Exactly one trailing delimiter was trimmed: the separator count is
        // one short of the field count.
        assert_eq!(line.matches(FIELD_SEPARATOR).count(), 3 + MAX_HOPS * 9 - 1);
    }

    #[test]
    fn overlong_path_is_clamped() {
        let source = FixedSource {
            hops: (0..40).map(|i| (format!("hop{i}"), 0)).collect(),
        };
        let snap = Snapshot::build(&source, &identity());
        assert_eq!(snap.records.len(), MAX_HOPS);
        assert_eq!(snap.live_records().count(), MAX_HOPS);
    }
}
