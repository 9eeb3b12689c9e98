use crate::snapshot::Snapshot;

const TEXT_RULE: &str =
    "|------------------------------------------------------------------------------------------|";
const TEXT_TITLE: &str =
    "|                                     hoptrace statistics                                  |";
const TEXT_HEAD: &str =
    "|                       Host              -   %  | Sent | Recv | Best | Avrg | Wrst | Last |";
const TEXT_SEP: &str =
    "|------------------------------------------------|------|------|------|------|------|------|";
const TEXT_FOOT: &str =
    "|________________________________________________|______|______|______|______|______|______|";
const TEXT_SIGNATURE: &str = concat!("   hoptrace v", env!("CARGO_PKG_VERSION"));

/// Fixed-width pipe-bordered table over the live rows of a snapshot. Total
/// over any well-formed snapshot; integers are never reformatted lossily.
pub fn render_text(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    out.push_str(TEXT_RULE);
    out.push('\n');
    out.push_str(TEXT_TITLE);
    out.push('\n');
    out.push_str(TEXT_HEAD);
    out.push('\n');
    out.push_str(TEXT_SEP);
    out.push('\n');

    for rec in snapshot.live_records() {
        out.push_str(&format!(
            "|{:>40} - {:>4} | {:>4} | {:>4} | {:>4} | {:>4} | {:>4} | {:>4} |\n",
            rec.host,
            rec.loss_percent,
            rec.sent,
            rec.received,
            rec.best,
            rec.avg,
            rec.worst,
            rec.last,
        ));
    }

    out.push_str(TEXT_FOOT);
    out.push('\n');
    out.push_str(TEXT_SIGNATURE);
    out.push('\n');
    out
}

/// HTML `<table>` document over the live rows of a snapshot.
pub fn render_html(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    out.push_str("<html><head><title>hoptrace statistics</title></head><body bgcolor=\"white\">\n");
    out.push_str("<center><h2>hoptrace statistics</h2></center>\n");
    out.push_str("<p align=\"center\"> <table border=\"1\" align=\"center\">\n");
    out.push_str(
        "<tr><td>Host</td> <td>%</td> <td>Sent</td> <td>Recv</td> <td>Best</td> \
         <td>Avrg</td> <td>Wrst</td> <td>Last</td></tr>\n",
    );

    for rec in snapshot.live_records() {
        out.push_str(&format!(
            "<tr><td>{}</td> <td>{}</td> <td>{}</td> <td>{}</td> <td>{}</td> \
             <td>{}</td> <td>{}</td> <td>{}</td></tr>\n",
            rec.host,
            rec.loss_percent,
            rec.sent,
            rec.received,
            rec.best,
            rec.avg,
            rec.worst,
            rec.last,
        ));
    }

    out.push_str("</table></body></html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{HopRecord, MAX_HOPS, SessionIdentity};

    fn sample_snapshot() -> Snapshot {
        let mut records = vec![
            HopRecord {
                host: "gw.local".into(),
                index: 1,
                loss_percent: 0,
                sent: 120,
                received: 120,
                best: 1,
                avg: 3,
                worst: 42,
                last: 2,
                timestamp: "2026-01-02T03:04:05Z".into(),
            },
            HopRecord {
                host: HopRecord::NO_RESPONSE.into(),
                index: 2,
                loss_percent: 50,
                sent: 120,
                received: 60,
                best: 9,
                avg: 14,
                worst: 301,
                last: 11,
                timestamp: "2026-01-02T03:04:05Z".into(),
            },
        ];
        records.resize(MAX_HOPS, HopRecord::default());
        Snapshot {
            records,
            captured_at: "2026-01-02T03:04:05Z".into(),
            identity: SessionIdentity::default(),
        }
    }

    #[test]
    fn text_rows_round_trip_numeric_fields() {
        let snap = sample_snapshot();
        let text = render_text(&snap);
        let rows: Vec<&str> = text
            .lines()
            .filter(|l| l.contains(" - "))
            .filter(|l| !l.contains("Host"))
            .collect();
        assert_eq!(rows.len(), 2);

        for (row, rec) in rows.iter().zip(snap.live_records()) {
            let (host_part, rest) = row
                .trim_matches('|')
                .split_once(" - ")
                .expect("row layout");
            assert_eq!(host_part.trim(), rec.host);

            let numbers: Vec<u32> = rest
                .split('|')
                .map(|f| f.trim().parse().expect("integer field"))
                .collect();
            assert_eq!(
                numbers,
                vec![
                    rec.loss_percent,
                    rec.sent,
                    rec.received,
                    rec.best,
                    rec.avg,
                    rec.worst,
                    rec.last
                ]
            );
        }
    }

    #[test]
    fn text_renders_only_live_rows() {
        let text = render_text(&sample_snapshot());
        // banner + title + head + sep + 2 rows + foot + signature
        assert_eq!(text.lines().count(), 8);
        assert_eq!(text.lines().last(), Some(TEXT_SIGNATURE));
    }

    #[test]
    fn html_rows_round_trip_numeric_fields() {
        let snap = sample_snapshot();
        let html = render_html(&snap);
        let rows: Vec<&str> = html
            .lines()
            .filter(|l| l.starts_with("<tr><td>") && !l.contains("<td>Host</td>"))
            .collect();
        assert_eq!(rows.len(), 2);

        for (row, rec) in rows.iter().zip(snap.live_records()) {
            let cells: Vec<&str> = row
                .split("<td>")
                .skip(1)
                .map(|c| c.split("</td>").next().unwrap_or(""))
                .collect();
            assert_eq!(cells[0], rec.host);
            let numbers: Vec<u32> = cells[1..]
                .iter()
                .map(|c| c.trim().parse().expect("integer cell"))
                .collect();
            assert_eq!(
                numbers,
                vec![
                    rec.loss_percent,
                    rec.sent,
                    rec.received,
                    rec.best,
                    rec.avg,
                    rec.worst,
                    rec.last
                ]
            );
        }
    }

    #[test]
    fn empty_snapshot_still_renders_frames() {
        let snap = Snapshot {
            records: vec![HopRecord::default(); MAX_HOPS],
            captured_at: "2026-01-02T03:04:05Z".into(),
            identity: SessionIdentity::default(),
        };
        let text = render_text(&snap);
        assert!(text.contains("hoptrace statistics"));
        let html = render_html(&snap);
        assert!(html.contains("<table"));
    }
}
