//! CSV export and import
//!
//! One row per epoch, in archive order. The header is fixed: channel columns
//! always run to the maximum channel count, and channels a session did not
//! record are left empty.
//!
//! Reading a file back regroups consecutive rows into sessions by their epoch
//! index. Ingestion times are not carried, and a session without epochs has no
//! rows at all.

use std::io::{self, Write};

use super::{ArchiveEntry, ArchiveError};
use crate::session::{format_timestamp, parse_timestamp, Epoch, Sample, Session, MAX_CHANNELS};

/// Columns preceding the channel columns
const LEADING_COLUMNS: [&str; 6] = [
    "session_start",
    "duration_secs",
    "device_serial",
    "epoch_secs",
    "epoch_index",
    "offset_secs",
];

fn header() -> String {
    let mut header = LEADING_COLUMNS.join(",");
    for channel in 1..=MAX_CHANNELS {
        header.push_str(&format!(",channel_{}", channel));
    }
    header
}

/// Write entries as CSV
pub fn write_csv<W: Write>(writer: &mut W, entries: &[ArchiveEntry]) -> io::Result<()> {
    writeln!(writer, "{}", header())?;

    for entry in entries {
        let session = &entry.session;
        let start = format_timestamp(&session.start());

        for (index, epoch) in session.epochs().iter().enumerate() {
            write!(
                writer,
                "{},{},{},{},{},{}",
                start,
                session.duration_secs(),
                session.device_serial(),
                session.epoch_secs(),
                index,
                epoch.offset_secs
            )?;
            for channel in 0..MAX_CHANNELS {
                match epoch.samples.get(channel) {
                    Some(sample) => write!(writer, ",{}", sample)?,
                    None => write!(writer, ",")?,
                }
            }
            writeln!(writer)?;
        }
    }

    writer.flush()
}

/// Fields of one data row
struct Row {
    start: chrono::DateTime<chrono::Utc>,
    duration: u32,
    device: u32,
    epoch_secs: u8,
    index: usize,
    epoch: Epoch,
}

impl Row {
    fn same_session(&self, session: &PendingSession) -> bool {
        self.start == session.start
            && self.duration == session.duration
            && self.device == session.device
            && self.epoch_secs == session.epoch_secs
    }
}

struct PendingSession {
    start: chrono::DateTime<chrono::Utc>,
    duration: u32,
    device: u32,
    epoch_secs: u8,
    /// Line of the session's first row
    line: usize,
    epochs: Vec<Epoch>,
}

impl PendingSession {
    fn finish(self) -> Result<Session, ArchiveError> {
        let channels = self.epochs.first().map_or(0, |e| e.samples.len()) as u8;
        let session = Session::new(
            self.start,
            self.duration,
            self.device,
            self.epoch_secs,
            channels,
            self.epochs,
        );
        session.validate().map_err(|e| ArchiveError::InvalidCsv {
            line: self.line,
            reason: e.to_string(),
        })?;
        Ok(session)
    }
}

/// Parse a document written by [`write_csv`] back into sessions
pub fn read_csv(text: &str) -> Result<Vec<Session>, ArchiveError> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    match lines.next() {
        Some((_, first)) if first == header() => {}
        _ => {
            return Err(ArchiveError::InvalidCsv {
                line: 1,
                reason: "unexpected header".to_string(),
            })
        }
    }

    let mut sessions = Vec::new();
    let mut pending: Option<PendingSession> = None;

    for (line, raw) in lines {
        if raw.is_empty() {
            continue;
        }
        let row = parse_row(raw).map_err(|reason| ArchiveError::InvalidCsv { line, reason })?;

        if row.index == 0 {
            if let Some(done) = pending.take() {
                sessions.push(done.finish()?);
            }
            pending = Some(PendingSession {
                start: row.start,
                duration: row.duration,
                device: row.device,
                epoch_secs: row.epoch_secs,
                line,
                epochs: vec![row.epoch],
            });
            continue;
        }

        let continues = pending
            .as_ref()
            .is_some_and(|s| row.same_session(s) && row.index == s.epochs.len());
        match pending.as_mut() {
            Some(session) if continues => session.epochs.push(row.epoch),
            _ => {
                return Err(ArchiveError::InvalidCsv {
                    line,
                    reason: format!("epoch {} does not continue a session", row.index),
                })
            }
        }
    }

    if let Some(done) = pending {
        sessions.push(done.finish()?);
    }
    Ok(sessions)
}

fn parse_row(raw: &str) -> Result<Row, String> {
    let fields: Vec<&str> = raw.split(',').collect();
    let expected = LEADING_COLUMNS.len() + MAX_CHANNELS;
    if fields.len() != expected {
        return Err(format!("{} fields, expected {}", fields.len(), expected));
    }

    fn number<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, String> {
        field
            .parse()
            .map_err(|_| format!("invalid {}: '{}'", name, field))
    }

    let start = parse_timestamp(fields[0])
        .map_err(|_| format!("invalid session_start: '{}'", fields[0]))?;

    let cells = &fields[LEADING_COLUMNS.len()..];
    let recorded = cells.iter().take_while(|c| !c.is_empty()).count();
    if cells[recorded..].iter().any(|c| !c.is_empty()) {
        return Err("gap between channel values".to_string());
    }
    let samples = cells[..recorded]
        .iter()
        .map(|c| c.parse::<Sample>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Row {
        start,
        duration: number(fields[1], "duration_secs")?,
        device: number(fields[2], "device_serial")?,
        epoch_secs: number(fields[3], "epoch_secs")?,
        index: number(fields[4], "epoch_index")?,
        epoch: Epoch {
            offset_secs: number(fields[5], "offset_secs")?,
            samples,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{decode, SessionBlockBuilder};
    use chrono::DateTime;

    fn entry(session: Session) -> ArchiveEntry {
        ArchiveEntry {
            session,
            ingested_at: DateTime::from_timestamp(1_700_100_000, 0).unwrap(),
        }
    }

    fn two_channel_night() -> Session {
        decode(
            &SessionBlockBuilder::new(1_700_000_000, 60, 42)
                .channels(2)
                .epoch(&[10, 0xFF])
                .epoch(&[120, 0])
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_csv_rows() {
        let mut out = Vec::new();
        write_csv(&mut out, &[entry(two_channel_night())]).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "session_start,duration_secs,device_serial,epoch_secs,epoch_index,offset_secs,channel_1,channel_2,channel_3,channel_4\n\
             2023-11-14T22:13:20Z,60,42,30,0,0,10,NA,,\n\
             2023-11-14T22:13:20Z,60,42,30,1,30,ERR:120,0,,\n"
        );
    }

    #[test]
    fn test_csv_header_for_empty_archive() {
        let mut out = Vec::new();
        write_csv(&mut out, &[]).unwrap();
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_csv_reads_back_sessions() {
        let single = decode(
            &SessionBlockBuilder::new(1_700_090_000, 45, 7)
                .epoch_secs(15)
                .epoch(&[3])
                .build(),
        )
        .unwrap();
        let sessions = vec![two_channel_night(), single];

        let mut out = Vec::new();
        write_csv(&mut out, &sessions.iter().cloned().map(entry).collect::<Vec<_>>()).unwrap();

        assert_eq!(read_csv(std::str::from_utf8(&out).unwrap()).unwrap(), sessions);
    }

    fn csv_with(rows: &[&str]) -> String {
        let mut text = header();
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text
    }

    fn rejected_line(rows: &[&str]) -> Option<usize> {
        match read_csv(&csv_with(rows)) {
            Err(ArchiveError::InvalidCsv { line, .. }) => Some(line),
            _ => None,
        }
    }

    #[test]
    fn test_csv_rejects_foreign_header() {
        assert!(matches!(
            read_csv("start,duration\n"),
            Err(ArchiveError::InvalidCsv { line: 1, .. })
        ));
    }

    #[test]
    fn test_csv_rejects_orphan_and_skipped_epochs() {
        assert_eq!(
            rejected_line(&["2023-11-14T22:13:20Z,60,42,30,1,30,1,,,"]),
            Some(2)
        );
        assert_eq!(
            rejected_line(&[
                "2023-11-14T22:13:20Z,60,42,30,0,0,1,,,",
                "2023-11-14T22:13:20Z,60,42,30,2,60,1,,,",
            ]),
            Some(3)
        );
    }

    #[test]
    fn test_csv_rejects_invalid_sessions() {
        // channel gap
        assert_eq!(rejected_line(&["2023-11-14T22:13:20Z,60,42,30,0,0,1,,2,"]), Some(2));
        // offset not a multiple of the epoch length
        assert_eq!(
            rejected_line(&[
                "2023-11-14T22:13:20Z,60,42,30,0,0,1,,,",
                "2023-11-14T22:13:20Z,60,42,30,1,31,1,,,",
            ]),
            Some(2)
        );
        // width changes mid-session
        assert_eq!(
            rejected_line(&[
                "2023-11-14T22:13:20Z,60,42,30,0,0,1,2,,",
                "2023-11-14T22:13:20Z,60,42,30,1,30,1,,,",
            ]),
            Some(2)
        );
        // start before 2000
        assert_eq!(rejected_line(&["1970-01-01T00:00:05Z,60,42,30,0,0,1,,,"]), Some(2));
        // zero epoch length
        assert_eq!(rejected_line(&["2023-11-14T22:13:20Z,60,42,0,0,0,1,,,"]), Some(2));
    }
}
