//! XML export and import.
//!
//! ```xml
//! <archive version="1">
//!     <session start="2023-11-14T22:13:20Z" duration="28800" device="42"
//!              epochSeconds="30" channels="1" ingested="2023-11-15T07:00:00Z">
//!         <epoch offset="0" values="12"/>
//!     </session>
//! </archive>
//! ```
//!
//! Epoch values are space-separated samples in their textual form. Export then
//! import reproduces every field.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::io::Write;

use super::{ArchiveEntry, ArchiveError};
use crate::session::{format_timestamp, parse_timestamp, Epoch, Sample, Session};

/// Format version written to the root element
pub const XML_FORMAT_VERSION: &str = "1";

/// Write entries as an XML document
pub fn write_xml<W: Write>(inner: W, entries: &[ArchiveEntry]) -> Result<(), ArchiveError> {
    let mut writer = Writer::new_with_indent(inner, b' ', 4);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("archive");
    root.push_attribute(("version", XML_FORMAT_VERSION));
    writer.write_event(Event::Start(root))?;

    for entry in entries {
        write_session(&mut writer, entry)?;
    }

    writer.write_event(Event::End(BytesEnd::new("archive")))?;

    let mut inner = writer.into_inner();
    inner.write_all(b"\n")?;
    inner.flush()?;
    Ok(())
}

fn write_session<W: Write>(
    writer: &mut Writer<W>,
    entry: &ArchiveEntry,
) -> Result<(), ArchiveError> {
    let session = &entry.session;

    let start = format_timestamp(&session.start());
    let duration = session.duration_secs().to_string();
    let device = session.device_serial().to_string();
    let epoch_secs = session.epoch_secs().to_string();
    let channels = session.channels().to_string();
    let ingested = format_timestamp(&entry.ingested_at);

    let mut elem = BytesStart::new("session");
    elem.push_attribute(("start", start.as_str()));
    elem.push_attribute(("duration", duration.as_str()));
    elem.push_attribute(("device", device.as_str()));
    elem.push_attribute(("epochSeconds", epoch_secs.as_str()));
    elem.push_attribute(("channels", channels.as_str()));
    elem.push_attribute(("ingested", ingested.as_str()));

    if session.epochs().is_empty() {
        writer.write_event(Event::Empty(elem))?;
        return Ok(());
    }

    writer.write_event(Event::Start(elem))?;
    for epoch in session.epochs() {
        let offset = epoch.offset_secs.to_string();
        let values = epoch
            .samples
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        let mut elem = BytesStart::new("epoch");
        elem.push_attribute(("offset", offset.as_str()));
        elem.push_attribute(("values", values.as_str()));
        writer.write_event(Event::Empty(elem))?;
    }
    writer.write_event(Event::End(BytesEnd::new("session")))?;

    Ok(())
}

/// Session being assembled while its epochs are read
struct PendingSession {
    attrs: SessionAttributes,
    epochs: Vec<Epoch>,
}

struct SessionAttributes {
    start: chrono::DateTime<chrono::Utc>,
    duration: u32,
    device: u32,
    epoch_secs: u8,
    channels: u8,
    ingested: chrono::DateTime<chrono::Utc>,
}

/// Parse a document written by [`write_xml`]
pub fn read_xml(xml: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut pending: Option<PendingSession> = None;
    let mut seen_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"archive" => {
                let version = get_attribute(e, "version").unwrap_or_default();
                if version != XML_FORMAT_VERSION {
                    return Err(ArchiveError::InvalidXml(format!(
                        "unsupported archive version '{}'",
                        version
                    )));
                }
                seen_root = true;
            }
            Event::Start(ref e) if e.name().as_ref() == b"session" => {
                pending = Some(PendingSession {
                    attrs: parse_session_attributes(e)?,
                    epochs: Vec::new(),
                });
            }
            Event::Empty(ref e) if e.name().as_ref() == b"session" => {
                let attrs = parse_session_attributes(e)?;
                entries.push(finish_session(attrs, Vec::new())?);
            }
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"epoch" => {
                let session = pending.as_mut().ok_or_else(|| {
                    ArchiveError::InvalidXml("epoch outside of a session".to_string())
                })?;
                session.epochs.push(parse_epoch(e)?);
            }
            Event::End(ref e) if e.name().as_ref() == b"session" => {
                let session = pending.take().ok_or_else(|| {
                    ArchiveError::InvalidXml("unbalanced session element".to_string())
                })?;
                entries.push(finish_session(session.attrs, session.epochs)?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(ArchiveError::InvalidXml("missing archive element".to_string()));
    }
    if pending.is_some() {
        return Err(ArchiveError::InvalidXml("unterminated session".to_string()));
    }
    Ok(entries)
}

fn finish_session(
    attrs: SessionAttributes,
    epochs: Vec<Epoch>,
) -> Result<ArchiveEntry, ArchiveError> {
    let session = Session::new(
        attrs.start,
        attrs.duration,
        attrs.device,
        attrs.epoch_secs,
        attrs.channels,
        epochs,
    );
    session.validate().map_err(|e| {
        ArchiveError::InvalidXml(format!("session starting {}: {}", format_timestamp(&attrs.start), e))
    })?;
    if attrs.ingested.timestamp_subsec_nanos() != 0 {
        return Err(ArchiveError::InvalidXml(format!(
            "session starting {}: ingestion time has a fractional second",
            format_timestamp(&attrs.start)
        )));
    }

    Ok(ArchiveEntry {
        session,
        ingested_at: attrs.ingested,
    })
}

fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            return Some(String::from_utf8_lossy(&attr.value).to_string());
        }
    }
    None
}

fn required<T: std::str::FromStr>(e: &BytesStart, name: &str) -> Result<T, ArchiveError> {
    let raw = get_attribute(e, name).ok_or_else(|| {
        ArchiveError::InvalidXml(format!(
            "<{}> is missing '{}'",
            String::from_utf8_lossy(e.name().as_ref()),
            name
        ))
    })?;
    raw.parse()
        .map_err(|_| ArchiveError::InvalidXml(format!("invalid value for {}: '{}'", name, raw)))
}

fn required_timestamp(
    e: &BytesStart,
    name: &str,
) -> Result<chrono::DateTime<chrono::Utc>, ArchiveError> {
    let raw: String = required(e, name)?;
    parse_timestamp(&raw)
        .map_err(|_| ArchiveError::InvalidXml(format!("invalid timestamp for {}: '{}'", name, raw)))
}

fn parse_session_attributes(e: &BytesStart) -> Result<SessionAttributes, ArchiveError> {
    Ok(SessionAttributes {
        start: required_timestamp(e, "start")?,
        duration: required(e, "duration")?,
        device: required(e, "device")?,
        epoch_secs: required(e, "epochSeconds")?,
        channels: required(e, "channels")?,
        ingested: required_timestamp(e, "ingested")?,
    })
}

fn parse_epoch(e: &BytesStart) -> Result<Epoch, ArchiveError> {
    let offset_secs = required(e, "offset")?;
    let values: String = required(e, "values")?;
    let samples = values
        .split_whitespace()
        .map(|token| token.parse::<Sample>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ArchiveError::InvalidXml(err.to_string()))?;
    Ok(Epoch {
        offset_secs,
        samples,
    })
}
