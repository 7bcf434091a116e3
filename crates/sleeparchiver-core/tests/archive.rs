use pretty_assertions::assert_eq;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::thread;
use tempfile::tempdir;

use sleeparchiver_core::archive::{
    Archive, ArchiveError, IngestOutcome, SharedArchive, JOURNAL_FILE_NAME,
};
use sleeparchiver_core::session::{decode, Session, SessionBlockBuilder};

fn session(start: u32, serial: u32) -> Session {
    decode(
        &SessionBlockBuilder::new(start, 3_600, serial)
            .channels(2)
            .repeat_epoch(120, &[20, 0xFF])
            .build(),
    )
    .unwrap()
}

#[test]
fn test_ingest_twice_keeps_one_entry() {
    let dir = tempdir().unwrap();
    let mut archive = Archive::open(dir.path().join(JOURNAL_FILE_NAME)).unwrap();

    assert_eq!(archive.ingest(session(1_700_000_000, 1)).unwrap(), IngestOutcome::Inserted);
    assert_eq!(archive.ingest(session(1_700_000_000, 1)).unwrap(), IngestOutcome::Duplicate);
    assert_eq!(archive.len(), 1);
}

#[test]
fn test_reopen_replays_journal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE_NAME);

    let original = {
        let mut archive = Archive::open(&path).unwrap();
        archive.ingest(session(1_700_000_000, 1)).unwrap();
        archive.ingest(session(1_700_090_000, 1)).unwrap();
        archive.entries().to_vec()
    };

    let mut reopened = Archive::open(&path).unwrap();
    assert_eq!(reopened.entries(), original.as_slice());
    assert_eq!(
        reopened.ingest(session(1_700_000_000, 1)).unwrap(),
        IngestOutcome::Duplicate
    );
}

#[test]
fn test_torn_tail_is_discarded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE_NAME);

    {
        let mut archive = Archive::open(&path).unwrap();
        archive.ingest(session(1_700_000_000, 1)).unwrap();
    }
    let intact_len = fs::metadata(&path).unwrap().len();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"session":{"start":"2023-"#).unwrap();
    drop(file);

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

    archive.ingest(session(1_700_090_000, 1)).unwrap();
    drop(archive);
    assert_eq!(Archive::open(&path).unwrap().len(), 2);
}

#[test]
fn test_corrupt_record_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE_NAME);
    fs::write(&path, "not json\n").unwrap();

    assert!(matches!(
        Archive::open(&path),
        Err(ArchiveError::Journal { line: 1, .. })
    ));
}

#[test]
fn test_exports_are_idempotent() {
    let dir = tempdir().unwrap();
    let mut archive = Archive::open(dir.path().join(JOURNAL_FILE_NAME)).unwrap();
    archive.ingest(session(1_700_000_000, 1)).unwrap();
    archive.ingest(session(1_700_090_000, 2)).unwrap();

    let csv = dir.path().join("export.csv");
    let xml = dir.path().join("export.xml");

    archive.export_csv(&csv).unwrap();
    archive.export_xml(&xml).unwrap();
    let (csv_first, xml_first) = (fs::read(&csv).unwrap(), fs::read(&xml).unwrap());

    archive.export_csv(&csv).unwrap();
    archive.export_xml(&xml).unwrap();
    assert_eq!(fs::read(&csv).unwrap(), csv_first);
    assert_eq!(fs::read(&xml).unwrap(), xml_first);

    // header plus 120 rows per session
    let text = String::from_utf8(csv_first).unwrap();
    assert_eq!(text.lines().count(), 1 + 240);
}

#[test]
fn test_xml_export_imports_into_fresh_archive() {
    let dir = tempdir().unwrap();
    let mut source = Archive::open(dir.path().join("a.jsonl")).unwrap();
    source.ingest(session(1_700_000_000, 1)).unwrap();
    source.ingest(session(1_700_090_000, 2)).unwrap();

    let xml = dir.path().join("merge.xml");
    source.export_xml(&xml).unwrap();

    let mut target = Archive::open(dir.path().join("b.jsonl")).unwrap();
    target.ingest(session(1_700_090_000, 2)).unwrap();

    let report = target.import_xml(&xml).unwrap();
    assert_eq!((report.inserted, report.duplicate), (1, 1));

    let imported = target.get(&session(1_700_000_000, 1).id()).unwrap();
    assert_eq!(imported, &source.entries()[0]);
}

#[test]
fn test_csv_export_imports_into_fresh_archive() {
    let dir = tempdir().unwrap();
    let mut source = Archive::open(dir.path().join("a.jsonl")).unwrap();
    source.ingest(session(1_700_000_000, 1)).unwrap();
    source.ingest(session(1_700_090_000, 2)).unwrap();

    let csv = dir.path().join("merge.csv");
    source.export_csv(&csv).unwrap();

    let mut target = Archive::open(dir.path().join("b.jsonl")).unwrap();
    target.ingest(session(1_700_090_000, 2)).unwrap();

    let report = target.import_csv(&csv).unwrap();
    assert_eq!((report.inserted, report.duplicate), (1, 1));

    let imported = target.get(&session(1_700_000_000, 1).id()).unwrap();
    assert_eq!(imported.session, session(1_700_000_000, 1));

    // Importing the same file again changes nothing
    let again = target.import_csv(&csv).unwrap();
    assert_eq!((again.inserted, again.duplicate), (0, 2));
    assert_eq!(target.len(), 2);
}

#[test]
fn test_invalid_csv_imports_nothing() {
    let dir = tempdir().unwrap();
    let mut source = Archive::open(dir.path().join("a.jsonl")).unwrap();
    source.ingest(session(1_700_000_000, 1)).unwrap();

    let csv = dir.path().join("broken.csv");
    source.export_csv(&csv).unwrap();
    let text = fs::read_to_string(&csv).unwrap().replace(",30,5,150,", ",30,5,151,");
    fs::write(&csv, text).unwrap();

    let mut target = Archive::open(dir.path().join("b.jsonl")).unwrap();
    assert!(matches!(
        target.import_csv(&csv),
        Err(ArchiveError::InvalidCsv { .. })
    ));
    assert!(target.is_empty());
}

#[test]
fn test_concurrent_ingest() {
    let dir = tempdir().unwrap();
    let shared = SharedArchive::new(Archive::open(dir.path().join(JOURNAL_FILE_NAME)).unwrap());

    let handles: Vec<_> = [1_700_000_000u32, 1_700_090_000]
        .into_iter()
        .map(|start| {
            let shared = shared.clone();
            thread::spawn(move || shared.ingest(session(start, 7)).unwrap())
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), IngestOutcome::Inserted);
    }

    assert_eq!(shared.len(), 2);
    let archive = shared.read();
    assert!(archive.contains(&session(1_700_000_000, 7).id()));
    assert!(archive.contains(&session(1_700_090_000, 7).id()));
}

#[test]
fn test_concurrent_exports_to_one_destination() {
    let dir = tempdir().unwrap();
    let shared = SharedArchive::new(Archive::open(dir.path().join(JOURNAL_FILE_NAME)).unwrap());
    shared.ingest(session(1_700_000_000, 3)).unwrap();
    shared.ingest(session(1_700_090_000, 3)).unwrap();

    let expected = dir.path().join("reference.csv");
    shared.export_csv(&expected).unwrap();
    let dest = dir.path().join("shared.csv");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            let dest = dest.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    shared.export_csv(&dest).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fs::read(&dest).unwrap(), fs::read(&expected).unwrap());
    // journal, reference and destination only: no temporary files left behind
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
}
