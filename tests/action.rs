mod support;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;

use brainprep::action::{Action, DataAction};
use brainprep::digest::{DigestAlgorithm, ExpectedDigests, bytes_digest};
use brainprep::domain::ExistencePolicy;
use brainprep::download::Downloader;
use brainprep::error::PrepError;
use brainprep::producers::{Bytes, Gunzip, JsonDocument, spliced, with_path, write_with};
use brainprep::status::{ChecksumState, Status, StatusEvent};
use brainprep::store::{SidecarPaths, file_mtime, same_instant, set_mtime};

use support::{MockTransport, payload, statuses, temp_root};

fn collect(action: Action) -> Vec<StatusEvent> {
    action.collect::<Result<Vec<_>, _>>().unwrap()
}

fn acquired_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2006-02-14T09:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[test]
fn gunzip_reports_progress_and_inherits_mtime() {
    let (_temp, root) = temp_root();
    let image = payload(300_000);
    let source = root.join("IXI002-Guys-0828-T1.nii.gz");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&image).unwrap();
    std::fs::write(source.as_std_path(), encoder.finish().unwrap()).unwrap();
    set_mtime(&source, acquired_at()).unwrap();

    let dst = root.join("sub-IXI002/anat/sub-IXI002_T1w.nii");
    let events = collect(
        Action::new(dst.clone(), Gunzip::with_chunk_size(64 * 1024)).with_sources([source]),
    );

    let progress: Vec<u64> = events.iter().filter_map(|event| event.done).collect();
    assert!(progress.len() > 1);
    assert_eq!(progress.last(), Some(&(image.len() as u64)));
    assert_eq!(statuses(&events), vec![Status::SettingMtime, Status::Done]);
    assert_eq!(std::fs::read(dst.as_std_path()).unwrap(), image);
    assert!(same_instant(file_mtime(&dst).unwrap(), acquired_at()));
}

#[test]
fn declared_digest_is_checked() {
    let (_temp, root) = temp_root();
    let content = br#"{"Name": "IXI"}"#.to_vec();
    let digests =
        ExpectedDigests::from_pairs([("md5", bytes_digest(&content, DigestAlgorithm::Md5))])
            .unwrap();

    let events = collect(
        Action::new(root.join("dataset_description.json"), Bytes::new(content))
            .with_digests(digests),
    );
    assert_eq!(events[0].checksum, Some(ChecksumState::Ok));

    let wrong = ExpectedDigests::from_pairs([("md5", bytes_digest(b"{}", DigestAlgorithm::Md5))])
        .unwrap();
    let events = collect(
        Action::new(root.join("other.json"), Bytes::new(b"[]".to_vec()))
            .with_digests(wrong),
    );
    assert_eq!(statuses(&events), vec![Status::Error]);
    assert_eq!(events[0].checksum, Some(ChecksumState::Differs));
}

#[test]
fn existing_output_follows_policy() {
    let (_temp, root) = temp_root();
    let dst = root.join("participants.json");
    std::fs::write(dst.as_std_path(), b"old").unwrap();

    let events = collect(
        Action::new(dst.clone(), Bytes::new(b"new".to_vec())).with_policy(ExistencePolicy::Skip),
    );
    assert_eq!(statuses(&events), vec![Status::Skipped]);
    assert_eq!(std::fs::read(dst.as_std_path()).unwrap(), b"old");

    let mut action = Action::new(dst.clone(), Bytes::new(b"new".to_vec()))
        .with_policy(ExistencePolicy::ErrorIfPresent);
    assert_matches!(action.next(), Some(Err(PrepError::AlreadyExists(_))));

    Action::new(dst.clone(), Bytes::new(b"new".to_vec()))
        .with_policy(ExistencePolicy::Overwrite)
        .run()
        .unwrap();
    assert_eq!(std::fs::read(dst.as_std_path()).unwrap(), b"new");
}

#[test]
fn json_sidecar_is_pretty_printed() {
    let (_temp, root) = temp_root();
    let dst = root.join("sub-IXI002_T1w.json");
    let sidecar = serde_json::json!({"MagneticFieldStrength": 1.5, "Manufacturer": "Philips"});

    Action::new(dst.clone(), JsonDocument::new(&sidecar).unwrap())
        .run()
        .unwrap();

    let text = std::fs::read_to_string(dst.as_std_path()).unwrap();
    assert!(text.contains("\n  \"MagneticFieldStrength\": 1.5"));
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, sidecar);
}

#[test]
fn path_producer_writes_the_partial_file() {
    let (_temp, root) = temp_root();
    let source = root.join("IXI.xls");
    std::fs::write(source.as_std_path(), b"IXI_ID\tAGE\n2\t35.8\n").unwrap();
    let dst = root.join("participants.tsv");
    let partial = SidecarPaths::for_destination(&dst).partial;

    let expected_partial = partial.clone();
    let producer = with_path(move |path, sources| {
        assert_eq!(path, expected_partial.as_path());
        std::fs::copy(sources[0].as_std_path(), path.as_std_path())
            .map_err(|err| PrepError::Producer(err.to_string()))?;
        Ok(())
    });
    Action::new(dst.clone(), producer)
        .with_sources([source])
        .run()
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(dst.as_std_path()).unwrap(),
        "IXI_ID\tAGE\n2\t35.8\n"
    );
    assert!(!partial.exists());
}

#[test]
fn producer_failure_is_an_error_row() {
    let (_temp, root) = temp_root();
    let dst = root.join("derived.nii");
    let producer = write_with(|_, _| Err(PrepError::Producer("scanner offline".to_string())));

    let events = collect(Action::new(dst.clone(), producer));

    assert_eq!(statuses(&events), vec![Status::Error]);
    assert!(events[0].message.as_deref().unwrap().contains("scanner offline"));
    assert!(!dst.exists());
}

#[test]
fn spliced_download_forwards_nested_events() {
    let (_temp, root) = temp_root();
    let body = payload(4096);
    let transport = Arc::new(MockTransport::new().file("/IXI/IXI-PD.tar", body.clone()));
    let dst = root.join("IXI-PD.tar");

    let nested = Arc::clone(&transport);
    let producer = spliced(move |path, _sources| {
        Downloader::new("https://data.example.org/IXI/IXI-PD.tar", Some(path.as_path()))
            .unwrap()
            .with_transport(nested)
            .with_policy(ExistencePolicy::Overwrite)
            .with_chunk_size(1024)
            .with_backoff(Duration::ZERO)
    });
    let events = collect(Action::new(dst.clone(), producer));

    let progress: Vec<u64> = events.iter().filter_map(|event| event.done).collect();
    assert_eq!(progress, vec![1024, 2048, 3072, 4096]);
    // The nested terminal statuses belong to the inner download only.
    assert_eq!(statuses(&events), vec![Status::SettingMtime, Status::Done]);
    assert_eq!(std::fs::read(dst.as_std_path()).unwrap(), body);
}

#[test]
fn nested_error_ends_the_action() {
    let (_temp, root) = temp_root();
    let dst = root.join("IXI-MRA.tar");
    let producer = spliced(|_path, _sources| vec![Ok(StatusEvent::error("mirror unavailable"))]);

    let events = collect(Action::new(dst.clone(), producer));

    assert_eq!(statuses(&events), vec![Status::Error]);
    assert!(!dst.exists());
}
