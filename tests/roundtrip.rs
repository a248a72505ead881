use std::fs;

use nestpack::{
    FormatId, InterruptFlag, ObfuscateOptions, Obfuscator, UnpackOptions, Unpacker,
};

/// The external tools these tests drive.  Hosts without them skip.
fn tools_present(tools: &[&str]) -> bool {
    tools.iter().all(|t| which::which(t).is_ok())
}

fn pack(opts: ObfuscateOptions) -> Obfuscator {
    Obfuscator::new(InterruptFlag::new(), opts)
}

fn unpack(opts: UnpackOptions) -> Unpacker {
    Unpacker::new(InterruptFlag::new(), opts)
}

#[test]
fn test_single_file_roundtrip() {
    if !tools_present(&["gzip", "gunzip"]) {
        return;
    }
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();

    let input = work.path().join("report.txt");
    fs::write(&input, b"0123456789").unwrap();

    let report = pack(ObfuscateOptions {
        rounds: 5,
        formats: Some(vec![FormatId::Gzip]),
        ..ObfuscateOptions::default()
    })
    .run(&[input.clone()], out.path())
    .unwrap();
    assert_eq!(report.rounds, 5);
    assert_eq!(report.distinct_formats(), vec![FormatId::Gzip]);
    assert!(report.archive.is_file());
    // the original is untouched
    assert_eq!(fs::read(&input).unwrap(), b"0123456789");

    let report = unpack(UnpackOptions::default())
        .run(&report.archive, rec.path())
        .unwrap();
    assert_eq!(report.rounds, 5);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].name, "report.txt");
    assert_eq!(fs::read(rec.path().join("report.txt")).unwrap(), b"0123456789");
    assert!(report.hidden.is_none());
}

#[test]
fn test_multi_file_roundtrip() {
    if !tools_present(&["tar", "gzip", "gunzip"]) {
        return;
    }
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();

    let files: Vec<(&str, &[u8])> = vec![
        ("alpha.txt", b"Alpha file contents"),
        ("beta.bin", b"\x00\x01\x02 beta bytes"),
    ];
    let mut inputs = Vec::new();
    for (name, data) in &files {
        let path = work.path().join(name);
        fs::write(&path, data).unwrap();
        inputs.push(path);
    }

    let report = pack(ObfuscateOptions {
        rounds: 4,
        formats: Some(vec![FormatId::Tar, FormatId::Gzip]),
        ..ObfuscateOptions::default()
    })
    .run(&inputs, out.path())
    .unwrap();
    assert_eq!(report.rounds, 4);

    let report = unpack(UnpackOptions::default())
        .run(&report.archive, rec.path())
        .unwrap();
    assert_eq!(report.rounds, 4);
    assert_eq!(report.files.len(), 2);
    for (name, data) in &files {
        assert!(report.file(name).is_some(), "missing {name}");
        assert_eq!(fs::read(rec.path().join(name)).unwrap(), *data);
    }
}

#[test]
fn test_hidden_payload_roundtrip() {
    if !tools_present(&["tar", "gzip", "gunzip"]) {
        return;
    }
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();

    let input = work.path().join("cover.txt");
    fs::write(&input, b"nothing to see here").unwrap();

    let report = pack(ObfuscateOptions {
        rounds: 6,
        payload: Some(b"s3cr3t".to_vec()),
        chunks: 2,
        formats: Some(vec![FormatId::Tar, FormatId::Gzip]),
        ..ObfuscateOptions::default()
    })
    .run(&[input], out.path())
    .unwrap();
    assert_eq!(report.rounds, 6);

    let report = unpack(UnpackOptions::default())
        .run(&report.archive, rec.path())
        .unwrap();
    assert_eq!(report.rounds, 6);
    assert_eq!(report.hidden, Some(b"s3cr3t".to_vec()));
    assert_eq!(report.files.len(), 1);
    assert_eq!(
        fs::read(rec.path().join("cover.txt")).unwrap(),
        b"nothing to see here"
    );
}

#[test]
fn test_hidden_payload_survives_a_single_round() {
    if !tools_present(&["tar"]) {
        return;
    }
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();

    let input = work.path().join("cover.txt");
    fs::write(&input, b"cover story").unwrap();

    let report = pack(ObfuscateOptions {
        rounds: 1,
        payload: Some(b"P".to_vec()),
        chunks: 1,
        formats: Some(vec![FormatId::Tar]),
        ..ObfuscateOptions::default()
    })
    .run(&[input], out.path())
    .unwrap();
    assert_eq!(report.rounds, 1);

    let report = unpack(UnpackOptions::default())
        .run(&report.archive, rec.path())
        .unwrap();
    assert_eq!(report.rounds, 1);
    assert_eq!(report.hidden, Some(b"P".to_vec()));
    assert_eq!(fs::read(rec.path().join("cover.txt")).unwrap(), b"cover story");
}

#[test]
fn test_verified_pack_roundtrip() {
    if !tools_present(&["gzip", "gunzip"]) {
        return;
    }
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();

    let input = work.path().join("report.txt");
    fs::write(&input, b"verified content").unwrap();

    let report = pack(ObfuscateOptions {
        rounds: 3,
        verify: true,
        formats: Some(vec![FormatId::Gzip]),
        ..ObfuscateOptions::default()
    })
    .run(&[input], out.path())
    .unwrap();
    assert_eq!(report.rounds, 3);

    let report = unpack(UnpackOptions::default())
        .run(&report.archive, rec.path())
        .unwrap();
    assert_eq!(
        fs::read(rec.path().join("report.txt")).unwrap(),
        b"verified content"
    );
    assert_eq!(report.rounds, 3);
}

#[test]
fn test_reversed_artifact_roundtrip() {
    if !tools_present(&["gzip", "gunzip"]) {
        return;
    }
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();

    let input = work.path().join("report.txt");
    fs::write(&input, b"mirror mirror").unwrap();

    let report = pack(ObfuscateOptions {
        rounds: 2,
        reverse: true,
        formats: Some(vec![FormatId::Gzip]),
        ..ObfuscateOptions::default()
    })
    .run(&[input], out.path())
    .unwrap();

    // without the fallback the reversed bytes come back verbatim
    let plain = unpack(UnpackOptions::default())
        .run(&report.archive, rec.path())
        .unwrap();
    assert_eq!(plain.rounds, 0);
    fs::remove_file(rec.path().join(&plain.files[0].name)).unwrap();

    let report = unpack(UnpackOptions {
        try_reverse: true,
        ..UnpackOptions::default()
    })
    .run(&report.archive, rec.path())
    .unwrap();
    assert_eq!(report.rounds, 2);
    assert_eq!(
        fs::read(rec.path().join("report.txt")).unwrap(),
        b"mirror mirror"
    );
}

#[test]
fn test_unrecognised_input_round_trips_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let rec = tempfile::tempdir().unwrap();
    let input = dir.path().join("blob.bin");
    fs::write(&input, b"\x00\xffnot an archive at all").unwrap();

    let report = unpack(UnpackOptions::default())
        .run(&input, rec.path())
        .unwrap();
    assert_eq!(report.rounds, 0);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].name, "blob.bin");
    assert_eq!(
        fs::read(rec.path().join("blob.bin")).unwrap(),
        b"\x00\xffnot an archive at all"
    );
}
