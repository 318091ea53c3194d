mod common;

use proptest::prelude::*;
use std::sync::Arc;

use common::{encode_interleaved, Capture};
use xbstream::chunk::{self, ChunkHeader, CHUNK_MAGIC, FLAG_IGNORABLE};
use xbstream::datasink::ErrorCategory;
use xbstream::{ExtractOptions, Extractor, SinkError, StreamError};

fn extract_to_capture(bytes: &[u8], threads: usize) -> (Capture, Result<xbstream::ExtractSummary, SinkError>) {
    let capture = Capture::default();
    let opts = ExtractOptions { threads, ..Default::default() };
    let res = Extractor::with_target(Arc::new(capture.clone()), opts).extract(bytes);
    (capture, res)
}

fn payload_chunk(out: &mut Vec<u8>, path: &str, offset: u64, data: &[u8]) {
    ChunkHeader::payload(path, offset, data).write(&mut *out).unwrap();
    out.extend_from_slice(data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn interleaved_files_extract_intact(
        contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..1500), 1..6),
        chunk_size in 1usize..400,
        piece in 1usize..300,
        threads in 1usize..5,
    ) {
        let files: Vec<(String, Vec<u8>)> = contents
            .into_iter()
            .enumerate()
            .map(|(i, data)| (format!("dir{}/file{i}", i % 2), data))
            .collect();
        let stream = encode_interleaved(&files, chunk_size, piece);

        let (capture, res) = extract_to_capture(&stream, threads);
        let summary = res.unwrap();
        prop_assert_eq!(summary.files, files.len() as u64);
        prop_assert_eq!(summary.bytes, files.iter().map(|(_, d)| d.len() as u64).sum::<u64>());
        for (name, data) in &files {
            let got = capture.get(name);
            prop_assert_eq!(got.as_ref(), Some(data));
        }
    }

    #[test]
    fn any_flipped_payload_bit_is_caught(
        data in prop::collection::vec(any::<u8>(), 1..256),
        at in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut stream = Vec::new();
        payload_chunk(&mut stream, "f", 0, &data);
        chunk::write_eof(&mut stream, "f").unwrap();

        // magic, flags, type, path length, "f", length, offset, checksum
        let payload_start = 8 + 1 + 1 + 4 + 1 + 8 + 8 + 4;
        stream[payload_start + at.index(data.len())] ^= 1 << bit;

        let (_, res) = extract_to_capture(&stream, 2);
        let err = res.unwrap_err();
        let is_checksum_mismatch =
            matches!(err, SinkError::Stream(StreamError::ChecksumMismatch { .. }));
        prop_assert!(is_checksum_mismatch);
        prop_assert_eq!(err.category(), ErrorCategory::Format);
    }
}

#[test]
fn test_out_of_order_chunk_is_rejected() {
    let mut stream = Vec::new();
    payload_chunk(&mut stream, "f", 0, &[7u8; 50]);
    payload_chunk(&mut stream, "f", 100, &[8u8; 10]);
    chunk::write_eof(&mut stream, "f").unwrap();

    let (capture, res) = extract_to_capture(&stream, 1);
    match res {
        Err(SinkError::Stream(StreamError::OutOfOrder { path, expected, actual })) => {
            assert_eq!(path, "f");
            assert_eq!(expected, 50);
            assert_eq!(actual, 100);
        }
        other => panic!("expected out-of-order error, got {other:?}"),
    }
    // The chunk before the gap was already applied.
    assert_eq!(capture.get("f").unwrap().len(), 50);
}

#[test]
fn test_ignorable_unknown_chunk_is_skipped() {
    let mut stream = Vec::new();
    payload_chunk(&mut stream, "a", 0, b"hello");

    stream.extend_from_slice(CHUNK_MAGIC);
    stream.push(FLAG_IGNORABLE);
    stream.push(b'Z');
    stream.extend_from_slice(&1u32.to_be_bytes());
    stream.push(b'a');
    stream.extend_from_slice(&3u64.to_be_bytes());
    stream.extend_from_slice(&0u64.to_be_bytes());
    stream.extend_from_slice(&crc32fast::hash(b"???").to_be_bytes());
    stream.extend_from_slice(b"???");

    chunk::write_eof(&mut stream, "a").unwrap();

    let (capture, res) = extract_to_capture(&stream, 1);
    let summary = res.unwrap();
    assert_eq!(summary.files, 1);
    assert_eq!(capture.get("a").unwrap(), b"hello");
}

#[test]
fn test_mandatory_unknown_chunk_fails() {
    let mut stream = Vec::new();
    stream.extend_from_slice(CHUNK_MAGIC);
    stream.push(0);
    stream.push(b'Z');
    stream.extend_from_slice(&1u32.to_be_bytes());
    stream.push(b'a');

    let (_, res) = extract_to_capture(&stream, 1);
    let err = res.unwrap_err();
    assert!(matches!(err, SinkError::Stream(StreamError::UnknownChunkType { code: b'Z', .. })));
    assert_eq!(err.category(), ErrorCategory::Format);
}

#[test]
fn test_absolute_path_is_rejected_unless_allowed() {
    let files = vec![("/etc/passwd".to_string(), b"root".to_vec())];
    let stream = encode_interleaved(&files, 64, 64);

    let (_, res) = extract_to_capture(&stream, 1);
    assert!(matches!(res, Err(SinkError::Stream(StreamError::AbsolutePath(ref p))) if p == "/etc/passwd"));

    let capture = Capture::default();
    let opts = ExtractOptions { absolute_names: true, ..Default::default() };
    Extractor::with_target(Arc::new(capture.clone()), opts).extract(&stream[..]).unwrap();
    assert_eq!(capture.get("/etc/passwd").unwrap(), b"root");
}

#[test]
fn test_truncated_stream_fails() {
    let files = vec![("f".to_string(), vec![1u8; 100])];
    let stream = encode_interleaved(&files, 1000, 100);
    let (_, res) = extract_to_capture(&stream[..stream.len() - 20], 1);
    assert!(matches!(res, Err(SinkError::Stream(StreamError::Truncated { .. }))));
}

/// A hand-built SPARSE chunk for `path` with the given map, carrying a
/// checksum that is valid for the bytes on the wire.
fn sparse_chunk(path: &str, map: &[(u32, u32)], payload: &[u8]) -> Vec<u8> {
    let mut map_bytes = Vec::new();
    for (skip, len) in map {
        map_bytes.extend_from_slice(&skip.to_be_bytes());
        map_bytes.extend_from_slice(&len.to_be_bytes());
    }
    let mut crc = crc32fast::Hasher::new();
    crc.update(&map_bytes);
    crc.update(payload);

    let mut out = Vec::new();
    out.extend_from_slice(CHUNK_MAGIC);
    out.push(0);
    out.push(b'S');
    out.extend_from_slice(&(path.len() as u32).to_be_bytes());
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(&(map.len() as u32).to_be_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&crc.finalize().to_be_bytes());
    out.extend_from_slice(&map_bytes);
    out.extend_from_slice(payload);
    out
}

#[test]
fn test_sparse_map_shorter_than_payload_is_rejected() {
    let mut stream = sparse_chunk("f", &[(0, 2)], b"abcd");
    chunk::write_eof(&mut stream, "f").unwrap();

    let (capture, res) = extract_to_capture(&stream, 1);
    let err = res.unwrap_err();
    assert!(matches!(err, SinkError::Stream(StreamError::SparseMap { mapped: 2, length: 4 })));
    assert_eq!(err.category(), ErrorCategory::Format);
    assert_eq!(capture.get("f"), None);
}

#[test]
fn test_sparse_map_longer_than_payload_is_rejected() {
    let stream = sparse_chunk("f", &[(4, 3), (0, 3)], b"abcd");
    let (_, res) = extract_to_capture(&stream, 1);
    let err = res.unwrap_err();
    assert!(matches!(err, SinkError::Stream(StreamError::SparseMap { mapped: 6, length: 4 })));
    assert_eq!(err.category(), ErrorCategory::Format);
}
