mod common;

use std::fs;
use std::sync::Arc;

use common::Capture;
use tempfile::tempdir;
use xbstream::chunk::ChunkType;
use xbstream::datasink::{self, Datasink, DatasinkKind, DatasinkOptions, FileStat, XbstreamSink};
use xbstream::stream::ReadResult;
use xbstream::{Chunk, CodecId, ExtractOptions, Extractor, SparseChunk, XbReader, XbWriter};

fn finish(writer: Arc<XbWriter<Vec<u8>>>) -> Vec<u8> {
    Arc::try_unwrap(writer).ok().unwrap().into_inner()
}

#[test]
fn test_extract_to_directory() {
    let writer = Arc::new(XbWriter::new(Vec::new()));
    let mut a = writer.open("a.txt").unwrap();
    let mut b = writer.open("b.txt").unwrap();
    a.write(b"hello world\n").unwrap();
    a.close().unwrap();
    b.close().unwrap();
    drop((a, b));
    let stream = finish(writer);

    let out = tempdir().unwrap();
    let opts = ExtractOptions { threads: 4, ..Default::default() };
    let summary = Extractor::new(out.path(), opts).unwrap().extract(&stream[..]).unwrap();

    assert_eq!(summary.files, 2);
    assert_eq!(summary.chunks, 1);
    assert_eq!(summary.bytes, 12);
    assert_eq!(fs::read(out.path().join("a.txt")).unwrap(), b"hello world\n");
    assert_eq!(fs::metadata(out.path().join("b.txt")).unwrap().len(), 0);
}

#[test]
fn test_existing_file_is_not_overwritten() {
    let writer = Arc::new(XbWriter::new(Vec::new()));
    let mut f = writer.open("keep.txt").unwrap();
    f.write(b"new").unwrap();
    f.close().unwrap();
    drop(f);
    let stream = finish(writer);

    let out = tempdir().unwrap();
    fs::write(out.path().join("keep.txt"), b"old").unwrap();
    let res = Extractor::new(out.path(), ExtractOptions::default()).unwrap().extract(&stream[..]);
    assert!(res.is_err());
    assert_eq!(fs::read(out.path().join("keep.txt")).unwrap(), b"old");
}

#[test]
fn test_sparse_holes_are_restored() {
    let writer = Arc::new(XbWriter::with_chunk_size(Vec::new(), 1024));
    let mut f = writer.open("t1.ibd").unwrap();
    f.write(b"abc").unwrap();
    f.write_sparse(b"xy", &[SparseChunk::new(10, 2)]).unwrap();
    f.write_sparse(&[], &[SparseChunk::new(4096, 0)]).unwrap();
    f.close().unwrap();
    drop(f);
    let stream = finish(writer);

    let out = tempdir().unwrap();
    Extractor::new(out.path(), ExtractOptions::default()).unwrap().extract(&stream[..]).unwrap();

    let got = fs::read(out.path().join("t1.ibd")).unwrap();
    assert_eq!(got.len(), 3 + 10 + 2 + 4096);
    assert_eq!(&got[..3], b"abc");
    assert!(got[3..13].iter().all(|&b| b == 0));
    assert_eq!(&got[13..15], b"xy");
    assert_eq!(got.last(), Some(&0));
}

#[test]
fn test_sparse_falls_back_to_zero_fill() {
    let writer = Arc::new(XbWriter::new(Vec::new()));
    let mut f = writer.open("s").unwrap();
    f.write_sparse(b"q", &[SparseChunk::new(3, 1), SparseChunk::new(2, 0)]).unwrap();
    f.close().unwrap();
    drop(f);
    let stream = finish(writer);

    // The in-memory target has no sparse support.
    let capture = Capture::default();
    Extractor::with_target(Arc::new(capture.clone()), ExtractOptions::default())
        .extract(&stream[..])
        .unwrap();
    assert_eq!(capture.get("s").unwrap(), [0, 0, 0, b'q', 0, 0]);
}

#[test]
fn test_files_are_dealt_round_robin_across_streams() {
    let out = Capture::default();
    let sink = XbstreamSink::new(3, 1024);
    sink.set_pipe(Arc::new(out.clone()));

    for i in 0..10 {
        let name = format!("f{i}");
        let mut f = sink.open(&name, &FileStat::default()).unwrap();
        f.write(name.as_bytes()).unwrap();
        f.close().unwrap();
    }
    sink.deinit().unwrap();

    // One destination per context, named after its first file.
    assert_eq!(out.paths(), ["f0", "f1", "f2"]);

    let f0 = out.get("f0").unwrap();
    let mut reader = XbReader::new(&f0[..]);
    let mut chunk = Chunk::default();
    let mut closed = Vec::new();
    while let ReadResult::Chunk = reader.read_chunk(&mut chunk).unwrap() {
        if chunk.chunk_type == ChunkType::Eof {
            closed.push(chunk.path.clone());
        }
    }
    assert_eq!(closed, ["f0", "f3", "f6", "f9"]);

    // All three streams together extract every file.
    let streams: Vec<Vec<u8>> = out.paths().iter().map(|p| out.get(p).unwrap()).collect();
    let extracted = Capture::default();
    let opts = ExtractOptions { threads: 2, ..Default::default() };
    let summary = Extractor::with_target(Arc::new(extracted.clone()), opts)
        .extract_all(streams.iter().map(|s| &s[..]).collect())
        .unwrap();
    assert_eq!(summary.files, 10);
    for i in 0..10 {
        let name = format!("f{i}");
        assert_eq!(extracted.get(&name).unwrap(), name.as_bytes());
    }
}

/// Content for producer `t` in the shared-context test: small writes of
/// varying size, each tagged with the producer and its position.
fn producer_pieces(t: usize) -> Vec<Vec<u8>> {
    (0..300usize).map(|n| vec![(t * 31 + n) as u8; 1 + (n * 7 + t) % 17]).collect()
}

#[test]
fn test_concurrent_producers_share_stream_contexts() {
    let out = Capture::default();
    let sink = XbstreamSink::new(2, 64);
    sink.set_pipe(Arc::new(out.clone()));

    std::thread::scope(|scope| {
        for t in 0..6 {
            let sink = &sink;
            scope.spawn(move || {
                let mut f = sink.open(&format!("t{t}"), &FileStat::default()).unwrap();
                for piece in producer_pieces(t) {
                    f.write(&piece).unwrap();
                }
                f.close().unwrap();
            });
        }
    });
    sink.deinit().unwrap();
    assert_eq!(out.paths().len(), 2);

    let streams: Vec<Vec<u8>> = out.paths().iter().map(|p| out.get(p).unwrap()).collect();
    let extracted = Capture::default();
    let opts = ExtractOptions { threads: 2, ..Default::default() };
    let summary = Extractor::with_target(Arc::new(extracted.clone()), opts)
        .extract_all(streams.iter().map(|s| &s[..]).collect())
        .unwrap();
    assert_eq!(summary.files, 6);
    for t in 0..6 {
        assert_eq!(extracted.get(&format!("t{t}")).unwrap(), producer_pieces(t).concat());
    }
}

/// Build `[compress] → [encrypt] → xbstream → capture` and stream `files`
/// through it, returning the single encoded stream.
fn create_stream(files: &[(&str, Vec<u8>)], compress: Option<CodecId>, key: Option<&str>) -> Vec<u8> {
    let capture = Capture::default();
    let opts = DatasinkOptions {
        compress: compress.unwrap_or(CodecId::Zstd),
        compress_chunk_size: 4096,
        compress_threads: 2,
        encrypt_key: key.map(str::to_owned),
        chunk_size: 8192,
        ..Default::default()
    };
    let root = std::env::temp_dir();
    let mut stages: Vec<Arc<dyn Datasink>> = Vec::new();
    let mut head = datasink::create_piped(DatasinkKind::Xbstream, &root, &opts, Arc::new(capture.clone())).unwrap();
    stages.push(Arc::clone(&head));
    if key.is_some() {
        head = datasink::create_piped(DatasinkKind::Encrypt, &root, &opts, head).unwrap();
        stages.push(Arc::clone(&head));
    }
    if compress.is_some() {
        head = datasink::create_piped(DatasinkKind::Compress, &root, &opts, head).unwrap();
        stages.push(Arc::clone(&head));
    }

    for (name, data) in files {
        let stat = FileStat { size: data.len() as u64, mtime: None };
        let mut f = head.open(name, &stat).unwrap();
        for piece in data.chunks(3000) {
            f.write(piece).unwrap();
        }
        f.close().unwrap();
    }
    for stage in stages.iter().rev() {
        stage.deinit().unwrap();
    }

    let paths = capture.paths();
    assert_eq!(paths.len(), 1);
    capture.get(&paths[0]).unwrap()
}

fn sample_files() -> Vec<(&'static str, Vec<u8>)> {
    let text: Vec<u8> = b"ibdata page ".iter().copied().cycle().take(20_000).collect();
    let noise: Vec<u8> = (0..9_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
    vec![("ibdata1", text), ("db/t1.ibd", noise), ("empty", Vec::new())]
}

fn assert_pipeline_round_trip(compress: Option<CodecId>, key: Option<&str>) {
    let files = sample_files();
    let stream = create_stream(&files, compress, key);

    let out = tempdir().unwrap();
    let opts = ExtractOptions {
        threads: 3,
        decompress: compress.is_some(),
        decrypt_key: key.map(str::to_owned),
        ..Default::default()
    };
    Extractor::new(out.path(), opts).unwrap().extract(&stream[..]).unwrap();
    for (name, data) in &files {
        assert_eq!(&fs::read(out.path().join(name)).unwrap(), data, "{name}");
    }
}

#[test]
fn test_zstd_pipeline_round_trip() {
    assert_pipeline_round_trip(Some(CodecId::Zstd), None);
}

#[test]
fn test_lz4_pipeline_round_trip() {
    assert_pipeline_round_trip(Some(CodecId::Lz4), None);
}

#[test]
fn test_encrypted_pipeline_round_trip() {
    assert_pipeline_round_trip(None, Some("s3cret"));
}

#[test]
fn test_compressed_and_encrypted_pipeline_round_trip() {
    assert_pipeline_round_trip(Some(CodecId::Zstd), Some("s3cret"));
}

#[test]
fn test_compressed_files_kept_without_decompress() {
    let files = sample_files();
    let stream = create_stream(&files, Some(CodecId::Lz4), None);

    let capture = Capture::default();
    Extractor::with_target(Arc::new(capture.clone()), ExtractOptions::default())
        .extract(&stream[..])
        .unwrap();
    assert_eq!(capture.paths(), ["db/t1.ibd.lz4", "empty.lz4", "ibdata1.lz4"]);
}
