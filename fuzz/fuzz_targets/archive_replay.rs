#![no_main]

//! Replays from an archive file holding arbitrary bytes.

use std::sync::Arc;

use fixreplay_core::{
    ArchiveReader, ArchiveSource, CollectingErrorSink, ControlAction, ErrorSink, MappedFileCache,
    ReadOutcome, ReplayConfig, SessionReader,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let (start, contents) = data.split_at(8);
    let mut position = u64::from_le_bytes(start.try_into().unwrap_or_default()) % 4096;

    let tmp = tempfile::tempdir().unwrap();
    let config = ReplayConfig::for_dir(tmp.path());
    std::fs::write(config.archive_path(1), contents).unwrap();

    let sink: Arc<dyn ErrorSink> = Arc::new(CollectingErrorSink::new());
    let cache = Arc::new(MappedFileCache::new(1, 1, Arc::clone(&sink)));
    let mut reader = ArchiveReader::new(&config, cache, sink).session(1);

    for _ in 0..64 {
        let mut handler = |frame: &[u8]| {
            assert!(frame.len() >= 32);
            ControlAction::Continue
        };
        match reader.read(position, &mut handler) {
            ReadOutcome::NextPosition(next) => {
                assert!(next > position);
                position = next;
            }
            _ => break,
        }
    }
});
