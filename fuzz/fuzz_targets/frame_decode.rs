#![no_main]

use fixreplay_core::frame::{FrameHeader, FrameView};
use fixreplay_core::IndexEntry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = FrameHeader::decode(data) {
        assert!(header.frame_length() >= 32);
        assert_eq!(header.aligned_length() % 8, 0);
    }
    if let Ok(view) = FrameView::parse(data) {
        assert!(view.header.verify(view.body));
        assert_eq!(view.body.len(), view.header.body_length());
    }
    if let Some(entry) = IndexEntry::decode(data) {
        assert_eq!(IndexEntry::decode(&entry.encode()), Some(entry));
    }
});
