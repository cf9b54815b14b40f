#![no_main]

use libfuzzer_sys::fuzz_target;
use wn_core::frame::{Frame, FrameLimits};

fuzz_target!(|data: &[u8]| {
    // Slice parsing must never panic on any input.
    if let Ok((frame, used)) = Frame::parse(data) {
        assert!(used <= data.len());
        assert_eq!(used, frame.encoded_len());
    }

    // Neither may the bounded streaming decoder.
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    rt.block_on(async {
        let mut reader = data;
        while let Ok(Some(_)) = Frame::read_limited(&mut reader, FrameLimits::default()).await {}
    });
});
