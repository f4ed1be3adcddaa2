//! Fuzz target: `ApduReceiver::handle_frame`
//!
//! Splits the input into frames and feeds them to the reassembler on both
//! framing profiles.  It must never panic and never yield a response
//! longer than the bytes it was fed.
//!
//! cargo fuzz run fuzz_apdu_receiver

#![no_main]

use libfuzzer_sys::fuzz_target;
use ledger_session::framing::{ApduReceiver, FrameProfile, HID_CHANNEL};

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let frame_len = usize::from(split.max(1));

    for profile in [FrameProfile::ble(), FrameProfile::hid(HID_CHANNEL)] {
        let mut receiver = ApduReceiver::new(profile);
        for frame in rest.chunks(frame_len) {
            if let Ok(Some(response)) = receiver.handle_frame(frame) {
                assert!(response.data.len() + 2 <= rest.len(), "response larger than input");
                assert!(!receiver.is_receiving());
            }
        }
        receiver.reset();
        assert!(!receiver.is_receiving());
    }
});
