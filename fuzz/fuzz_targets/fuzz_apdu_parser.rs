//! Fuzz target: `ApduParser` readers and `Apdu::from_bytes`
//!
//! The first byte picks a sequence of reads; none may panic or move the
//! cursor past the end of the payload.
//!
//! cargo fuzz run fuzz_apdu_parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use ledger_session::apdu::{Apdu, ApduParser};

fuzz_target!(|data: &[u8]| {
    if let Some(apdu) = Apdu::from_bytes(data) {
        assert_eq!(apdu.to_bytes(), data);
    }

    let Some((&program, payload)) = data.split_first() else {
        return;
    };
    let mut parser = ApduParser::from_slice(payload);
    for step in 0..8 {
        let _ = match (program >> step) & 0b11 {
            0 => parser.read_u8().map(|_| ()),
            1 => parser.read_u32().map(|_| ()),
            2 => parser.read_lv().map(|_| ()),
            _ => parser.read_tlv().map(|_| ()),
        };
        assert!(parser.position() <= payload.len());
        assert_eq!(parser.position() + parser.remaining_len(), payload.len());
    }
});
