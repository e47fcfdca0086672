#![no_main]

use bytes::BytesMut;
use icp_protocol::{LazyView, Opcode, WireCodec};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Eager and lazy decoding must never panic, whatever arrives.
    let _ = WireCodec::new().decode(data);

    let mut view = LazyView::new(BytesMut::from(data));
    let _ = view.payload_url();
    let _ = view.payload_object();
    let _ = view.write_response(Opcode::Denied);
});
