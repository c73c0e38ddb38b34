#![no_main]

use std::hint::black_box;

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use mqttd::packet;

fuzz_target!(|data: &[u8]| {
    let mut stream = BytesMut::from(data);

    // Whatever decodes must re-encode, and the re-encoding must decode back
    // to the same packet (the encoder is canonical even when the input used a
    // padded remaining length).
    while let Ok(decoded) = packet::read_mut(&mut stream, usize::MAX) {
        let mut buffer = Vec::new();
        packet::write(&decoded, &mut buffer).expect("decoded packet failed to encode");

        let mut round_trip = BytesMut::from(&buffer[..]);
        let re_decoded =
            packet::read_mut(&mut round_trip, usize::MAX).expect("encoded packet failed to decode");

        assert_eq!(black_box(re_decoded), decoded);
    }
});
