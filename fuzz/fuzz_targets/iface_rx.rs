#![no_main]

use libfuzzer_sys::fuzz_target;
use sluice_sim::Harness;

fuzz_target!(|data: &[u8]| {
    let Ok(harness) = Harness::builder().build() else {
        return;
    };
    for chunk in data.split(|b| *b == 0xA5) {
        let mut packet = chunk.to_vec();
        // Steer most packets at the live endpoint so sequencing is reached.
        if packet.len() >= 4 && packet[0] & 0x80 == 0 {
            let ep = harness.b.ep.0.to_be_bytes();
            packet[1..4].copy_from_slice(&ep[1..4]);
        }
        harness.fabric.inject_raw(harness.b.qpn, None, &packet);
        harness.b.iface.progress();
    }
    harness.progress();
});
