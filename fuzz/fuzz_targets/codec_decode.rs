#![no_main]

use libfuzzer_sys::fuzz_target;
use sluice_codec::{
    destination_gid, dump_packet, gid_len, AmShortHeader, DeviceAddress, EndpointAddress,
    IfaceAddress, NetHeader, PutHeader,
};

fuzz_target!(|data: &[u8]| {
    if let Ok(neth) = NetHeader::decode(data) {
        assert_eq!(NetHeader::decode(&neth.encode()), Ok(neth));
    }
    let _ = AmShortHeader::decode(data);
    let _ = PutHeader::decode(data);
    let _ = DeviceAddress::decode(data);
    let _ = IfaceAddress::decode(data);
    let _ = EndpointAddress::decode(data);
    let _ = destination_gid(data, gid_len(data));
    let _ = dump_packet(data);
});
