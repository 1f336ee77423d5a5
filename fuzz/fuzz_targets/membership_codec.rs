#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use muster_protocol::{MemberAssignment, Subscription};

fuzz_target!(|data: &[u8]| {
    // Fuzz the membership blob decoders. These parse bytes relayed through
    // the broker from arbitrary group members, so they must reject garbage
    // without panicking or over-allocating:
    // - Truncated buffers
    // - Negative and oversized length prefixes
    // - Non-UTF-8 topic names

    let raw = Bytes::copy_from_slice(data);

    if let Ok(subscription) = Subscription::decode(raw.clone()) {
        // Whatever decodes must re-encode to something that decodes to the
        // same value.
        let redecoded = Subscription::decode(subscription.encode()).unwrap();
        assert_eq!(redecoded.version, subscription.version);
        assert_eq!(redecoded.topics, subscription.topics);
    }

    if let Ok(assignment) = MemberAssignment::decode(raw) {
        let redecoded = MemberAssignment::decode(assignment.encode()).unwrap();
        assert_eq!(redecoded, assignment);
    }
});
