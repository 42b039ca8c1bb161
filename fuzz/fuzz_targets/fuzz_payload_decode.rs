//! Fuzz target for the wire envelope.
//!
//! Arbitrary bytes from the server must never panic the protobuf decode or
//! the typed body decode that follows it.

#![no_main]

use libfuzzer_sys::fuzz_target;
use prost::Message;
use registry_client::naming::messages::{NotifySubscriberRequest, ServiceInfoBody};
use registry_client::remote::payload::{decode, decode_response, response_type_for, EmptyBody, Payload};

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = Payload::decode(data) else {
        return;
    };

    let _ = payload.message_type();
    let _ = payload.is_request();
    let _ = response_type_for(payload.message_type());

    // Should never panic, whatever the body holds
    let _ = decode_response::<EmptyBody>(&payload, "fuzz");
    let _ = decode_response::<ServiceInfoBody>(&payload, "fuzz");
    let _ = decode::<NotifySubscriberRequest>(&payload);

    // Re-encoding a decoded envelope is lossless
    let bytes = payload.encode_to_vec();
    let again = Payload::decode(bytes.as_slice()).expect("re-decode of encoded payload");
    assert_eq!(payload, again);
});
