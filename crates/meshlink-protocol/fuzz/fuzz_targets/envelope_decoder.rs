#![no_main]

use libfuzzer_sys::fuzz_target;
use meshlink_protocol::envelope::Envelope;

fuzz_target!(|data: &[u8]| {
    // The decoder must reject arbitrary input without panicking
    if let Ok(envelope) = Envelope::decode(data) {
        if let Ok(encoded) = envelope.encode() {
            let _ = Envelope::decode(&encoded);
        }

        if let Envelope::Message(message) = &envelope {
            let _ = message.validate();
        }
    }
});
