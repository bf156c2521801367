#![no_main]
use libfuzzer_sys::fuzz_target;
use wiredump::codec::Decoder;
use wiredump::reassembly::ByteRing;
use wiredump::schema::Schema;
use wiredump::transform::{TransformContext, TransformPipeline};

const SCHEMA: &str = r#"{
    "protocol": {
        "header": {
            "fields": [
                {"name": "size", "type": "uint16", "offset": 0},
                {"name": "type", "type": "uint16", "offset": 2}
            ]
        }
    },
    "types": {
        "Position": {"kind": "struct", "fields": [
            {"name": "x", "type": "uint16"},
            {"name": "y", "type": "uint16"}
        ]}
    },
    "packets": [
        {"type": 1, "name": "A", "fields": [
            {"name": "size", "type": "uint16"},
            {"name": "type", "type": "uint16"},
            {"name": "who", "type": "string", "length": 8},
            {"name": "n", "type": "uint8"},
            {"name": "xs", "type": "array", "element": "Position", "count_field": "n"}
        ]},
        {"type": 2, "name": "B", "fields": [
            {"name": "size", "type": "uint16"},
            {"name": "type", "type": "uint16"},
            {"name": "rest", "type": "bytes", "length": "remaining"}
        ]}
    ]
}"#;

fuzz_target!(|data: &[u8]| {
    let schema = Schema::from_json(SCHEMA).unwrap();
    let pipeline = TransformPipeline::empty();
    let decoder = Decoder::new(&schema, &pipeline);
    let mut ring = ByteRing::new();
    let mut ctx = TransformContext::new();
    ring.append(data);
    let mut consumed = 0usize;
    while let Some(msg) = decoder.next_message(&mut ring, &mut ctx) {
        // Framing soundness: emitted raw bytes are a prefix of the input.
        assert_eq!(&data[consumed..consumed + msg.raw.len()], &msg.raw[..]);
        consumed += msg.raw.len();
    }
});
