use culvert_wire::{decode_deadline, encode_deadline, encode_write_count, parse_write_count};
use std::fs;
use std::time::{Duration, UNIX_EPOCH};

#[test]
fn vectors_match_header_encoding() {
    let dir = "tests/vectors";
    for entry in fs::read_dir(dir).expect("read vectors dir") {
        let entry = entry.expect("entry");
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path).expect("read vector");
        let value: serde_json::Value = serde_json::from_str(&contents).expect("json");

        if let Some(deadline) = value.get("deadline") {
            let unix_nanos = deadline["unix_nanos"].as_u64().expect("unix_nanos");
            let rfc3339 = deadline["rfc3339"].as_str().expect("rfc3339");
            let at = UNIX_EPOCH
                + Duration::new(unix_nanos / 1_000_000_000, (unix_nanos % 1_000_000_000) as u32);
            assert_eq!(
                encode_deadline(Some(at)),
                rfc3339,
                "deadline mismatch for {:?}",
                path
            );
            assert_eq!(
                decode_deadline(rfc3339),
                Some(at),
                "deadline decode mismatch for {:?}",
                path
            );
        }

        if let Some(count) = value.get("write_count") {
            let bytes = count["count"].as_u64().expect("count") as usize;
            let body = count["body"].as_str().expect("body");
            assert_eq!(
                encode_write_count(bytes).as_ref(),
                body.as_bytes(),
                "count mismatch for {:?}",
                path
            );
            assert_eq!(
                parse_write_count(body.as_bytes()).expect("parse"),
                bytes,
                "count round trip mismatch for {:?}",
                path
            );
        }
    }
}
