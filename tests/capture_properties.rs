//! Property tests over the shared data model: capture encoding round-trips
//! structurally with exact raw-byte fidelity, and response-tree writes are
//! idempotent under re-encoding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use proptest::prelude::*;

use echotrap_core::{Capture, HttpCapture, ResponseTree};

proptest! {
    #[test]
    fn capture_encoding_roundtrips_structurally(
        raw in proptest::collection::vec(any::<u8>(), 0..512),
        method in "[A-Z]{3,7}",
        path in "/[a-z0-9/]{0,30}",
        port in any::<u16>(),
        date in 0i64..4_102_444_800,
    ) {
        let capture = Capture::Http(HttpCapture {
            id: uuid::Uuid::new_v4().to_string(),
            subdomain: "abcd1234".to_string(),
            ip: "203.0.113.5".to_string(),
            country: None,
            port,
            date,
            raw: BASE64.encode(&raw),
            method,
            protocol: "HTTP/1.1".to_string(),
            headers: serde_json::Map::new(),
            path: path.clone(),
            query: String::new(),
            fragment: String::new(),
            url: format!("http://abcd1234.localhost{}", path),
        });

        let encoded = serde_json::to_string(&capture).unwrap();
        let decoded: Capture = serde_json::from_str(&encoded).unwrap();

        // Structural equality of the re-encoded record.
        prop_assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            serde_json::to_value(&capture).unwrap()
        );

        // Raw bytes survive the base64 trip exactly.
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let round = BASE64.decode(value["raw"].as_str().unwrap()).unwrap();
        prop_assert_eq!(round, raw);
    }

    #[test]
    fn tree_encoding_is_idempotent(
        leaves in proptest::collection::btree_map(
            "[a-z][a-z0-9]{0,7}",
            (any::<u16>(), "[ -~]{0,32}"),
            0..6
        )
    ) {
        let mut tree = serde_json::Map::new();
        tree.insert(
            "index.html".to_string(),
            serde_json::json!({"raw": "", "headers": [], "status_code": 200}),
        );
        for (key, (status, body)) in leaves {
            let status = 100 + (status % 500);
            tree.insert(
                key,
                serde_json::json!({
                    "raw": BASE64.encode(body.as_bytes()),
                    "headers": [{"header": "X-Probe", "value": body}],
                    "status_code": status
                }),
            );
        }
        let value = serde_json::Value::Object(tree);

        let first: ResponseTree = serde_json::from_value(value).unwrap();
        let once = serde_json::to_value(&first).unwrap();
        let second: ResponseTree = serde_json::from_value(once.clone()).unwrap();
        let twice = serde_json::to_value(&second).unwrap();

        // Writing the same tree again changes nothing observable.
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(once, twice);
    }
}
