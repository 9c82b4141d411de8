//! Verify request translation against JSON test vectors stored in `test-vectors/`.
//!
//! Each case gives a plain request and the parts the substrate should be fed.
//! Header values are compared as text since the vectors only use ASCII.

use myplugin_core::{translate, ExchangeError, Method, Request, Scheme};

fn string_pairs(value: &serde_json::Value) -> Vec<(String, String)> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|h| {
            let arr = h.as_array().unwrap();
            (arr[0].as_str().unwrap().to_string(), arr[1].as_str().unwrap().to_string())
        })
        .collect()
}

fn build_request(input: &serde_json::Value) -> Request {
    let mut req = Request::new(input["method"].as_str().unwrap(), input["uri"].as_str().unwrap());
    for (name, value) in string_pairs(&input["headers"]) {
        req = req.header(name, value);
    }
    if let Some(body) = input["body"].as_str() {
        req = req.body(body);
    }
    req
}

fn vectors() -> serde_json::Value {
    let raw = include_str!("../../test-vectors/translate.json");
    serde_json::from_str(raw).unwrap()
}

// ---------------------------------------------------------------------------
// Valid requests
// ---------------------------------------------------------------------------

#[test]
fn translate_test_vectors() {
    let vectors = vectors();
    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let expected = &case["expected"];

        let parts = translate(&build_request(&case["input"])).unwrap();

        assert_eq!(parts.method.as_str(), expected["method"].as_str().unwrap(), "{name}: method");
        assert_eq!(
            matches!(parts.method, Method::Other(_)),
            expected["extension_method"].as_bool().unwrap_or(false),
            "{name}: extension method"
        );
        assert_eq!(parts.scheme.as_str(), expected["scheme"].as_str().unwrap(), "{name}: scheme");
        assert_eq!(
            matches!(parts.scheme, Scheme::Other(_)),
            expected["extension_scheme"].as_bool().unwrap_or(false),
            "{name}: extension scheme"
        );
        assert_eq!(parts.authority, expected["authority"].as_str().unwrap(), "{name}: authority");
        assert_eq!(
            parts.path_with_query,
            expected["path_with_query"].as_str().unwrap(),
            "{name}: path with query"
        );

        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8(v.clone()).unwrap()))
            .collect();
        assert_eq!(headers, string_pairs(&expected["headers"]), "{name}: headers");
    }
}

// ---------------------------------------------------------------------------
// Malformed URIs
// ---------------------------------------------------------------------------

#[test]
fn invalid_uri_test_vectors() {
    let vectors = vectors();
    for case in vectors["invalid"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let err = translate(&Request::get(case["uri"].as_str().unwrap())).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidRequest(_)), "{name}: {err:?}");
    }
}
