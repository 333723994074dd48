//! Deterministic, key-sorted JSON encoding for audit records.
//!
//! `serde_json::Value`'s `Map` is backed by a `BTreeMap` as long as the
//! `preserve_order` feature is not enabled anywhere in the dependency
//! graph (it is not, in this workspace). That means `serde_json::to_vec`
//! and `serde_json::to_string` already emit object keys in lexicographic
//! order, recursively. This module exists to name that property explicitly
//! so nobody "fixes" ordering later by adding `preserve_order` and silently
//! breaking request-equality assertions.

use crate::prelude::*;

/// Serialize `value` to its canonical, key-sorted byte representation.
pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    // `to_vec` on a `Value` never fails: `Value` is always representable.
    serde_json::to_vec(value).expect("serializing a Value cannot fail")
}

/// Serialize `value` to its canonical, key-sorted string representation.
pub fn to_canonical_string(value: &Value) -> String {
    serde_json::to_string(value).expect("serializing a Value cannot fail")
}

/// Combine two canonical request records (compression + evaluation) into a
/// single record with stable keys, as required for
/// `evaluate_compression`'s combined `request_json`.
pub fn combine_requests(compression_request: Value, evaluation_request: Value) -> Value {
    json!({
        "compression_request": compression_request,
        "evaluation_request": evaluation_request,
    })
}
