//! Response body rewriting for JSON payloads

use bytes::Bytes;

/// Vendor prefix reported by the backend in model names
pub const VENDOR_PREFIX: &str = "koboldcpp/";
/// What clients see instead
pub const PRODUCT_PREFIX: &str = "kindling/";

/// Whether a `Content-Type` value denotes a JSON body
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("json")
}

/// Replace every vendor prefix in a UTF-8 body; other bodies pass unchanged
pub fn rewrite_json_body(body: Bytes) -> Bytes {
    match std::str::from_utf8(&body) {
        Ok(text) if text.contains(VENDOR_PREFIX) => Bytes::from(text.replace(VENDOR_PREFIX, PRODUCT_PREFIX)),
        _ => body,
    }
}
