//! Extraction paths
//!
//! Accepts RFC 6901 pointers (`/data/price`) as well as dotted paths
//! (`$.data.price`, `data.items[0].price`), which are rewritten to pointers.

use serde_json::Value;

use crate::error::FetchError;

pub fn extract<'a>(document: &'a Value, path: Option<&str>) -> Result<&'a Value, FetchError> {
    let Some(path) = path else {
        return Ok(document);
    };

    let pointer = to_pointer(path)?;
    document
        .pointer(&pointer)
        .ok_or_else(|| FetchError::ExtractionFailed(format!("path {path} not found")))
}

pub fn to_pointer(path: &str) -> Result<String, FetchError> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Ok(String::new());
    }
    if path.starts_with('/') {
        return Ok(path.to_string());
    }

    let body = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);

    let mut pointer = String::new();
    for segment in body.split('.') {
        if segment.is_empty() {
            return Err(FetchError::ExtractionFailed(format!(
                "empty segment in path {path}"
            )));
        }

        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };

        if !key.is_empty() {
            pointer.push('/');
            pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
        }

        let mut rest = indices;
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| {
                FetchError::ExtractionFailed(format!("unbalanced brackets in path {path}"))
            })?;
            let index = &rest[1..close];
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FetchError::ExtractionFailed(format!(
                    "invalid index [{index}] in path {path}"
                )));
            }
            pointer.push('/');
            pointer.push_str(index);
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(FetchError::ExtractionFailed(format!(
                    "unexpected characters after index in path {path}"
                )));
            }
        }
    }

    Ok(pointer)
}
