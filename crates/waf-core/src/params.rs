//! URL-encoded parameter parsing
//!
//! Query strings, `application/x-www-form-urlencoded` bodies and `Cookie`
//! headers all decode into the same flat key/value map.

use std::collections::{HashMap, HashSet};

/// The only body content type the inspector understands.
pub const URLENCODED: &str = "application/x-www-form-urlencoded";

/// Decoded parameters; the last occurrence of a repeated key wins.
pub type QueryParams = HashMap<String, String>;

/// A set of parameter keys (header names, cookie names, query keys).
pub type Keys = HashSet<String>;

/// Decode `+` as a space and `%XX` escapes.
///
/// A `%` that is not followed by two hex digits is copied through as-is, so
/// trailing or malformed escapes never fail. Bytes that do not form valid
/// UTF-8 after decoding are replaced lossily.
pub fn percent_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    decoded.push((hi << 4) | lo);
                    i += 3;
                    continue;
                }
                _ => decoded.push(b'%'),
            },
            b => decoded.push(b),
        }
        i += 1;
    }
    match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Parse an `&`-separated query string (without the leading `?`).
pub fn parse_query_string(query: &str) -> QueryParams {
    parse_parameters(query, false)
}

/// Parse the query string portion of a request path.
///
/// Returns an empty map when the path has no `?` or nothing follows it.
pub fn parse_path(path: &str) -> QueryParams {
    match path.split_once('?') {
        Some((_, query)) => parse_query_string(query),
        None => QueryParams::new(),
    }
}

/// Parse a URL-encoded request body.
pub fn parse_body(body: &str) -> QueryParams {
    parse_query_string(body)
}

/// Parse a `Cookie` header value.
///
/// Entries are `;`-separated with optional spaces after the separator, and a
/// single layer of surrounding double quotes is stripped from each value.
pub fn parse_cookie_header(header: &str) -> QueryParams {
    parse_parameters(header, true)
}

fn parse_parameters(data: &str, cookie: bool) -> QueryParams {
    let delimiter = if cookie { ';' } else { '&' };
    let mut params = QueryParams::new();
    let mut rest = data;

    while !rest.is_empty() {
        let (entry, tail) = match rest.find(delimiter) {
            Some(end) => (&rest[..end], Some(&rest[end + 1..])),
            None => (rest, None),
        };

        let (key, value) = match entry.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(entry), String::new()),
        };
        let value = if cookie { unquote(value) } else { value };
        params.insert(key, value);

        rest = match tail {
            Some(t) if cookie => t.trim_start_matches(' '),
            Some(t) => t,
            None => "",
        };
    }

    params
}

fn unquote(value: String) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value
    }
}
