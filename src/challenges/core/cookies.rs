//! Cookie header helpers.
//!
//! Session credentials travel as plain `Cookie` header strings keyed by egress
//! path, so the crate parses `Set-Cookie` itself instead of relying on a
//! client-side cookie store.

use http::HeaderMap;
use http::header::SET_COOKIE;

use super::types::CookieJar;

/// Collect live cookies from every `Set-Cookie` header.
///
/// Cookies deleted via `Max-Age=0` are removed from the result and empty
/// values are skipped.
pub fn parse_set_cookie_headers(headers: &HeaderMap) -> CookieJar {
    let mut jar = CookieJar::new();
    for raw in headers.get_all(SET_COOKIE) {
        let Ok(raw) = raw.to_str() else {
            continue;
        };
        apply_set_cookie(&mut jar, raw);
    }
    jar
}

/// Apply a single `Set-Cookie` value to `jar`.
pub fn apply_set_cookie(jar: &mut CookieJar, raw: &str) {
    let mut parts = raw.split(';');
    let Some((name, value)) = parts.next().and_then(split_pair) else {
        return;
    };

    let deleted = parts.any(|attr| {
        split_pair(attr)
            .map(|(key, val)| key.eq_ignore_ascii_case("max-age") && val == "0")
            .unwrap_or(false)
    });

    if deleted {
        log::debug!("cookie {name} removed by server (Max-Age=0)");
        jar.remove(name);
    } else if !value.is_empty() {
        jar.insert(name.to_string(), value.to_string());
    }
}

/// Parse a `name=value; name2=value2` header string.
pub fn parse_cookie_string(cookies: &str) -> CookieJar {
    cookies
        .split(';')
        .filter_map(split_pair)
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Render a jar as a `Cookie` header value.
pub fn format_cookie_string(jar: &CookieJar) -> String {
    jar.iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Merge `updates` into an existing cookie string; new values win.
pub fn merge_cookie_string(existing: &str, updates: &CookieJar) -> String {
    let mut jar = parse_cookie_string(existing);
    jar.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    format_cookie_string(&jar)
}

/// Keep only cookies issued by the anti-bot layer.
pub fn anti_bot_cookies(jar: &CookieJar) -> CookieJar {
    jar.iter()
        .filter(|(name, _)| name.to_ascii_lowercase().contains("anubis"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn split_pair(segment: &str) -> Option<(&str, &str)> {
    let (name, value) = segment.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn parses_set_cookie_and_honours_deletion() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("techaro.lol-anubis-auth=abc123; Path=/; HttpOnly"),
        );
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("techaro.lol-anubis-cookie-verification=; Max-Age=0"),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("empty=; Path=/"));

        let jar = parse_set_cookie_headers(&headers);
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.get("techaro.lol-anubis-auth").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn merge_overrides_existing_values() {
        let mut updates = CookieJar::new();
        updates.insert("a".into(), "new".into());
        updates.insert("c".into(), "3".into());
        let merged = merge_cookie_string("a=old; b=2", &updates);
        assert_eq!(merged, "a=new; b=2; c=3");
    }

    #[test]
    fn filters_anti_bot_cookies() {
        let jar = parse_cookie_string("session=1; within.website-x-cmd-anubis-auth=tok");
        let filtered = anti_bot_cookies(&jar);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("within.website-x-cmd-anubis-auth"));
    }
}
