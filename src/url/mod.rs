//! URL helpers: host extraction, wildcard host matching, link resolution
//! and pagination.

use crate::UrlError;
use url::Url;

/// Extracts the lowercase host of a URL
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_ascii_lowercase())
}

/// Checks a host against a denylist pattern
///
/// `"i1.example.net"` matches only itself; `"*.example.net"` matches the bare
/// domain and any subdomain depth. Comparison ignores ASCII case.
///
/// ```
/// use storefront_crawler::url::matches_wildcard;
///
/// assert!(matches_wildcard("*.secure.pixiv.net", "i3.secure.pixiv.net"));
/// assert!(matches_wildcard("*.secure.pixiv.net", "secure.pixiv.net"));
/// assert!(!matches_wildcard("*.secure.pixiv.net", "insecure.pixiv.net"));
/// ```
pub fn matches_wildcard(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            if host.eq_ignore_ascii_case(base) {
                return true;
            }
            host.len() > base.len() + 1
                && host.as_bytes()[host.len() - base.len() - 1] == b'.'
                && host
                    .get(host.len() - base.len()..)
                    .map_or(false, |tail| tail.eq_ignore_ascii_case(base))
        }
        None => host.eq_ignore_ascii_case(pattern),
    }
}

/// Returns the first denylist pattern matching the URL's host, if any
pub fn denylist_match<'a>(url: &str, patterns: &'a [String]) -> Option<&'a str> {
    let parsed = Url::parse(url).ok()?;
    let host = extract_domain(&parsed)?;
    patterns
        .iter()
        .find(|pattern| matches_wildcard(pattern, &host))
        .map(String::as_str)
}

/// Resolves an href or src value against the page it was found on
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - fragment-only links
/// - Non-HTTP(S) URLs after resolution
///
/// Protocol-relative links (`//cdn.example/x.jpg`) are forced to HTTPS.
pub fn resolve_link(href: &str, base_url: &Url) -> Option<Url> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let resolved = match href.strip_prefix("//") {
        Some(rest) => Url::parse(&format!("https://{}", rest)),
        None => base_url.join(href),
    };

    match resolved {
        Ok(absolute) if absolute.scheme() == "http" || absolute.scheme() == "https" => {
            Some(absolute)
        }
        _ => None,
    }
}

/// Builds the URL of the following listing page by incrementing a query parameter
///
/// A missing parameter is treated as page 0, so the result carries `param=1`.
///
/// # Examples
///
/// ```
/// use storefront_crawler::url::next_page_url;
///
/// let next = next_page_url("https://example.test/list?page=0", "page").unwrap();
/// assert_eq!(next.as_str(), "https://example.test/list?page=1");
/// ```
pub fn next_page_url(current: &str, param: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(current).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(UrlError::MissingDomain);
    }

    let mut current_page = None;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    for (key, value) in &pairs {
        if key == param {
            current_page = Some(
                value
                    .parse::<u64>()
                    .map_err(|_| UrlError::Parse(format!("{}={} is not a page number", key, value)))?,
            );
        }
    }

    let next = current_page.map_or(1, |page| page + 1).to_string();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        let mut replaced = false;
        for (key, value) in &pairs {
            if key == param {
                if !replaced {
                    query.append_pair(key, &next);
                    replaced = true;
                }
            } else {
                query.append_pair(key, value);
            }
        }
        if !replaced {
            query.append_pair(param, &next);
        }
    }

    Ok(url)
}
