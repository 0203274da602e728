//! Subdomain grammar: minting, validation, and extraction from hostnames,
//! URL paths and DNS query names.
//!
//! A subdomain is a fixed-length token over the configured alphabet. It is
//! the primary key for every user-scoped artifact, so every extraction path
//! lowercases its input before validating (URL hosts and DNS names are
//! case-insensitive).

use rand::seq::SliceRandom;

/// Mint a random subdomain from the given alphabet.
pub fn random(alphabet: &str, length: usize) -> String {
    let chars: Vec<char> = alphabet.chars().collect();
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| chars.choose(&mut rng).copied().unwrap_or('a'))
        .collect()
}

/// Whether `candidate` satisfies the subdomain grammar.
pub fn is_valid(candidate: &str, alphabet: &str, length: usize) -> bool {
    candidate.chars().count() == length && candidate.chars().all(|c| alphabet.contains(c))
}

/// Extract a subdomain from a `Host` header value.
///
/// Takes the label immediately preceding the root domain, keeps its trailing
/// `length` characters and validates. `test.abcd1234.example.com` and
/// `longabcd1234.example.com` both yield `abcd1234`.
pub fn from_hostname(host: &str, domain: &str, alphabet: &str, length: usize) -> Option<String> {
    let host = host.to_lowercase();
    let suffix = format!(".{}", domain);
    let end = host.rfind(&suffix)?;

    let label_start = match host[..end].rfind('.') {
        Some(dot) => dot + 1,
        None => 0,
    };
    let label = &host[label_start..end];
    if !label.is_ascii() || label.len() < length {
        return None;
    }
    let candidate = &label[label.len() - length..];
    is_valid(candidate, alphabet, length).then(|| candidate.to_string())
}

/// Extract a subdomain from a URL path of the form `/r/<sub>/...`.
///
/// Case-insensitive, tolerant of duplicated slashes; the first `length`
/// characters of the segment after `r` are validated.
pub fn from_path(path: &str, alphabet: &str, length: usize) -> Option<String> {
    let path = path.to_lowercase();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    if segments.next()? != "r" {
        return None;
    }
    let segment = segments.next()?;
    if !segment.is_ascii() || segment.len() < length {
        return None;
    }
    let candidate = &segment[..length];
    is_valid(candidate, alphabet, length).then(|| candidate.to_string())
}

/// Derive the owning subdomain from a DNS query name.
///
/// Matches `<anything>.<sub>.<root>.` (trailing dot) where `<sub>` satisfies
/// the grammar; the label directly before the root wins.
pub fn from_qname(qname: &str, domain: &str, alphabet: &str, length: usize) -> Option<String> {
    let qname = qname.to_lowercase();
    let suffix = format!(".{}.", domain);
    let rest = qname.strip_suffix(&suffix)?;
    let candidate = rest.rsplit('.').next()?;
    is_valid(candidate, alphabet, length).then(|| candidate.to_string())
}
