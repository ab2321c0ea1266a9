use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;

/// Connection-scoped headers that must not cross a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HeaderEntry {
    name: String,
    #[serde(with = "base64_bytes")]
    value: Vec<u8>,
}

/// Ordered multi-map of HTTP headers.
///
/// Names are stored lowercased so lookups are case-insensitive; values are raw
/// bytes so they survive serialization unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<HeaderEntry>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<Vec<u8>>) {
        self.0.push(HeaderEntry {
            name: name.as_ref().to_ascii_lowercase(),
            value: value.into(),
        });
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|e| !e.name.eq_ignore_ascii_case(name));
    }

    /// Copy without hop-by-hop headers.
    pub fn end_to_end(&self) -> Headers {
        Headers(
            self.0
                .iter()
                .filter(|e| !is_hop_by_hop(&e.name))
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|e| (e.name.as_str(), e.value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<Vec<u8>>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}
