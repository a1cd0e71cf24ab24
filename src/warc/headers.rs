//! Case-insensitive, deterministic-order header container.
//!
//! On read, the raw key case is preserved. On write, every key is
//! title-cased with the `WARC` token kept upper-case (`WARC-Type`, not
//! `Warc-Type`), and mandatory headers are rendered first in a fixed
//! canonical order, with the remainder following in insertion order.

const CANONICAL_ORDER: &[&str] = &[
    "WARC-Type",
    "WARC-Record-ID",
    "WARC-Date",
    "WARC-Target-URI",
    "WARC-Warcinfo-ID",
    "WARC-Concurrent-To",
    "WARC-IP-Address",
    "WARC-Refers-To",
    "WARC-Refers-To-Target-URI",
    "WARC-Refers-To-Date",
    "WARC-Profile",
    "WARC-Truncated",
    "WARC-Payload-Digest",
    "WARC-Block-Digest",
    "WARC-Filename",
    "Content-Type",
    "Content-Length",
];

#[derive(Debug, Clone, Default)]
pub struct WarcHeaders {
    entries: Vec<(String, String)>,
}

impl WarcHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace the value for `key`, preserving the existing raw
    /// key case if the header already exists.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            entry.1 = value.into();
        } else {
            self.entries.push((key.to_string(), value.into()));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Insert a header exactly as read off the wire, preserving its raw key
    /// case verbatim (used only by the parser).
    pub fn push_raw(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render in canonical order (mandatory headers first, title-cased),
    /// then the remainder in insertion order.
    pub fn render_ordered(&self) -> Vec<(String, &str)> {
        let mut rendered: Vec<(String, &str)> = Vec::with_capacity(self.entries.len());
        let mut seen = vec![false; self.entries.len()];

        for canon in CANONICAL_ORDER {
            if let Some(idx) = self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(canon)) {
                seen[idx] = true;
                rendered.push((title_case(canon), self.entries[idx].1.as_str()));
            }
        }
        for (idx, (k, v)) in self.entries.iter().enumerate() {
            if !seen[idx] {
                rendered.push((title_case(k), v.as_str()));
            }
        }
        rendered
    }
}

/// Title-case a hyphen-separated header key, keeping the `WARC` token
/// upper-case (`WARC-Block-Digest`, not `Warc-Block-Digest`).
fn title_case(key: &str) -> String {
    key.split('-')
        .map(|segment| {
            if segment.eq_ignore_ascii_case("warc") {
                "WARC".to_string()
            } else if segment.eq_ignore_ascii_case("id") || segment.eq_ignore_ascii_case("uri") {
                segment.to_uppercase()
            } else {
                let mut chars = segment.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str().to_lowercase().as_str(),
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_cases_warc_token() {
        assert_eq!(title_case("warc-type"), "WARC-Type");
        assert_eq!(title_case("warc-record-id"), "WARC-Record-ID");
        assert_eq!(title_case("content-length"), "Content-Length");
        assert_eq!(title_case("warc-target-uri"), "WARC-Target-URI");
    }

    #[test]
    fn get_is_case_insensitive() {
        let mut h = WarcHeaders::new();
        h.set("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn set_preserves_first_seen_case() {
        let mut h = WarcHeaders::new();
        h.push_raw("x-custom".to_string(), "1".to_string());
        h.set("X-Custom", "2");
        assert_eq!(h.iter().next(), Some(("x-custom", "2")));
    }

    #[test]
    fn canonical_order_before_extras() {
        let mut h = WarcHeaders::new();
        h.set("X-Extra", "z");
        h.set("Content-Length", "5");
        h.set("WARC-Type", "resource");
        let rendered = h.render_ordered();
        assert_eq!(rendered[0].0, "WARC-Type");
        assert_eq!(rendered.last().unwrap().0, "X-Extra");
    }
}
