/// Header map with case-insensitive names.
///
/// Insertion keeps the first spelling of a name and its position. A repeated
/// name replaces the earlier value, except for list-valued headers whose
/// values are joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

/// Headers whose repeated occurrences are combined instead of overwritten.
const LIST_VALUED: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "connection",
    "cookie",
    "forwarded",
    "if-match",
    "if-none-match",
    "pragma",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "via",
    "warning",
    "x-forwarded-for",
];

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header as received on the wire.
    pub fn append(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) if is_list_valued(name) => {
                let sep = if name.eq_ignore_ascii_case("cookie") { "; " } else { ", " };
                let existing = &mut self.entries[i].1;
                if existing.is_empty() {
                    existing.push_str(value);
                } else if !value.is_empty() {
                    existing.push_str(sep);
                    existing.push_str(value);
                }
            }
            Some(i) => self.entries[i].1 = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// Sets a header, replacing any previous value regardless of kind.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    /// True when the comma-separated header `name` lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

fn is_list_valued(name: &str) -> bool {
    LIST_VALUED.iter().any(|h| h.eq_ignore_ascii_case(name))
}
