/// Sender allowlist: full addresses and bare domains (subdomains included).
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: Vec<String>,
}

impl Allowlist {
    /// Parse a comma-separated list. Entries are trimmed and lowercased; empty ones skipped.
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_whitelisted(&self, from: &str) -> bool {
        let address = bare_address(from).to_lowercase();
        let domain = address.rsplit_once('@').map(|(_, d)| d);

        self.entries.iter().any(|entry| {
            if entry.contains('@') {
                return *entry == address;
            }
            match domain {
                Some(d) => d == entry || address.ends_with(&format!(".{}", entry)),
                None => false,
            }
        })
    }
}

/// `Name <user@host>` → `user@host`; anything else is trimmed and returned as-is.
pub fn bare_address(value: &str) -> &str {
    let value = value.trim();
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if end > start => value[start + 1..end].trim(),
        _ => value,
    }
}
