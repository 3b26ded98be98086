use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.,!?;:'"’()\[\]]"#).expect("valid punctuation pattern"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Common short forms for states and groups that speeches and models use
/// interchangeably. Keys are in `key()` form.
const COUNTRY_ALIASES: &[(&str, &str)] = &[
    ("us", "United States"),
    ("usa", "United States"),
    ("united states of america", "United States"),
    ("america", "United States"),
    ("uk", "United Kingdom"),
    ("great britain", "United Kingdom"),
    ("britain", "United Kingdom"),
    ("ussr", "Soviet Union"),
    ("union of soviet socialist republics", "Soviet Union"),
    ("dprk", "Democratic People's Republic of Korea"),
    ("north korea", "Democratic People's Republic of Korea"),
    ("rok", "Republic of Korea"),
    ("south korea", "Republic of Korea"),
    ("prc", "China"),
    ("peoples republic of china", "China"),
    ("eu", "European Union"),
    ("un", "United Nations"),
];

/// Leading words of a formal state name, in `key()` form.
const FORMAL_PREFIXES: &[&str] = &[
    "the ",
    "republic of ",
    "kingdom of ",
    "state of ",
    "commonwealth of ",
    "federation of ",
    "principality of ",
    "sultanate of ",
    "grand duchy of ",
];

const MAX_ALIAS_HOPS: usize = 4;

/// Cleans theme and association strings and maps aliases to one display form.
pub struct TermNormalizer {
    /// Maps normalized key -> canonical display name
    aliases: HashMap<String, String>,
}

impl Default for TermNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TermNormalizer {
    pub fn new() -> Self {
        let aliases = COUNTRY_ALIASES
            .iter()
            .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
            .collect();
        Self { aliases }
    }

    pub fn with_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.aliases.insert(key(alias), canonical.to_string());
        self
    }

    /// Trim, collapse whitespace, and strip wrapping quotes or trailing
    /// punctuation. Returns `None` for strings that end up empty.
    pub fn clean(&self, term: &str) -> Option<String> {
        let collapsed = WHITESPACE.replace_all(term.trim(), " ");
        let cleaned = collapsed
            .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*'))
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':'))
            .trim();
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned.to_string())
        }
    }

    /// Clean a country or group name and resolve known aliases.
    pub fn association(&self, name: &str) -> Option<String> {
        let cleaned = self.clean(name)?;
        Some(
            self.aliases
                .get(&key(&cleaned))
                .cloned()
                .unwrap_or(cleaned),
        )
    }

    /// Whether two country names refer to the same state.
    ///
    /// Names match after alias resolution, or when one is the other with a
    /// formal prefix ("Republic of", "the", ...). A name contained in a longer
    /// one is a different state: Sudan is not South Sudan.
    pub fn same_country(&self, a: &str, b: &str) -> bool {
        match (self.country_key(a), self.country_key(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn country_key(&self, name: &str) -> Option<String> {
        let mut current = key(&self.association(name)?);
        // "the USA" only resolves once the article is gone; bounded so an
        // alias cycle cannot spin.
        for _ in 0..MAX_ALIAS_HOPS {
            current = strip_formal_prefixes(&current).to_string();
            match self.aliases.get(&current).map(|canonical| key(canonical)) {
                Some(resolved) if resolved != current => current = resolved,
                _ => break,
            }
        }
        let current = strip_formal_prefixes(&current);
        (!current.is_empty()).then(|| current.to_string())
    }
}

fn strip_formal_prefixes(name: &str) -> &str {
    let mut rest = name;
    while let Some(remaining) = FORMAL_PREFIXES
        .iter()
        .find_map(|prefix| rest.strip_prefix(prefix))
        .filter(|remaining| !remaining.is_empty())
    {
        rest = remaining;
    }
    rest
}

/// Case- and punctuation-insensitive comparison key.
pub fn key(term: &str) -> String {
    let lowered = term.to_lowercase().replace('&', " and ");
    let stripped = PUNCTUATION.replace_all(&lowered, "");
    WHITESPACE.replace_all(stripped.trim(), " ").to_string()
}

/// Case-insensitive set of terms that keeps the first spelling seen.
#[derive(Debug, Default, Clone)]
pub struct TermSet {
    entries: BTreeMap<String, String>,
}

impl TermSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, term: String) -> bool {
        let k = key(&term);
        if k.is_empty() || self.entries.contains_key(&k) {
            return false;
        }
        self.entries.insert(k, term);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Display forms ordered by key.
    pub fn into_vec(self) -> Vec<String> {
        self.entries.into_values().collect()
    }
}
