use anyhow::{Context, Result};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::rules::PhoneticRules;

pub fn first_char(word: &str) -> Option<char> {
    word.chars().next()
}

pub fn last_char(word: &str) -> Option<char> {
    word.chars().last()
}

fn char_len(word: &str) -> usize {
    word.chars().count()
}

/// Strip all whitespace; chat input arrives with stray spaces.
pub fn normalize_word(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// The loaded corpus: membership set plus a per-first-syllable index whose
/// buckets are ordered longest-first, then lexicographically. The move
/// generator and the minimax opponent both lean on that ordering.
#[derive(Debug, Clone, Default)]
pub struct WordIndex {
    words: HashSet<String>,
    by_first: HashMap<char, Vec<String>>,
}

impl WordIndex {
    pub fn from_words(words: impl IntoIterator<Item = String>) -> Self {
        let words: HashSet<String> = words
            .into_iter()
            .filter(|w| char_len(w) >= 2)
            .collect();

        let mut by_first: HashMap<char, Vec<String>> = HashMap::new();
        for w in &words {
            if let Some(c) = first_char(w) {
                by_first.entry(c).or_default().push(w.clone());
            }
        }
        for bucket in by_first.values_mut() {
            bucket.sort_by(|a, b| char_len(b).cmp(&char_len(a)).then_with(|| a.cmp(b)));
        }

        Self { words, by_first }
    }

    /// One token per line, UTF-8; blank lines and `#` comments skipped.
    pub fn load_file(path: &Path) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read word list {}", path.display()))?;
        Ok(parse_word_lines(&text))
    }

    /// Merge several word files (cache preferred, local fallback). Missing
    /// files are skipped; an entirely empty corpus is an error.
    pub fn load_files(paths: &[&Path]) -> Result<Self> {
        let mut words = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            words.extend(Self::load_file(path)?);
        }
        anyhow::ensure!(!words.is_empty(), "no dictionary words loaded");
        Ok(Self::from_words(words))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    pub fn bucket(&self, first: char) -> &[String] {
        self.by_first.get(&first).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.words.iter()
    }

    /// Is there any unused word that may follow `last`?
    pub fn has_follow(&self, last: char, rules: &PhoneticRules, used: &HashSet<String>) -> bool {
        rules
            .allowed_first_chars(last)
            .into_iter()
            .any(|c| self.bucket(c).iter().any(|w| !used.contains(w)))
    }

    /// Pick a starting word that has at least one legal follow.
    pub fn choose_start_word(
        &self,
        rules: &PhoneticRules,
        rng: &mut impl Rng,
    ) -> Option<String> {
        let mut candidates: Vec<&String> = Vec::new();
        for w in &self.words {
            let Some(last) = last_char(w) else { continue };
            let mut used = HashSet::new();
            used.insert(w.clone());
            if self.has_follow(last, rules, &used) {
                candidates.push(w);
            }
        }
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rng.gen_range(0..candidates.len())].clone())
    }
}

pub fn parse_word_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|w| !w.is_empty() && !w.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}
