use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Phonetic-equivalence rules for the follow check: a word may start with the
/// previous word's last syllable or any syllable related to it under Korean
/// initial-sound shifts (두음법칙), in either direction.
#[derive(Debug, Clone, Default)]
pub struct PhoneticRules {
    forward: HashMap<char, BTreeSet<char>>,
    inverse: HashMap<char, BTreeSet<char>>,
}

/// Built-in initial-sound map, used when no rules file is available.
const DEFAULT_RULES: &[(char, char)] = &[
    ('녀', '여'),
    ('녁', '역'),
    ('년', '연'),
    ('녈', '열'),
    ('념', '염'),
    ('녑', '엽'),
    ('녓', '엿'),
    ('녕', '영'),
    ('뇨', '요'),
    ('뇰', '욜'),
    ('뇽', '용'),
    ('뉴', '유'),
    ('뉵', '육'),
    ('늄', '윰'),
    ('늉', '융'),
    ('니', '이'),
    ('닉', '익'),
    ('닌', '인'),
    ('닐', '일'),
    ('님', '임'),
    ('닙', '입'),
    ('닛', '잇'),
    ('닝', '잉'),
    ('닢', '잎'),
    ('라', '나'),
    ('락', '낙'),
    ('란', '난'),
    ('랄', '날'),
    ('람', '남'),
    ('랍', '납'),
    ('랏', '낫'),
    ('랑', '낭'),
    ('래', '내'),
    ('랙', '낵'),
    ('랜', '낸'),
    ('랠', '낼'),
    ('램', '냄'),
    ('랩', '냅'),
    ('랫', '냇'),
    ('랭', '냉'),
    ('러', '너'),
    ('럭', '넉'),
    ('런', '넌'),
    ('럴', '널'),
    ('럼', '넘'),
    ('럽', '넙'),
    ('럿', '넛'),
    ('렁', '넝'),
    ('레', '네'),
    ('렉', '넥'),
    ('렌', '넨'),
    ('렐', '넬'),
    ('렘', '넴'),
    ('렙', '넵'),
    ('렛', '넷'),
    ('렝', '넹'),
    ('려', '여'),
    ('력', '역'),
    ('련', '연'),
    ('렬', '열'),
    ('렴', '염'),
    ('렵', '엽'),
    ('렷', '엿'),
    ('령', '영'),
    ('례', '예'),
    ('로', '노'),
    ('록', '녹'),
    ('론', '논'),
    ('롤', '놀'),
    ('롬', '놈'),
    ('롭', '놉'),
    ('롯', '놋'),
    ('료', '요'),
    ('룡', '용'),
    ('루', '누'),
    ('륙', '육'),
    ('륜', '윤'),
    ('률', '율'),
    ('륭', '융'),
    ('를', '늘'),
    ('리', '이'),
    ('린', '인'),
    ('림', '임'),
    ('립', '입'),
];

impl PhoneticRules {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (char, char)>) -> Self {
        let mut rules = Self::default();
        for (left, right) in pairs {
            rules.forward.entry(left).or_default().insert(right);
            rules.inverse.entry(right).or_default().insert(left);
        }
        rules
    }

    pub fn default_rules() -> Self {
        Self::from_pairs(DEFAULT_RULES.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// `LEFT -> RIGHT1, RIGHT2` lines; `#` comments and malformed lines are
    /// skipped.
    fn parse_lines(text: &str) -> Self {
        let mut pairs = Vec::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((left, right)) = line.split_once("->") else {
                continue;
            };
            let Some(left) = left.trim().chars().next() else {
                continue;
            };
            for tok in right.split([',', ' ', '\t']) {
                if let Some(c) = tok.trim().chars().next() {
                    pairs.push((left, c));
                }
            }
        }
        Self::from_pairs(pairs)
    }

    /// JSON map format: `{ "left": ["r1", "r2"], "other": "r" }`.
    fn parse_json(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return Self::default();
        };
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let mut pairs = Vec::new();
        for (key, val) in obj {
            let Some(left) = key.chars().next() else {
                continue;
            };
            match val {
                serde_json::Value::String(s) => {
                    if let Some(c) = s.chars().next() {
                        pairs.push((left, c));
                    }
                }
                serde_json::Value::Array(items) => {
                    for item in items {
                        if let Some(c) = item.as_str().and_then(|s| s.chars().next()) {
                            pairs.push((left, c));
                        }
                    }
                }
                _ => {}
            }
        }
        Self::from_pairs(pairs)
    }

    /// Auto-detection order: line format first, JSON second, built-in map
    /// last. First match wins when both would parse.
    pub fn parse(text: &str) -> Self {
        let rules = Self::parse_lines(text);
        if !rules.is_empty() {
            return rules;
        }
        let rules = Self::parse_json(text);
        if !rules.is_empty() {
            return rules;
        }
        Self::default_rules()
    }

    pub fn load_from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                if path.exists() {
                    tracing::warn!(path = %path.display(), error = %e, "phonetic rules unreadable, using defaults");
                }
                Self::default_rules()
            }
        }
    }

    /// The symmetric closure around `last`: itself, its forward mappings, and
    /// everything that maps to it.
    pub fn allowed_first_chars(&self, last: char) -> BTreeSet<char> {
        let mut set = BTreeSet::new();
        set.insert(last);
        if let Some(outs) = self.forward.get(&last) {
            set.extend(outs.iter().copied());
        }
        if let Some(ins) = self.inverse.get(&last) {
            set.extend(ins.iter().copied());
        }
        set
    }
}
