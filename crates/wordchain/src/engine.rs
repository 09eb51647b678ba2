use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::dict::{last_char, WordIndex};
use crate::rules::PhoneticRules;

/// Root candidates considered by the search.
const ROOT_CAP: usize = 60;
/// Prefix of the root candidates scanned for an immediate win.
const IMMEDIATE_WIN_SCAN: usize = 30;

pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_millis(1200);

const LOSS: i32 = -9999;
const WIN: i32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    Normal,
    Hard,
}

impl Difficulty {
    pub fn depth(&self) -> u32 {
        match self {
            Difficulty::Easy => 4,
            Difficulty::Normal => 10,
            Difficulty::Hard => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Normal => "normal",
            Difficulty::Hard => "hard",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "normal" => Some(Difficulty::Normal),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

/// All unused legal follows of `last`, ordered longest-first then lex.
pub fn gen_candidates(
    index: &WordIndex,
    rules: &PhoneticRules,
    last: char,
    used: &HashSet<String>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in rules.allowed_first_chars(last) {
        for cand in index.bucket(c) {
            if !used.contains(cand) {
                out.push(cand.clone());
            }
        }
    }
    out.sort_by(|a, b| {
        b.chars()
            .count()
            .cmp(&a.chars().count())
            .then_with(|| a.cmp(b))
    });
    out
}

fn evaluate_leaf(
    index: &WordIndex,
    rules: &PhoneticRules,
    last: char,
    used: &HashSet<String>,
) -> i32 {
    if !index.has_follow(last, rules, used) {
        return LOSS;
    }
    0
}

/// Plain alpha-beta on the follow graph. The deadline is threaded in as a
/// value; a node past the deadline returns a neutral score and unwinds, no
/// unwinding-by-panic anywhere.
#[allow(clippy::too_many_arguments)]
fn minimax(
    index: &WordIndex,
    rules: &PhoneticRules,
    last: char,
    used: &mut HashSet<String>,
    depth: u32,
    mut alpha: i32,
    mut beta: i32,
    maximizing: bool,
    start: Instant,
    limit: Duration,
) -> i32 {
    if start.elapsed() > limit {
        return 0;
    }
    if depth == 0 {
        return evaluate_leaf(index, rules, last, used);
    }

    let moves = gen_candidates(index, rules, last, used);
    if moves.is_empty() {
        return if maximizing { LOSS } else { WIN };
    }

    if maximizing {
        let mut best = i32::MIN;
        for word in moves {
            let next_last = last_char(&word).unwrap_or(last);
            used.insert(word.clone());
            let score = minimax(
                index, rules, next_last, used, depth - 1, alpha, beta, false, start, limit,
            );
            used.remove(&word);
            best = best.max(score);
            alpha = alpha.max(score);
            if alpha >= beta {
                break;
            }
        }
        best
    } else {
        let mut best = i32::MAX;
        for word in moves {
            let next_last = last_char(&word).unwrap_or(last);
            used.insert(word.clone());
            let score = minimax(
                index, rules, next_last, used, depth - 1, alpha, beta, true, start, limit,
            );
            used.remove(&word);
            best = best.min(score);
            beta = beta.min(score);
            if alpha >= beta {
                break;
            }
        }
        best
    }
}

/// Pick the engine's next word, or `None` to resign.
///
/// Order of business: immediate-win scan over the first 30 candidates, then
/// bounded alpha-beta over the first 60 under the wall-clock deadline. Every
/// returned word is a legal follow by construction.
pub fn select_bot_word(
    index: &WordIndex,
    rules: &PhoneticRules,
    current_word: &str,
    used: &HashSet<String>,
    depth: u32,
    limit: Duration,
) -> Option<String> {
    let start = Instant::now();
    let last = last_char(current_word)?;

    let roots = gen_candidates(index, rules, last, used);
    if roots.is_empty() {
        return None;
    }

    let mut scratch = used.clone();

    // A candidate that leaves the opponent no move wins outright; prefer the
    // longest such word (the list is already in that order).
    for word in roots.iter().take(IMMEDIATE_WIN_SCAN) {
        let word_last = last_char(word)?;
        scratch.insert(word.clone());
        let opponent_stuck = !index.has_follow(word_last, rules, &scratch);
        scratch.remove(word);
        if opponent_stuck {
            return Some(word.clone());
        }
    }

    let mut best_score = i32::MIN;
    let mut best_word: Option<String> = None;
    for word in roots.iter().take(ROOT_CAP) {
        if start.elapsed() > limit {
            break;
        }
        let word_last = last_char(word)?;
        scratch.insert(word.clone());
        let score = minimax(
            index,
            rules,
            word_last,
            &mut scratch,
            depth.saturating_sub(1),
            i32::MIN + 1,
            i32::MAX - 1,
            false,
            start,
            limit,
        );
        scratch.remove(word);
        if score > best_score {
            best_score = score;
            best_word = Some(word.clone());
        }
    }

    // Deadline hit before anything scored: fall back to the first legal
    // candidate rather than resigning a winnable position.
    best_word.or_else(|| roots.first().cloned())
}
