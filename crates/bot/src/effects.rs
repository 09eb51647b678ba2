use common::config::Glitch;
use common::types::Weather;
use rand::Rng;

/// Sandstorm "radio noise" dressing for outgoing text. Readability first:
/// only a bounded share of tokens is touched, structural tokens (mentions,
/// URLs) are protected, and anything with backticks is left alone so code
/// and preformatted blocks never break.
const NOISE_MARKS: [&str; 3] = ["…", "…zzt…", "##"];

fn is_protected_token(tok: &str) -> bool {
    if tok.is_empty() {
        return true;
    }
    if tok.starts_with("<@") || tok.starts_with("<#") {
        return true;
    }
    let lower = tok.to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_punctuation_only(tok: &str) -> bool {
    tok.chars().all(|c| ".?!,~…#/".contains(c))
}

fn glitch_word(word: &str, rng: &mut impl Rng) -> String {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= 2 {
        return format!("{word}{}", NOISE_MARKS[rng.gen_range(0..NOISE_MARKS.len())]);
    }

    let mode: f64 = rng.gen();
    if mode < 0.50 {
        // Insert a mark mid-word.
        let cut = rng.gen_range(1..chars.len());
        let mark = NOISE_MARKS[rng.gen_range(0..NOISE_MARKS.len())];
        let head: String = chars[..cut].iter().collect();
        let tail: String = chars[cut..].iter().collect();
        return format!("{head}{mark}{tail}");
    }
    if mode < 0.60 {
        return if rng.gen_bool(0.5) { "(static)" } else { "…zzt…" }.to_string();
    }
    format!("{word}{}", ["…", "##", "//"][rng.gen_range(0..3)])
}

/// Glitch at most `max_ratio` of the tokens (clamped to 0.35).
pub fn apply_glitch(text: &str, max_ratio: f64, rng: &mut impl Rng) -> String {
    if text.is_empty() || text.contains('`') {
        return text.to_string();
    }

    let mut tokens: Vec<String> = text.split(' ').map(ToString::to_string).collect();
    if tokens.len() <= 1 {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() < 4 {
            return format!("{text}…");
        }
        let pos = rng.gen_range(1..chars.len());
        let head: String = chars[..pos].iter().collect();
        let tail: String = chars[pos..].iter().collect();
        return format!("{head}{}{tail}", ["…", "…zzt…"][rng.gen_range(0..2)]);
    }

    let candidates: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, tok)| !is_protected_token(tok) && !is_punctuation_only(tok))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return text.to_string();
    }

    let ratio = max_ratio.clamp(0.0, 0.35);
    let mut n = ((tokens.len() as f64) * ratio) as usize;
    if n == 0 {
        n = 1;
    }
    n = n.min(candidates.len());

    // Sample without replacement.
    let mut picks = candidates;
    for i in 0..n {
        let j = rng.gen_range(i..picks.len());
        picks.swap(i, j);
    }
    for &idx in &picks[..n] {
        tokens[idx] = glitch_word(&tokens[idx], rng);
    }

    let mut out = tokens.join(" ");
    if rng.gen::<f64>() < 0.18 {
        let mark = ["…zzt…", "…", "(static)"][rng.gen_range(0..3)];
        out = if rng.gen_bool(0.5) {
            format!("{mark} {out}")
        } else {
            format!("{out} {mark}")
        };
    }
    out
}

/// Split a long message in two near the middle, preferring a newline, to
/// mimic a transmission hiccup.
pub fn split_for_radio(text: &str) -> Vec<String> {
    if text.chars().count() < 80 || text.contains('`') {
        return vec![text.to_string()];
    }

    if text.contains('\n') {
        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() >= 2 {
            let mid = lines.len() / 2;
            let p1 = lines[..mid].join("\n").trim().to_string();
            let p2 = lines[mid..].join("\n").trim().to_string();
            if !p1.is_empty() && !p2.is_empty() {
                return vec![p1, p2];
            }
        }
    }

    let tokens: Vec<&str> = text.split(' ').collect();
    if tokens.len() < 6 {
        return vec![text.to_string()];
    }
    let mid = tokens.len() / 2;
    let p1 = tokens[..mid].join(" ").trim().to_string();
    let p2 = tokens[mid..].join(" ").trim().to_string();
    if p1.is_empty() || p2.is_empty() {
        return vec![text.to_string()];
    }
    vec![p1, p2]
}

/// Shape one outgoing message according to the glitch knobs and the current
/// weather. Returns the pieces to send in order.
pub fn radio_shape(
    cfg: &Glitch,
    weather: Weather,
    text: &str,
    rng: &mut impl Rng,
) -> Vec<String> {
    let stormy = cfg.force || weather == Weather::Sandstorm;
    if !stormy || rng.gen::<f64>() >= cfg.chance {
        return vec![text.to_string()];
    }

    let glitched = apply_glitch(text, cfg.max_ratio, rng);
    if rng.gen::<f64>() < cfg.split_chance {
        split_for_radio(&glitched)
    } else {
        vec![glitched]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_backticked_text_untouched() {
        let mut rng = rng();
        let text = "run `cargo build` first";
        assert_eq!(apply_glitch(text, 0.2, &mut rng), text);
        assert_eq!(split_for_radio(&"x `y` ".repeat(30)), vec!["x `y` ".repeat(30)]);
    }

    #[test]
    fn test_mentions_and_urls_survive() {
        let mut rng = rng();
        for _ in 0..50 {
            let out = apply_glitch(
                "<@123> look at https://example.com now please friend",
                0.35,
                &mut rng,
            );
            assert!(out.contains("<@123>"));
            assert!(out.contains("https://example.com"));
        }
    }

    #[test]
    fn test_glitch_changes_something() {
        let mut rng = rng();
        let text = "the sandstorm is heavy out here tonight friends";
        let mut changed = false;
        for _ in 0..10 {
            if apply_glitch(text, 0.2, &mut rng) != text {
                changed = true;
            }
        }
        assert!(changed);
    }

    #[test]
    fn test_split_for_radio_prefers_newline() {
        let text = format!("{}\n{}", "first half of the report ".repeat(4), "second half of the report ".repeat(4));
        let parts = split_for_radio(&text);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].contains("first half"));
        assert!(parts[1].contains("second half"));
    }

    #[test]
    fn test_short_text_not_split() {
        assert_eq!(split_for_radio("short"), vec!["short".to_string()]);
    }

    #[test]
    fn test_radio_shape_clear_weather_passthrough() {
        let cfg = Glitch {
            force: false,
            chance: 1.0,
            split_chance: 0.0,
            max_ratio: 0.2,
        };
        let mut rng = rng();
        let parts = radio_shape(&cfg, Weather::Clear, "hello there friend", &mut rng);
        assert_eq!(parts, vec!["hello there friend".to_string()]);
    }

    #[test]
    fn test_radio_shape_force_glitches() {
        let cfg = Glitch {
            force: true,
            chance: 1.0,
            split_chance: 0.0,
            max_ratio: 0.35,
        };
        let mut rng = rng();
        let mut changed = false;
        for _ in 0..10 {
            let parts = radio_shape(&cfg, Weather::Clear, "a perfectly ordinary status update", &mut rng);
            assert_eq!(parts.len(), 1);
            if parts[0] != "a perfectly ordinary status update" {
                changed = true;
            }
        }
        assert!(changed);
    }
}
