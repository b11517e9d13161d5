// =============================================================================
// Command Matcher — structured trading notation and fuzzy phrase matching
// =============================================================================
//
// The last two stages of the matching pipeline:
//
//   Structured notation, hand-parsed:
//     long 50000 BYND @ 0.55      short 10k @ market
//     buy 500 TSLA                sell all | sell half | sell 25% | sell 3000
//     add 200                     scaleout fast|medium|slow
//
//   Fuzzy phrase match: normalized Levenshtein similarity against the phrase
//   table, last resort with a 0.8 floor.
// =============================================================================

use crate::types::Side;

/// Similarity floor for the fuzzy stage.
pub const FUZZY_THRESHOLD: f64 = 0.8;

// =============================================================================
// Structured notation
// =============================================================================

/// Quantity selector for sell-style commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QtySpec {
    Shares(f64),
    Percent(f64),
    Half,
    All,
}

/// Scale worker speed selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedSpec {
    Fast,
    Medium,
    Slow,
}

/// A structurally parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCommand {
    /// `long`/`short`/`buy` with optional quantity, symbol, and limit price.
    /// A missing price means market.
    Entry {
        side: Side,
        qty: Option<f64>,
        symbol: Option<String>,
        price: Option<f64>,
    },
    /// `sell …` quantity selectors (partial or full exit).
    Sell { qty: QtySpec },
    /// `add <N>` same-side accumulation.
    Add { qty: f64 },
    /// `scaleout [speed]`.
    Scaleout { speed: Option<SpeedSpec> },
    /// `scalein <N> [speed]`.
    Scalein { qty: f64, speed: Option<SpeedSpec> },
}

/// Parse `1k` / `2.5k` / `1m` / plain-number quantities.
fn parse_qty(token: &str) -> Option<f64> {
    let t = token.trim().to_lowercase();
    if t.is_empty() {
        return None;
    }
    let (num, mult) = if let Some(stripped) = t.strip_suffix('k') {
        (stripped, 1_000.0)
    } else if let Some(stripped) = t.strip_suffix('m') {
        (stripped, 1_000_000.0)
    } else {
        (t.as_str(), 1.0)
    };
    let value: f64 = num.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some(value * mult)
}

fn parse_speed(token: &str) -> Option<SpeedSpec> {
    match token.to_lowercase().as_str() {
        "fast" => Some(SpeedSpec::Fast),
        "medium" | "med" => Some(SpeedSpec::Medium),
        "slow" => Some(SpeedSpec::Slow),
        _ => None,
    }
}

/// Ticker-shaped token: 1-5 uppercase letters.
fn parse_symbol(token: &str) -> Option<String> {
    let t = token.trim();
    if (1..=5).contains(&t.len()) && t.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(t.to_uppercase())
    } else {
        None
    }
}

/// Parse structured trading notation. Returns `None` when the input is not
/// structurally recognizable (the pipeline then falls through to fuzzy).
pub fn parse_structured(input: &str) -> Option<ParsedCommand> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    let head = tokens[0].to_lowercase();

    match head.as_str() {
        "long" | "buy" | "short" => {
            let side = if head == "short" {
                Side::Short
            } else {
                Side::Long
            };
            let mut qty = None;
            let mut symbol = None;
            let mut price = None;
            let mut i = 1;
            while i < tokens.len() {
                let tok = tokens[i];
                if tok == "@" {
                    // `@ market` or `@ 0.55`
                    let next = tokens.get(i + 1)?;
                    if next.eq_ignore_ascii_case("market") {
                        price = None;
                    } else {
                        price = Some(next.parse::<f64>().ok()?);
                    }
                    i += 2;
                    continue;
                }
                if let Some(p) = tok.strip_prefix('@') {
                    if p.eq_ignore_ascii_case("market") {
                        price = None;
                    } else {
                        price = Some(p.parse::<f64>().ok()?);
                    }
                    i += 1;
                    continue;
                }
                if qty.is_none() {
                    if let Some(q) = parse_qty(tok) {
                        qty = Some(q);
                        i += 1;
                        continue;
                    }
                }
                if symbol.is_none() {
                    if let Some(s) = parse_symbol(tok) {
                        symbol = Some(s);
                        i += 1;
                        continue;
                    }
                }
                return None;
            }
            Some(ParsedCommand::Entry {
                side,
                qty,
                symbol,
                price,
            })
        }
        "sell" => {
            let arg = tokens.get(1)?;
            let qty = if arg.eq_ignore_ascii_case("all") {
                QtySpec::All
            } else if arg.eq_ignore_ascii_case("half") {
                QtySpec::Half
            } else if let Some(pct) = arg.strip_suffix('%') {
                let p: f64 = pct.parse().ok()?;
                if !(0.0..=100.0).contains(&p) {
                    return None;
                }
                QtySpec::Percent(p)
            } else {
                QtySpec::Shares(parse_qty(arg)?)
            };
            if tokens.len() > 2 {
                return None;
            }
            Some(ParsedCommand::Sell { qty })
        }
        "add" => {
            let qty = parse_qty(tokens.get(1)?)?;
            Some(ParsedCommand::Add { qty })
        }
        "scaleout" => {
            let speed = match tokens.get(1) {
                Some(tok) => Some(parse_speed(tok)?),
                None => None,
            };
            Some(ParsedCommand::Scaleout { speed })
        }
        "scalein" => {
            let qty = parse_qty(tokens.get(1)?)?;
            let speed = match tokens.get(2) {
                Some(tok) => Some(parse_speed(tok)?),
                None => None,
            };
            Some(ParsedCommand::Scalein { qty, speed })
        }
        _ => None,
    }
}

// =============================================================================
// Fuzzy matching
// =============================================================================

/// Levenshtein edit distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Similarity in [0, 1]: 1 − distance / max_len.
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Best fuzzy match over `(phrase, confidence)` rows: the candidate with the
/// highest `similarity * confidence` above the similarity floor.
pub fn best_fuzzy_match<'a, T>(
    input: &str,
    candidates: impl Iterator<Item = (&'a str, f64, T)>,
) -> Option<(T, f64)> {
    let mut best: Option<(T, f64)> = None;
    for (phrase, confidence, payload) in candidates {
        let sim = normalized_similarity(input, phrase);
        if sim < FUZZY_THRESHOLD {
            continue;
        }
        let score = sim * confidence;
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((payload, score));
        }
    }
    best
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_entry_notation() {
        let parsed = parse_structured("long 50000 BYND @ 0.55").unwrap();
        assert_eq!(
            parsed,
            ParsedCommand::Entry {
                side: Side::Long,
                qty: Some(50_000.0),
                symbol: Some("BYND".into()),
                price: Some(0.55),
            }
        );
    }

    #[test]
    fn parses_market_entry() {
        let parsed = parse_structured("short 10k @ market").unwrap();
        assert_eq!(
            parsed,
            ParsedCommand::Entry {
                side: Side::Short,
                qty: Some(10_000.0),
                symbol: None,
                price: None,
            }
        );
    }

    #[test]
    fn buy_is_long() {
        let parsed = parse_structured("buy 500 TSLA").unwrap();
        match parsed {
            ParsedCommand::Entry { side, qty, symbol, price } => {
                assert_eq!(side, Side::Long);
                assert_eq!(qty, Some(500.0));
                assert_eq!(symbol.as_deref(), Some("TSLA"));
                assert!(price.is_none());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn bare_side_is_market_entry_without_qty() {
        let parsed = parse_structured("long").unwrap();
        assert_eq!(
            parsed,
            ParsedCommand::Entry {
                side: Side::Long,
                qty: None,
                symbol: None,
                price: None,
            }
        );
    }

    #[test]
    fn sell_variants() {
        assert_eq!(
            parse_structured("sell all").unwrap(),
            ParsedCommand::Sell { qty: QtySpec::All }
        );
        assert_eq!(
            parse_structured("sell half").unwrap(),
            ParsedCommand::Sell { qty: QtySpec::Half }
        );
        assert_eq!(
            parse_structured("sell 25%").unwrap(),
            ParsedCommand::Sell {
                qty: QtySpec::Percent(25.0)
            }
        );
        assert_eq!(
            parse_structured("sell 3000").unwrap(),
            ParsedCommand::Sell {
                qty: QtySpec::Shares(3000.0)
            }
        );
        assert!(parse_structured("sell 150%").is_none());
        assert!(parse_structured("sell").is_none());
    }

    #[test]
    fn add_and_scale_commands() {
        assert_eq!(
            parse_structured("add 200").unwrap(),
            ParsedCommand::Add { qty: 200.0 }
        );
        assert_eq!(
            parse_structured("scaleout fast").unwrap(),
            ParsedCommand::Scaleout {
                speed: Some(SpeedSpec::Fast)
            }
        );
        assert_eq!(
            parse_structured("scaleout").unwrap(),
            ParsedCommand::Scaleout { speed: None }
        );
        assert_eq!(
            parse_structured("scalein 5000 slow").unwrap(),
            ParsedCommand::Scalein {
                qty: 5000.0,
                speed: Some(SpeedSpec::Slow)
            }
        );
    }

    #[test]
    fn quantity_suffixes() {
        assert_eq!(parse_qty("1k"), Some(1_000.0));
        assert_eq!(parse_qty("2.5k"), Some(2_500.0));
        assert_eq!(parse_qty("1m"), Some(1_000_000.0));
        assert_eq!(parse_qty("750"), Some(750.0));
        assert!(parse_qty("-5").is_none());
        assert!(parse_qty("abc").is_none());
    }

    #[test]
    fn garbage_is_not_structured() {
        assert!(parse_structured("what is the weather").is_none());
        assert!(parse_structured("").is_none());
        assert!(parse_structured("long !!!! ????").is_none());
    }

    #[test]
    fn levenshtein_similarity() {
        assert_eq!(normalized_similarity("close", "close"), 1.0);
        assert!(normalized_similarity("close", "clsoe") >= 0.6);
        assert!(normalized_similarity("close", "banana") < 0.5);
        // Case and surrounding space insensitive.
        assert_eq!(normalized_similarity(" CLOSE ", "close"), 1.0);
    }

    #[test]
    fn fuzzy_picks_best_scored_candidate() {
        let candidates = vec![
            ("get me out", 0.9, "close"),
            ("get me outta here", 0.95, "close_all"),
            ("flip it", 0.9, "reverse"),
        ];
        let (payload, score) = best_fuzzy_match(
            "get me out",
            candidates.iter().map(|(p, c, h)| (*p, *c, *h)),
        )
        .unwrap();
        assert_eq!(payload, "close");
        assert!(score > 0.8);

        assert!(best_fuzzy_match(
            "completely unrelated input",
            candidates.iter().map(|(p, c, h)| (*p, *c, *h)),
        )
        .is_none());
    }
}
