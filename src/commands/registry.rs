// =============================================================================
// Command Registry — database-driven command table and the matching pipeline
// =============================================================================
//
// Commands, aliases, and natural-language phrases live in the database
// (`trade_commands` / `trade_aliases` / `trade_phrases`) and are loaded once
// at startup; a built-in seed set is installed on first run.  The registry is
// hot-reloadable.
//
// Matching priority:
//   1. exact command name
//   2. alias
//   3. phrase (highest confidence on ties)
//   4. structured trading notation (hand-parsed)
//   5. fuzzy phrase match (last resort)
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::commands::matcher::{
    best_fuzzy_match, parse_structured, ParsedCommand,
};
use crate::storage::db::Database;
use crate::types::Side;

// =============================================================================
// Spec rows
// =============================================================================

/// One registry row: a command with its aliases and phrases.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub handler_key: String,
    pub category: String,
    pub aliases: Vec<String>,
    /// `(phrase, confidence)`.
    pub phrases: Vec<(String, f64)>,
    pub is_implemented: bool,
}

impl CommandSpec {
    fn new(
        name: &str,
        handler_key: &str,
        category: &str,
        aliases: &[&str],
        phrases: &[(&str, f64)],
    ) -> Self {
        Self {
            name: name.into(),
            handler_key: handler_key.into(),
            category: category.into(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            phrases: phrases
                .iter()
                .map(|(p, c)| (p.to_string(), *c))
                .collect(),
            is_implemented: true,
        }
    }

    fn unimplemented(mut self) -> Self {
        self.is_implemented = false;
        self
    }
}

/// The built-in command set, installed on first run.
pub fn builtin_commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec::new(
            "long",
            "enter_long",
            "entry",
            &["buy"],
            &[("go long", 0.9), ("get me in", 0.75)],
        ),
        CommandSpec::new("short", "enter_short", "entry", &[], &[("go short", 0.9)]),
        CommandSpec::new(
            "close",
            "close_position",
            "exit",
            &["exit", "flat", "flatten"],
            &[("get me out", 0.9), ("close it", 0.95), ("close position", 0.95)],
        ),
        CommandSpec::new(
            "scaleout",
            "scaleout",
            "exit",
            &["scale-out"],
            &[("scale me out", 0.9)],
        ),
        CommandSpec::new("scalein", "scalein", "entry", &["scale-in"], &[]),
        CommandSpec::new(
            "accumulate",
            "accumulate",
            "entry",
            &["add"],
            &[("add to position", 0.9)],
        ),
        CommandSpec::new(
            "reverse",
            "reverse",
            "entry",
            &["flip"],
            &[("flip it", 0.85), ("reverse position", 0.9)],
        ),
        CommandSpec::new(
            "reverse-smart",
            "reverse_smart",
            "entry",
            &["smart-reverse"],
            &[],
        ),
        CommandSpec::new("stop", "set_stop", "risk", &[], &[("set a stop", 0.9)]),
        CommandSpec::new("bracket", "set_bracket", "risk", &[], &[]),
        CommandSpec::new(
            "pos",
            "pnl_query",
            "query",
            &["pl", "pnl", "profit"],
            &[("how am i doing", 0.8), ("whats my pnl", 0.85)],
        ),
        CommandSpec::new(
            "reset",
            "reset_session",
            "session",
            &[],
            &[("reset the session", 0.9)],
        ),
        CommandSpec::new(
            "cancel",
            "cancel_scale",
            "exit",
            &["stop-scale"],
            &[("cancel the scaleout", 0.9)],
        ),
        CommandSpec::new("hedge", "hedge", "entry", &[], &[("hedge me", 0.8)])
            .unimplemented(),
    ]
}

// =============================================================================
// Match result
// =============================================================================

/// How the input matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Alias,
    Phrase,
    Structured,
    Fuzzy,
}

/// A resolved command ready for dispatch.
#[derive(Debug, Clone)]
pub struct CommandMatch {
    pub command_name: String,
    pub handler_key: String,
    pub is_implemented: bool,
    pub kind: MatchKind,
    /// Structured parameters when stage 4 produced the match (or enriched a
    /// name-only match).
    pub parsed: Option<ParsedCommand>,
}

// =============================================================================
// Registry
// =============================================================================

pub struct CommandRegistry {
    specs: RwLock<Vec<CommandSpec>>,
    db: Option<Arc<Database>>,
}

impl CommandRegistry {
    /// Load from the database, seeding the built-in set on first run.
    pub fn load(db: Arc<Database>) -> Result<Self> {
        db.seed_command_registry(&builtin_commands())?;
        let specs = db.load_command_registry()?;
        info!(commands = specs.len(), "command registry loaded");
        Ok(Self {
            specs: RwLock::new(specs),
            db: Some(db),
        })
    }

    /// Registry backed only by the built-in set (tests, no-db mode).
    pub fn in_memory() -> Self {
        Self {
            specs: RwLock::new(builtin_commands()),
            db: None,
        }
    }

    /// Hot-reload from the database. Returns the command count.
    pub fn reload(&self) -> Result<usize> {
        if let Some(db) = &self.db {
            let specs = db.load_command_registry()?;
            let count = specs.len();
            *self.specs.write() = specs;
            info!(commands = count, "command registry reloaded");
            Ok(count)
        } else {
            Ok(self.specs.read().len())
        }
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.specs.read().clone()
    }

    fn find(&self, name: &str) -> Option<CommandSpec> {
        self.specs
            .read()
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    fn by_handler(&self, handler_key: &str) -> Option<CommandSpec> {
        self.specs
            .read()
            .iter()
            .find(|s| s.handler_key == handler_key)
            .cloned()
    }

    /// Run the full matching pipeline over one user message.
    pub fn match_input(&self, input: &str) -> Option<CommandMatch> {
        let normalized = input.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }

        let specs = self.specs.read();

        // 1. Exact command name.
        if let Some(spec) = specs.iter().find(|s| s.name == normalized) {
            return Some(CommandMatch {
                command_name: spec.name.clone(),
                handler_key: spec.handler_key.clone(),
                is_implemented: spec.is_implemented,
                kind: MatchKind::Exact,
                parsed: None,
            });
        }

        // 2. Alias.
        if let Some(spec) = specs
            .iter()
            .find(|s| s.aliases.iter().any(|a| a.to_lowercase() == normalized))
        {
            return Some(CommandMatch {
                command_name: spec.name.clone(),
                handler_key: spec.handler_key.clone(),
                is_implemented: spec.is_implemented,
                kind: MatchKind::Alias,
                parsed: None,
            });
        }

        // 3. Phrase (highest confidence on ties).
        let mut phrase_hit: Option<(&CommandSpec, f64)> = None;
        for spec in specs.iter() {
            for (phrase, confidence) in &spec.phrases {
                if phrase.to_lowercase() == normalized {
                    if phrase_hit.map_or(true, |(_, c)| *confidence > c) {
                        phrase_hit = Some((spec, *confidence));
                    }
                }
            }
        }
        if let Some((spec, _)) = phrase_hit {
            return Some(CommandMatch {
                command_name: spec.name.clone(),
                handler_key: spec.handler_key.clone(),
                is_implemented: spec.is_implemented,
                kind: MatchKind::Phrase,
                parsed: None,
            });
        }
        drop(specs);

        // 4. Structured trading notation.
        if let Some(parsed) = parse_structured(&normalized) {
            let handler_key = match &parsed {
                ParsedCommand::Entry { side: Side::Long, .. } => "enter_long",
                ParsedCommand::Entry { side: Side::Short, .. } => "enter_short",
                ParsedCommand::Sell { .. } => "sell_quantity",
                ParsedCommand::Add { .. } => "accumulate",
                ParsedCommand::Scaleout { .. } => "scaleout",
                ParsedCommand::Scalein { .. } => "scalein",
            };
            // `sell_quantity` is virtual (structured-only); everything else
            // maps back onto a registry row.
            let (command_name, is_implemented) = match self.by_handler(handler_key) {
                Some(spec) => (spec.name, spec.is_implemented),
                None => (handler_key.to_string(), true),
            };
            return Some(CommandMatch {
                command_name,
                handler_key: handler_key.to_string(),
                is_implemented,
                kind: MatchKind::Structured,
                parsed: Some(parsed),
            });
        }

        // 5. Fuzzy phrase match.
        let specs = self.specs.read();
        let candidates: Vec<(String, f64, usize)> = specs
            .iter()
            .enumerate()
            .flat_map(|(idx, spec)| {
                spec.phrases
                    .iter()
                    .map(move |(p, c)| (p.clone(), *c, idx))
            })
            .collect();
        if let Some((idx, _score)) = best_fuzzy_match(
            &normalized,
            candidates.iter().map(|(p, c, i)| (p.as_str(), *c, *i)),
        ) {
            let spec = &specs[idx];
            return Some(CommandMatch {
                command_name: spec.name.clone(),
                handler_key: spec.handler_key.clone(),
                is_implemented: spec.is_implemented,
                kind: MatchKind::Fuzzy,
                parsed: None,
            });
        }

        None
    }

    /// Resolve a command by name (used by the `find` helper surfaces).
    pub fn lookup(&self, name: &str) -> Option<CommandSpec> {
        self.find(name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::matcher::QtySpec;

    #[test]
    fn exact_beats_everything() {
        let reg = CommandRegistry::in_memory();
        let m = reg.match_input("close").unwrap();
        assert_eq!(m.kind, MatchKind::Exact);
        assert_eq!(m.handler_key, "close_position");
    }

    #[test]
    fn alias_matches() {
        let reg = CommandRegistry::in_memory();
        let m = reg.match_input("flatten").unwrap();
        assert_eq!(m.kind, MatchKind::Alias);
        assert_eq!(m.command_name, "close");

        let m = reg.match_input("profit").unwrap();
        assert_eq!(m.handler_key, "pnl_query");
    }

    #[test]
    fn phrase_matches_case_insensitively() {
        let reg = CommandRegistry::in_memory();
        let m = reg.match_input("Get Me Out").unwrap();
        assert_eq!(m.kind, MatchKind::Phrase);
        assert_eq!(m.handler_key, "close_position");
    }

    #[test]
    fn structured_notation_matches() {
        let reg = CommandRegistry::in_memory();
        let m = reg.match_input("long 50000 BYND @ 0.55").unwrap();
        assert_eq!(m.kind, MatchKind::Structured);
        assert_eq!(m.handler_key, "enter_long");
        assert!(m.parsed.is_some());

        let m = reg.match_input("sell half").unwrap();
        assert_eq!(m.handler_key, "sell_quantity");
        match m.parsed.unwrap() {
            ParsedCommand::Sell { qty } => assert_eq!(qty, QtySpec::Half),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn fuzzy_is_last_resort() {
        let reg = CommandRegistry::in_memory();
        // One edit away from the "close it" phrase.
        let m = reg.match_input("close itt").unwrap();
        assert_eq!(m.kind, MatchKind::Fuzzy);
        assert_eq!(m.handler_key, "close_position");
    }

    #[test]
    fn unrecognized_input_is_none() {
        let reg = CommandRegistry::in_memory();
        assert!(reg.match_input("what is the meaning of life").is_none());
        assert!(reg.match_input("").is_none());
    }

    #[test]
    fn unimplemented_command_still_matches() {
        let reg = CommandRegistry::in_memory();
        let m = reg.match_input("hedge").unwrap();
        assert!(!m.is_implemented);
    }

    #[test]
    fn registry_round_trips_through_db() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let reg = CommandRegistry::load(db).unwrap();
        assert!(reg.match_input("close").is_some());
        assert!(reg.reload().unwrap() >= 10);
    }
}
