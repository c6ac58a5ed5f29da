//! Phrase registry with generated alias variations and tiered matching.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::commands::normalize::Normalizer;
use crate::settings::VigilSettings;

const ALIAS_PREFIXES: [&str; 6] = ["hey", "hi", "hello", "please", "can you", "could you"];
const ALIAS_SUFFIXES: [&str; 4] = ["please", "now", "quick", "fast"];
const CONTRACTIONS: [(&str, &str); 2] = [("i am", "im"), ("i will", "ill")];

/// Partial matches at or below this are rejected.
const PARTIAL_THRESHOLD: f64 = 0.6;

/// Action bound to a canonical phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    Emergency,
    CheckIn,
    GetLocation,
    ShareLocation,
    GetStatus,
    StopListening,
    StartListening,
    Test,
    /// Unrecognized action id from a persisted custom command.
    Other(String),
}

impl CommandAction {
    pub fn from_action_id(id: &str) -> Self {
        match id {
            "emergency" => CommandAction::Emergency,
            "checkin" => CommandAction::CheckIn,
            "get_location" => CommandAction::GetLocation,
            "share_location" => CommandAction::ShareLocation,
            "get_status" => CommandAction::GetStatus,
            "stop_listening" => CommandAction::StopListening,
            "start_listening" => CommandAction::StartListening,
            "test" => CommandAction::Test,
            other => CommandAction::Other(other.to_string()),
        }
    }

    pub fn action_id(&self) -> &str {
        match self {
            CommandAction::Emergency => "emergency",
            CommandAction::CheckIn => "checkin",
            CommandAction::GetLocation => "get_location",
            CommandAction::ShareLocation => "share_location",
            CommandAction::GetStatus => "get_status",
            CommandAction::StopListening => "stop_listening",
            CommandAction::StartListening => "start_listening",
            CommandAction::Test => "test",
            CommandAction::Other(id) => id,
        }
    }
}

/// Built-in command set, registered at construction. Phrases are stored in
/// canonical normalized form.
const BUILTIN_COMMANDS: [(&str, CommandAction, &str); 8] = [
    ("emergency", CommandAction::Emergency, "Send an emergency alert"),
    ("check in", CommandAction::CheckIn, "Send a check-in to your contacts"),
    ("where am i", CommandAction::GetLocation, "Speak the current position"),
    (
        "share my location",
        CommandAction::ShareLocation,
        "Send your position to your contacts",
    ),
    (
        "status report",
        CommandAction::GetStatus,
        "Report listening state and pending hits",
    ),
    ("stop listening", CommandAction::StopListening, "Pause voice monitoring"),
    ("start listening", CommandAction::StartListening, "Resume voice monitoring"),
    ("test voice", CommandAction::Test, "Confirm voice commands work"),
];

/// True when `phrase`, already normalized, is a built-in canonical phrase.
pub fn is_builtin_phrase(phrase: &str) -> bool {
    BUILTIN_COMMANDS.iter().any(|(p, _, _)| *p == phrase)
}

/// A registered command. `phrase` is stored normalized.
#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub phrase: String,
    pub action: CommandAction,
    pub description: String,
    /// Settings id for commands sourced from `custom_commands`.
    pub custom_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    Alias,
    Partial,
}

#[derive(Debug, Clone)]
pub struct CommandMatch {
    pub entry: CommandEntry,
    pub tier: MatchTier,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
struct AliasTarget {
    canonical: String,
    /// User aliases come from settings and survive variation regeneration.
    user_defined: bool,
}

/// Canonical phrases in registration order plus an alias table.
///
/// Registration order matters: the partial tier scans entries in order and
/// keeps the first best-scoring candidate, so earlier registrations win
/// score ties.
pub struct CommandRegistry {
    entries: Vec<CommandEntry>,
    aliases: HashMap<String, AliasTarget>,
    normalizer: Normalizer,
}

impl CommandRegistry {
    /// Registry with the built-in command set.
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
            aliases: HashMap::new(),
            normalizer: Normalizer::new(),
        };
        for (phrase, action, description) in BUILTIN_COMMANDS {
            registry.register(phrase, action, description);
        }
        registry
    }

    /// Register a phrase. An existing entry with the same normalized phrase
    /// is overwritten in place, keeping its registration position; its
    /// generated aliases are rebuilt.
    pub fn register(&mut self, phrase: &str, action: CommandAction, description: &str) {
        self.register_inner(phrase, action, description, None);
    }

    fn register_inner(
        &mut self,
        phrase: &str,
        action: CommandAction,
        description: &str,
        custom_id: Option<String>,
    ) {
        let normalized = self.normalizer.apply(phrase);
        if normalized.is_empty() {
            debug!("skipping empty command phrase");
            return;
        }

        let entry = CommandEntry {
            phrase: normalized.clone(),
            action,
            description: description.to_string(),
            custom_id,
        };

        match self.entries.iter().position(|e| e.phrase == normalized) {
            Some(idx) => {
                // A settings-sourced command never takes over a canonical
                // entry: the next rebuild would drop the canonical command
                // with it.
                if entry.custom_id.is_some() && self.entries[idx].custom_id.is_none() {
                    warn!(phrase = %normalized, "custom_command_shadows_builtin_skipped");
                    return;
                }
                // Drop this entry's generated aliases before regenerating;
                // user aliases stay.
                self.aliases
                    .retain(|_, target| target.user_defined || target.canonical != normalized);
                self.entries[idx] = entry;
            }
            None => self.entries.push(entry),
        }

        for variation in generate_variations(&normalized) {
            // Last write wins on collisions.
            self.aliases.insert(
                variation,
                AliasTarget {
                    canonical: normalized.clone(),
                    user_defined: false,
                },
            );
        }
    }

    /// Add a user-defined alias from settings.
    pub fn add_user_alias(&mut self, alias: &str, canonical: &str) {
        let alias = self.normalizer.apply(alias);
        let canonical = self.normalizer.apply(canonical);
        if alias.is_empty() || canonical.is_empty() {
            return;
        }
        self.aliases.insert(
            alias,
            AliasTarget {
                canonical,
                user_defined: true,
            },
        );
    }

    /// Replace the whole settings-sourced table: custom entries, their
    /// generated aliases, and user aliases are dropped and re-registered
    /// from the snapshot. Built-ins are untouched.
    pub fn rebuild_custom(&mut self, settings: &VigilSettings) {
        self.entries.retain(|e| e.custom_id.is_none());

        let canonicals: HashSet<String> =
            self.entries.iter().map(|e| e.phrase.clone()).collect();
        self.aliases
            .retain(|_, target| !target.user_defined && canonicals.contains(&target.canonical));

        for command in settings.custom_commands.iter().filter(|c| c.enabled) {
            self.register_inner(
                &command.phrase,
                CommandAction::from_action_id(&command.action),
                &command.description,
                Some(command.id.clone()),
            );
        }
        for (alias, canonical) in &settings.aliases {
            self.add_user_alias(alias, canonical);
        }
    }

    /// Resolve input to a command. Tiers in order: exact canonical, alias,
    /// then partial containment with a strict score cutoff.
    pub fn resolve(&self, input: &str) -> Option<CommandMatch> {
        let normalized = self.normalizer.apply(input);
        if normalized.is_empty() {
            return None;
        }

        if let Some(entry) = self.entries.iter().find(|e| e.phrase == normalized) {
            return Some(CommandMatch {
                entry: entry.clone(),
                tier: MatchTier::Exact,
                confidence: 1.0,
            });
        }

        if let Some(target) = self.aliases.get(&normalized) {
            if let Some(entry) = self.entries.iter().find(|e| e.phrase == target.canonical) {
                return Some(CommandMatch {
                    entry: entry.clone(),
                    tier: MatchTier::Alias,
                    confidence: 1.0,
                });
            }
        }

        // Best score wins; replace only on strictly greater, so the first
        // registered candidate takes ties.
        let mut best: Option<(usize, f64)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            if normalized.contains(&entry.phrase) || entry.phrase.contains(&normalized) {
                let input_chars = normalized.chars().count() as f64;
                let phrase_chars = entry.phrase.chars().count() as f64;
                let score = input_chars.min(phrase_chars) / input_chars.max(phrase_chars);
                if best.map_or(true, |(_, b)| score > b) {
                    best = Some((idx, score));
                }
            }
        }

        match best {
            Some((idx, score)) if score > PARTIAL_THRESHOLD => Some(CommandMatch {
                entry: self.entries[idx].clone(),
                tier: MatchTier::Partial,
                confidence: score,
            }),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Spoken variations for a normalized phrase: courtesy prefixes, urgency
/// suffixes, both combined, and contracted forms.
fn generate_variations(phrase: &str) -> Vec<String> {
    let mut variations = Vec::new();
    for prefix in ALIAS_PREFIXES {
        variations.push(format!("{prefix} {phrase}"));
    }
    for suffix in ALIAS_SUFFIXES {
        variations.push(format!("{phrase} {suffix}"));
    }
    for prefix in ALIAS_PREFIXES {
        for suffix in ALIAS_SUFFIXES {
            variations.push(format!("{prefix} {phrase} {suffix}"));
        }
    }
    for (long, short) in CONTRACTIONS {
        if phrase.contains(long) {
            variations.push(phrase.replace(long, short));
        }
    }
    variations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CustomCommand;

    fn custom(id: &str, phrase: &str, action: &str) -> CustomCommand {
        CustomCommand {
            id: id.to_string(),
            phrase: phrase.to_string(),
            action: action.to_string(),
            description: String::new(),
            created_at: 0,
            enabled: true,
        }
    }

    #[test]
    fn exact_match_has_full_confidence() {
        let registry = CommandRegistry::new();
        let m = registry.resolve("Emergency!").unwrap();
        assert_eq!(m.tier, MatchTier::Exact);
        assert_eq!(m.entry.action, CommandAction::Emergency);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn generated_variations_resolve_at_alias_tier() {
        let registry = CommandRegistry::new();

        for input in ["hey emergency", "check in now", "please check in now", "could you share my location please"] {
            let m = registry.resolve(input).unwrap_or_else(|| panic!("no match for {input:?}"));
            assert_eq!(m.tier, MatchTier::Alias, "input {input:?}");
        }
        assert_eq!(
            registry.resolve("please check in now").unwrap().entry.action,
            CommandAction::CheckIn
        );
    }

    #[test]
    fn contractions_alias_the_contracted_form() {
        let mut registry = CommandRegistry::new();
        registry.register("i am here", CommandAction::CheckIn, "");

        let m = registry.resolve("im here").unwrap();
        assert_eq!(m.tier, MatchTier::Alias);
        assert_eq!(m.entry.phrase, "i am here");
    }

    #[test]
    fn exact_tier_wins_over_alias_and_partial_candidates() {
        let mut registry = CommandRegistry::new();
        // "emergency now" is also a generated alias of the built-in
        // "emergency" and contains it at 9/13; the canonical entry still
        // resolves first.
        registry.register("emergency now", CommandAction::Test, "");

        let m = registry.resolve("emergency now").unwrap();
        assert_eq!(m.tier, MatchTier::Exact);
        assert_eq!(m.entry.action, CommandAction::Test);
    }

    #[test]
    fn partial_cutoff_is_strict() {
        let mut registry = CommandRegistry::new();
        registry.register("status", CommandAction::GetStatus, "");

        // 6/10 chars = exactly 0.6: rejected.
        assert!(registry.resolve("status plz").is_none());
        // 6/9 chars ~ 0.667: accepted.
        let m = registry.resolve("status pl").unwrap();
        assert_eq!(m.tier, MatchTier::Partial);
        assert_eq!(m.entry.phrase, "status");
        assert!(m.confidence > 0.6);
    }

    #[test]
    fn partial_ties_go_to_first_registered() {
        let mut registry = CommandRegistry::new();
        // Same length as built-in "check in"; registered later.
        registry.register("check up", CommandAction::Test, "");

        // "check" scores 5/8 against both; the earlier entry wins.
        let m = registry.resolve("check").unwrap();
        assert_eq!(m.tier, MatchTier::Partial);
        assert_eq!(m.entry.action, CommandAction::CheckIn);
    }

    #[test]
    fn reregistering_overwrites_in_place() {
        let mut registry = CommandRegistry::new();
        let len_before = registry.len();
        let pos_before = registry
            .entries()
            .iter()
            .position(|e| e.phrase == "check in")
            .unwrap();

        registry.register("check in", CommandAction::Other("ping".into()), "updated");

        assert_eq!(registry.len(), len_before);
        let pos_after = registry
            .entries()
            .iter()
            .position(|e| e.phrase == "check in")
            .unwrap();
        assert_eq!(pos_before, pos_after);
        assert_eq!(
            registry.resolve("check in").unwrap().entry.action,
            CommandAction::Other("ping".into())
        );
        // Variations were regenerated for the new entry.
        assert_eq!(
            registry.resolve("hey check in").unwrap().entry.action,
            CommandAction::Other("ping".into())
        );
    }

    #[test]
    fn rebuild_replaces_custom_table_and_user_aliases() {
        let mut registry = CommandRegistry::new();
        let builtin_len = registry.len();

        let mut settings = VigilSettings::default();
        settings.custom_commands.push(custom("c1", "walk me home", "checkin"));
        settings.aliases.insert("sos".into(), "emergency".into());
        registry.rebuild_custom(&settings);

        let m = registry.resolve("walk me home").unwrap();
        assert_eq!(m.entry.action, CommandAction::CheckIn);
        assert_eq!(m.entry.custom_id.as_deref(), Some("c1"));
        assert_eq!(registry.resolve("sos").unwrap().tier, MatchTier::Alias);

        // Rebuild from an empty snapshot drops both again.
        registry.rebuild_custom(&VigilSettings::default());
        assert_eq!(registry.len(), builtin_len);
        assert!(registry.resolve("walk me home").is_none());
        assert!(registry.resolve("sos").is_none());
    }

    #[test]
    fn builtin_survives_shadowing_custom_command() {
        let mut registry = CommandRegistry::new();
        let mut settings = VigilSettings::default();
        settings.custom_commands.push(custom("c3", "check in", "test"));
        registry.rebuild_custom(&settings);

        // The colliding entry is skipped; the built-in keeps resolving.
        let m = registry.resolve("check in").unwrap();
        assert_eq!(m.entry.action, CommandAction::CheckIn);
        assert_eq!(m.entry.custom_id, None);

        // Removing the shadowing command must not take the built-in with it.
        registry.rebuild_custom(&VigilSettings::default());
        let m = registry.resolve("check in").unwrap();
        assert_eq!(m.entry.action, CommandAction::CheckIn);
        // Its generated variations are intact as well.
        assert_eq!(
            registry.resolve("hey check in").unwrap().entry.action,
            CommandAction::CheckIn
        );
    }

    #[test]
    fn disabled_custom_commands_are_skipped() {
        let mut registry = CommandRegistry::new();
        let mut settings = VigilSettings::default();
        let mut cmd = custom("c2", "walk me home", "checkin");
        cmd.enabled = false;
        settings.custom_commands.push(cmd);

        registry.rebuild_custom(&settings);
        assert!(registry.resolve("walk me home").is_none());
    }

    #[test]
    fn unknown_action_ids_parse_as_other() {
        assert_eq!(
            CommandAction::from_action_id("dance"),
            CommandAction::Other("dance".into())
        );
        assert_eq!(CommandAction::from_action_id("checkin"), CommandAction::CheckIn);
        assert_eq!(CommandAction::Other("dance".into()).action_id(), "dance");
    }

    #[test]
    fn gibberish_and_empty_input_do_not_match() {
        let registry = CommandRegistry::new();
        assert!(registry.resolve("purple monkey dishwasher").is_none());
        assert!(registry.resolve("   ").is_none());
    }
}
