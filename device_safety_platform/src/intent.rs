//! Rule-based interpretation of free-text device-safety questions.
//!
//! The classifier tokenizes the query, spots known manufacturers and device
//! types, picks up concern keywords and maps the question onto an
//! [`IntentCategory`] with the set of agents needed to answer it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ClassificationError;
use crate::registry::{
    AgentRegistry, DEVICE_INFO_COLLECTOR, EVENTS_COLLECTOR, NARRATIVE_WRITER, PATTERN_ANALYZER,
    RECALLS_COLLECTOR,
};

/// Primary category of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    DeviceLookup,
    AdverseEvents,
    Recalls,
    SafetyAnalysis,
    Comparison,
    General,
}

/// Structured interpretation of one query. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub category: IntentCategory,
    /// Device and manufacturer names, in order of first mention
    pub entities: Vec<String>,
    pub concerns: Vec<String>,
    /// Deduplicated, non-empty, in registry listing order
    pub required_agents: Vec<String>,
}

impl Intent {
    pub fn new<I, S>(category: IntentCategory, required_agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let required_agents = required_agents
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| seen.insert(id.clone()))
            .collect();
        Self {
            category,
            entities: Vec::new(),
            concerns: Vec::new(),
            required_agents,
        }
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concerns<I, S>(mut self, concerns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.concerns = concerns.into_iter().map(Into::into).collect();
        self
    }

    pub fn requires(&self, agent_id: &str) -> bool {
        self.required_agents.iter().any(|id| id == agent_id)
    }
}

struct LexiconEntry {
    canonical: &'static str,
    aliases: &'static [&'static str],
}

const MANUFACTURERS: &[LexiconEntry] = &[
    LexiconEntry { canonical: "Medtronic", aliases: &["medtronic"] },
    LexiconEntry { canonical: "Abbott", aliases: &["abbott"] },
    LexiconEntry { canonical: "Boston Scientific", aliases: &["boston scientific"] },
    LexiconEntry { canonical: "Philips", aliases: &["philips respironics", "respironics", "philips"] },
    LexiconEntry { canonical: "3M", aliases: &["3m"] },
    LexiconEntry { canonical: "Baxter", aliases: &["baxter"] },
    LexiconEntry { canonical: "Becton Dickinson", aliases: &["becton dickinson", "bd"] },
    LexiconEntry { canonical: "Johnson & Johnson", aliases: &["johnson johnson", "johnson and johnson"] },
    LexiconEntry { canonical: "Stryker", aliases: &["stryker"] },
    LexiconEntry { canonical: "Zimmer Biomet", aliases: &["zimmer biomet", "zimmer"] },
    LexiconEntry { canonical: "Dexcom", aliases: &["dexcom"] },
    LexiconEntry { canonical: "Insulet", aliases: &["insulet", "omnipod"] },
    LexiconEntry { canonical: "Tandem Diabetes", aliases: &["tandem diabetes", "tandem"] },
    LexiconEntry { canonical: "ResMed", aliases: &["resmed"] },
    LexiconEntry { canonical: "GE Healthcare", aliases: &["ge healthcare"] },
    LexiconEntry { canonical: "Siemens Healthineers", aliases: &["siemens healthineers", "siemens"] },
    LexiconEntry { canonical: "Smiths Medical", aliases: &["smiths medical"] },
    LexiconEntry { canonical: "Edwards Lifesciences", aliases: &["edwards lifesciences", "edwards"] },
    LexiconEntry { canonical: "Ethicon", aliases: &["ethicon"] },
    LexiconEntry { canonical: "Olympus", aliases: &["olympus"] },
    LexiconEntry { canonical: "Fresenius", aliases: &["fresenius"] },
    LexiconEntry { canonical: "Hologic", aliases: &["hologic"] },
    LexiconEntry { canonical: "B. Braun", aliases: &["b braun"] },
];

const DEVICE_TYPES: &[LexiconEntry] = &[
    LexiconEntry { canonical: "insulin pump", aliases: &["insulin pump"] },
    LexiconEntry { canonical: "infusion pump", aliases: &["infusion pump"] },
    LexiconEntry { canonical: "pacemaker", aliases: &["pacemaker"] },
    LexiconEntry { canonical: "defibrillator", aliases: &["defibrillator", "icd", "aed"] },
    LexiconEntry { canonical: "ventilator", aliases: &["ventilator"] },
    LexiconEntry { canonical: "CPAP", aliases: &["cpap machine", "cpap", "bipap"] },
    LexiconEntry { canonical: "mask", aliases: &["face mask", "mask"] },
    LexiconEntry { canonical: "respirator", aliases: &["respirator", "n95"] },
    LexiconEntry { canonical: "glucose monitor", aliases: &["continuous glucose monitor", "glucose monitor", "cgm"] },
    LexiconEntry { canonical: "stent", aliases: &["stent"] },
    LexiconEntry { canonical: "catheter", aliases: &["catheter"] },
    LexiconEntry { canonical: "hip implant", aliases: &["hip implant", "hip replacement"] },
    LexiconEntry { canonical: "knee implant", aliases: &["knee implant", "knee replacement"] },
    LexiconEntry { canonical: "breast implant", aliases: &["breast implant"] },
    LexiconEntry { canonical: "surgical mesh", aliases: &["surgical mesh", "hernia mesh", "mesh"] },
    LexiconEntry { canonical: "heart valve", aliases: &["heart valve"] },
    LexiconEntry { canonical: "syringe", aliases: &["syringe"] },
    LexiconEntry { canonical: "insulin pen", aliases: &["insulin pen"] },
    LexiconEntry { canonical: "hearing aid", aliases: &["hearing aid"] },
    LexiconEntry { canonical: "surgical stapler", aliases: &["surgical stapler", "stapler"] },
    LexiconEntry { canonical: "spinal cord stimulator", aliases: &["spinal cord stimulator"] },
    LexiconEntry { canonical: "dialysis machine", aliases: &["dialysis machine", "dialysis"] },
    LexiconEntry { canonical: "pulse oximeter", aliases: &["pulse oximeter", "oximeter"] },
    LexiconEntry { canonical: "duodenoscope", aliases: &["duodenoscope", "endoscope"] },
];

/// Concern keyword with the token prefixes that signal it
const CONCERNS: &[(&str, &[&str])] = &[
    ("death", &["death", "died", "fatal"]),
    ("injury", &["injur", "harm"]),
    ("malfunction", &["malfunction", "failure", "defect", "fault"]),
    ("recall", &["recall"]),
    ("infection", &["infect"]),
    ("contamination", &["contaminat", "steril"]),
    ("battery", &["batter"]),
    ("software", &["software", "firmware", "bug"]),
    ("overheating", &["overheat", "burn", "fire"]),
    ("leak", &["leak"]),
    ("fracture", &["fractur", "broke", "break"]),
    ("alarm", &["alarm"]),
    ("dosing", &["dose", "dosing", "overdos", "underdos"]),
    ("cybersecurity", &["cyber", "hack"]),
];

const COMPARISON_TERMS: &[&str] = &["compar", "versus", "vs", "difference", "differences"];
const ANALYSIS_TERMS: &[&str] = &[
    "trend", "pattern", "analy", "risk", "safe", "summar", "why", "signal", "overview",
];
const RECALL_TERMS: &[&str] = &["recall"];
const EVENT_TERMS: &[&str] = &[
    "adverse", "event", "report", "complaint", "incident", "death", "died", "injur",
    "malfunction", "fatal",
];

/// Maps free text onto an [`Intent`]. Holds no mutable state, so identical
/// input always yields an identical intent.
pub struct IntentClassifier {
    registry: Arc<AgentRegistry>,
}

impl IntentClassifier {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub fn classify(&self, query: &str) -> Result<Intent, ClassificationError> {
        if query.trim().is_empty() {
            return Err(ClassificationError::EmptyQuery);
        }
        let tokens = tokenize(query);

        let mut entities = extract_entities(&tokens, MANUFACTURERS);
        entities.extend(extract_entities(&tokens, DEVICE_TYPES));
        entities.sort_by_key(|(position, _)| *position);
        let entities: Vec<String> = entities.into_iter().map(|(_, name)| name).collect();

        let concerns = extract_concerns(&tokens);

        let comparison_hits = count_hits(&tokens, COMPARISON_TERMS);
        let analysis_hits = count_hits(&tokens, ANALYSIS_TERMS);
        let recall_hits = count_hits(&tokens, RECALL_TERMS);
        let event_hits = count_hits(&tokens, EVENT_TERMS);

        let (category, agents): (IntentCategory, Vec<&str>) = if comparison_hits > 0 {
            (
                IntentCategory::Comparison,
                vec![
                    DEVICE_INFO_COLLECTOR,
                    EVENTS_COLLECTOR,
                    RECALLS_COLLECTOR,
                    PATTERN_ANALYZER,
                    NARRATIVE_WRITER,
                ],
            )
        } else if analysis_hits > 0 {
            (IntentCategory::SafetyAnalysis, full_analysis())
        } else if recall_hits > 0 || event_hits > 0 {
            // The writer pulls in the analyzer and both collectors
            let mut agents = Vec::new();
            if event_hits > 0 {
                agents.push(EVENTS_COLLECTOR);
            }
            if recall_hits > 0 {
                agents.push(RECALLS_COLLECTOR);
            }
            agents.push(NARRATIVE_WRITER);
            let category = if recall_hits >= event_hits {
                IntentCategory::Recalls
            } else {
                IntentCategory::AdverseEvents
            };
            (category, agents)
        } else if !entities.is_empty() {
            (
                IntentCategory::DeviceLookup,
                vec![DEVICE_INFO_COLLECTOR, NARRATIVE_WRITER],
            )
        } else {
            (IntentCategory::General, full_analysis())
        };

        let required_agents = self.resolve_agents(&agents);

        debug!(
            ?category,
            ?entities,
            ?concerns,
            ?required_agents,
            "Classified query"
        );

        Ok(Intent {
            category,
            entities,
            concerns,
            required_agents,
        })
    }

    /// Close the rule's agent set under registry dependencies; fall back to the
    /// whole roster when none of the rule's agents are registered.
    fn resolve_agents(&self, agents: &[&str]) -> Vec<String> {
        for agent in agents {
            if !self.registry.contains(agent) {
                warn!(agent_id = %agent, "Classification rule names an unregistered agent");
            }
        }

        let closure = self.registry.dependency_closure(agents);
        if closure.is_empty() {
            return self.registry.list().iter().map(|a| a.id.clone()).collect();
        }
        closure
    }
}

/// Whether `name` is a canonical manufacturer name produced by the classifier
pub fn is_manufacturer(name: &str) -> bool {
    MANUFACTURERS.iter().any(|entry| entry.canonical == name)
}

fn full_analysis() -> Vec<&'static str> {
    vec![EVENTS_COLLECTOR, RECALLS_COLLECTOR, PATTERN_ANALYZER, NARRATIVE_WRITER]
}

/// Lowercase alphanumeric words; everything else separates tokens
fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn token_matches(token: &str, word: &str, allow_plural: bool) -> bool {
    token == word
        || (allow_plural
            && token
                .strip_prefix(word)
                .is_some_and(|suffix| suffix == "s" || suffix == "es"))
}

/// Find lexicon phrases in `tokens`, longest phrases first, without overlap.
/// Returns `(first token position, canonical name)`, one per entry.
fn extract_entities(tokens: &[String], lexicon: &[LexiconEntry]) -> Vec<(usize, String)> {
    let mut aliases: Vec<(&LexiconEntry, Vec<&str>)> = lexicon
        .iter()
        .flat_map(|entry| {
            entry
                .aliases
                .iter()
                .map(move |alias| (entry, alias.split(' ').collect::<Vec<_>>()))
        })
        .collect();
    aliases.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut consumed = vec![false; tokens.len()];
    let mut found: Vec<(usize, String)> = Vec::new();

    for (entry, words) in aliases {
        if words.len() > tokens.len() {
            continue;
        }
        for start in 0..=tokens.len() - words.len() {
            let span = start..start + words.len();
            if consumed[span.clone()].iter().any(|&used| used) {
                continue;
            }
            let matched = words.iter().enumerate().all(|(offset, word)| {
                let last = offset + 1 == words.len();
                token_matches(&tokens[start + offset], word, last)
            });
            if matched {
                consumed[span].iter_mut().for_each(|used| *used = true);
                match found.iter_mut().find(|(_, name)| name == entry.canonical) {
                    Some(existing) => existing.0 = existing.0.min(start),
                    None => found.push((start, entry.canonical.to_string())),
                }
            }
        }
    }

    found
}

fn extract_concerns(tokens: &[String]) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = Vec::new();
    for (concern, prefixes) in CONCERNS {
        if let Some(position) = tokens
            .iter()
            .position(|token| prefixes.iter().any(|prefix| token.starts_with(prefix)))
        {
            found.push((position, *concern));
        }
    }
    found.sort_by_key(|(position, _)| *position);
    found.into_iter().map(|(_, concern)| concern.to_string()).collect()
}

fn count_hits(tokens: &[String], terms: &[&str]) -> usize {
    tokens
        .iter()
        .filter(|token| {
            terms.iter().any(|term| {
                // Short terms must match exactly so that "vs" does not hit "vsync".
                if term.len() <= 3 {
                    token.as_str() == *term
                } else {
                    token.starts_with(term)
                }
            })
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(Arc::new(AgentRegistry::with_defaults().unwrap()))
    }

    #[test]
    fn test_empty_query_fails() {
        let classifier = classifier();
        assert_eq!(classifier.classify(""), Err(ClassificationError::EmptyQuery));
        assert_eq!(classifier.classify("   \t\n"), Err(ClassificationError::EmptyQuery));

        // Punctuation is not empty; it falls through to the general agent set
        let intent = classifier.classify("?!").unwrap();
        assert_eq!(intent.category, IntentCategory::General);
    }

    #[test]
    fn test_recall_query() {
        let intent = classifier().classify("insulin pump recalls").unwrap();
        assert_eq!(intent.category, IntentCategory::Recalls);
        assert_eq!(intent.entities, vec!["insulin pump"]);
        assert_eq!(intent.concerns, vec!["recall"]);
        assert_eq!(
            intent.required_agents,
            vec![EVENTS_COLLECTOR, RECALLS_COLLECTOR, PATTERN_ANALYZER, NARRATIVE_WRITER]
        );
    }

    #[test]
    fn test_manufacturer_lookup_runs_every_agent() {
        let intent = classifier().classify("3M masks").unwrap();
        assert_eq!(intent.category, IntentCategory::DeviceLookup);
        assert_eq!(intent.entities, vec!["3M", "mask"]);
        assert_eq!(
            intent.required_agents,
            vec![
                DEVICE_INFO_COLLECTOR,
                EVENTS_COLLECTOR,
                RECALLS_COLLECTOR,
                PATTERN_ANALYZER,
                NARRATIVE_WRITER
            ]
        );
    }

    #[test]
    fn test_analysis_pulls_in_dependencies() {
        let intent = classifier()
            .classify("What are the safety trends for Medtronic pacemakers?")
            .unwrap();
        assert_eq!(intent.category, IntentCategory::SafetyAnalysis);
        assert_eq!(intent.entities, vec!["Medtronic", "pacemaker"]);
        assert_eq!(
            intent.required_agents,
            vec![EVENTS_COLLECTOR, RECALLS_COLLECTOR, PATTERN_ANALYZER, NARRATIVE_WRITER]
        );
    }

    #[test]
    fn test_comparison_requires_every_agent() {
        let intent = classifier()
            .classify("Compare Dexcom vs Abbott glucose monitors")
            .unwrap();
        assert_eq!(intent.category, IntentCategory::Comparison);
        assert_eq!(intent.entities, vec!["Dexcom", "Abbott", "glucose monitor"]);
        assert_eq!(intent.required_agents.len(), 5);
    }

    #[test]
    fn test_longest_alias_wins() {
        let intent = classifier()
            .classify("philips respironics cpap machine foam")
            .unwrap();
        assert_eq!(intent.entities, vec!["Philips", "CPAP"]);
    }

    #[test]
    fn test_event_query_with_concerns() {
        let intent = classifier()
            .classify("deaths and injuries reported with infusion pumps")
            .unwrap();
        assert_eq!(intent.category, IntentCategory::AdverseEvents);
        assert_eq!(intent.concerns, vec!["death", "injury"]);
        assert_eq!(
            intent.required_agents,
            vec![EVENTS_COLLECTOR, RECALLS_COLLECTOR, PATTERN_ANALYZER, NARRATIVE_WRITER]
        );
    }

    #[test]
    fn test_unrecognized_query_falls_back_to_general() {
        let intent = classifier().classify("hello there").unwrap();
        assert_eq!(intent.category, IntentCategory::General);
        assert!(!intent.required_agents.is_empty());
        assert!(intent.requires(NARRATIVE_WRITER));
    }

    proptest! {
        #[test]
        fn prop_non_blank_queries_always_need_agents(query in "[a-zA-Z0-9 ]{0,60}") {
            let classifier = classifier();
            match classifier.classify(&query) {
                Ok(intent) => {
                    prop_assert!(!intent.required_agents.is_empty());
                    prop_assert!(intent.requires(NARRATIVE_WRITER));
                    let unique: HashSet<_> = intent.required_agents.iter().collect();
                    prop_assert_eq!(unique.len(), intent.required_agents.len());
                    prop_assert_eq!(Ok(intent), classifier.classify(&query));
                }
                Err(err) => {
                    prop_assert_eq!(err, ClassificationError::EmptyQuery);
                    prop_assert!(query.trim().is_empty());
                }
            }
        }
    }
}
