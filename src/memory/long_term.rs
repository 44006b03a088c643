//! Long-term story memory: key events and mined character relations
//!
//! Relation extraction recognizes two textual patterns over chapter prose:
//! "A and B become friends/enemies/partners" and "A tells B that X".

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{keywords_of, split_sentences, tokenize};

/// A durable plot point. Importance ranges 1..=5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub text: String,
    pub importance: u8,
}

/// A mined relationship edge. Weight ∈ [-1, 1]; mined edges use -0.7, 0, or
/// +0.7 depending on the pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRelation {
    pub a: String,
    pub b: String,
    pub weight: f32,
    pub evidence: String,
}

/// Long-term store for one story.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongTermStore {
    pub key_events: Vec<KeyEvent>,
    pub relations: Vec<CharacterRelation>,
    pub themes: Vec<String>,
    pub world_settings: Vec<String>,
}

impl LongTermStore {
    pub fn add_key_event(&mut self, event: KeyEvent) {
        if !self.key_events.iter().any(|e| e.text == event.text) {
            self.key_events.push(event);
        }
    }

    /// Insert or refresh a relation for the (a, b) pair.
    pub fn upsert_relation(&mut self, relation: CharacterRelation) {
        match self
            .relations
            .iter_mut()
            .find(|r| r.a == relation.a && r.b == relation.b)
        {
            Some(existing) => {
                existing.weight = relation.weight;
                existing.evidence = relation.evidence;
            }
            None => self.relations.push(relation),
        }
    }

    pub fn add_theme(&mut self, theme: impl Into<String>) {
        let theme = theme.into();
        if !self.themes.contains(&theme) {
            self.themes.push(theme);
        }
    }

    pub fn add_world_setting(&mut self, setting: impl Into<String>) {
        let setting = setting.into();
        if !self.world_settings.contains(&setting) {
            self.world_settings.push(setting);
        }
    }
}

/// Compiled relation patterns.
#[derive(Debug, Clone)]
pub struct RelationMiner {
    r#become: Regex,
    tell: Regex,
}

impl Default for RelationMiner {
    fn default() -> Self {
        Self {
            r#become: Regex::new(
                r"(?i)\b([A-Z][a-zA-Z]+)\s+and\s+([A-Z][a-zA-Z]+)\s+become\s+(friends?|enemies|partners?)\b",
            )
            .expect("static relation pattern"),
            tell: Regex::new(r"\b([A-Z][a-zA-Z]+)\s+tells?\s+([A-Z][a-zA-Z]+)\s+that\b")
                .expect("static relation pattern"),
        }
    }
}

impl RelationMiner {
    /// Extract relation edges from chapter prose.
    pub fn mine(&self, text: &str) -> Vec<CharacterRelation> {
        let mut relations = Vec::new();
        for captures in self.r#become.captures_iter(text) {
            let bond = captures[3].to_lowercase();
            let weight = if bond.starts_with("enem") { -0.7 } else { 0.7 };
            relations.push(CharacterRelation {
                a: captures[1].to_string(),
                b: captures[2].to_string(),
                weight,
                evidence: captures[0].to_string(),
            });
        }
        for captures in self.tell.captures_iter(text) {
            relations.push(CharacterRelation {
                a: captures[1].to_string(),
                b: captures[2].to_string(),
                weight: 0.0,
                evidence: captures[0].to_string(),
            });
        }
        relations
    }
}

/// Pull key events out of chapter prose: sentences carrying salience
/// keywords, with importance scaled by how many they carry.
pub fn extract_key_events(text: &str, salience_keywords: &[String]) -> Vec<KeyEvent> {
    let lowered: Vec<String> = salience_keywords.iter().map(|k| k.to_lowercase()).collect();
    let mut events = Vec::new();
    for sentence in split_sentences(text) {
        let tokens = tokenize(sentence);
        let hits = lowered
            .iter()
            .filter(|k| tokens.iter().any(|t| t == *k))
            .count();
        if hits > 0 {
            events.push(KeyEvent {
                text: sentence.to_string(),
                importance: (hits as u8).clamp(1, 5),
            });
        }
    }
    events
}

/// Keyword view of a key event, used by retrieval.
pub(crate) fn event_keywords(event: &KeyEvent) -> Vec<String> {
    keywords_of(&event.text, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_become_friends_positive_weight() {
        let miner = RelationMiner::default();
        let relations = miner.mine("That night, Alice and Bob become friends.");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].a, "Alice");
        assert_eq!(relations[0].b, "Bob");
        assert!((relations[0].weight - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_become_enemies_negative_weight() {
        let miner = RelationMiner::default();
        let relations = miner.mine("Carol and Dave become enemies after the will is read.");
        assert_eq!(relations.len(), 1);
        assert!((relations[0].weight + 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_tell_pattern_neutral_weight() {
        let miner = RelationMiner::default();
        let relations = miner.mine("Eve tells Frank that the cellar was locked all night.");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].a, "Eve");
        assert_eq!(relations[0].b, "Frank");
        assert_eq!(relations[0].weight, 0.0);
    }

    #[test]
    fn test_upsert_replaces_existing_edge() {
        let mut store = LongTermStore::default();
        store.upsert_relation(CharacterRelation {
            a: "Alice".into(),
            b: "Bob".into(),
            weight: 0.7,
            evidence: "friends".into(),
        });
        store.upsert_relation(CharacterRelation {
            a: "Alice".into(),
            b: "Bob".into(),
            weight: -0.7,
            evidence: "betrayal".into(),
        });
        assert_eq!(store.relations.len(), 1);
        assert!((store.relations[0].weight + 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_key_event_extraction_scales_importance() {
        let keywords = vec!["secret".to_string(), "discover".to_string()];
        let events = extract_key_events(
            "They discover a secret door. The weather was mild.",
            &keywords,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].importance, 2);
    }

    #[test]
    fn test_key_events_deduplicated() {
        let mut store = LongTermStore::default();
        let event = KeyEvent {
            text: "They discover a secret door.".into(),
            importance: 2,
        };
        store.add_key_event(event.clone());
        store.add_key_event(event);
        assert_eq!(store.key_events.len(), 1);
    }
}
