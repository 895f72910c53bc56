//! Story and step graph
//!
//! A story is a named dialogue task with one or more starting steps. Each step
//! declares what the understanding data must contain before it can be entered
//! and lists the steps that may follow it. Stories are immutable once loaded:
//! the orchestrator shares a single validated [`StoryCatalog`] across every
//! turn without locking.

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod matcher;
pub mod repository;

pub use catalog::{StoryCatalog, WalkItem};
pub use matcher::can_enter;
pub use repository::{
    parse_catalog, InMemoryStoryRepository, StoryRepository, TomlStoryRepository,
};

use sdk::ParsedData;

/// A node of a dialogue tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Catalog-unique name; conversations point at steps by name alone
    pub name: String,

    /// Intent the utterance must carry, if any
    #[serde(default)]
    pub required_intent: Option<String>,

    /// Entities that must all be present, by name
    #[serde(default)]
    pub required_entities: Vec<String>,

    /// Candidate successors, in priority order
    #[serde(default)]
    pub next: Vec<Step>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_intent: None,
            required_entities: Vec::new(),
            next: Vec::new(),
        }
    }

    /// Require an intent. An empty name means "any intent".
    pub fn requires_intent(mut self, intent: impl Into<String>) -> Self {
        let intent = intent.into();
        self.required_intent = if intent.is_empty() { None } else { Some(intent) };
        self
    }

    pub fn requires_entity(mut self, entity: impl Into<String>) -> Self {
        self.required_entities.push(entity.into());
        self
    }

    pub fn with_next(mut self, step: Step) -> Self {
        self.next.push(step);
        self
    }

    /// Required intent, with an empty string treated as no requirement
    pub fn intent(&self) -> Option<&str> {
        self.required_intent.as_deref().filter(|i| !i.is_empty())
    }

    /// A step with no successors ends its story
    pub fn is_final(&self) -> bool {
        self.next.is_empty()
    }

    /// First successor, in declaration order, that `data` allows entering
    pub fn find_next(&self, data: &ParsedData) -> Option<&Step> {
        self.next.iter().find(|candidate| can_enter(candidate, data))
    }
}

/// A named entry point to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub name: String,
    pub starting_steps: Vec<Step>,
}

impl Story {
    pub fn new(name: impl Into<String>, starting_steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            starting_steps,
        }
    }

    pub fn with_starting_step(mut self, step: Step) -> Self {
        self.starting_steps.push(step);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::{Entity, Intent};

    #[test]
    fn test_empty_intent_means_no_requirement() {
        let step = Step::new("greet").requires_intent("");
        assert_eq!(step.required_intent, None);
        assert_eq!(step.intent(), None);

        let step = Step {
            required_intent: Some(String::new()),
            ..Step::new("greet")
        };
        assert_eq!(step.intent(), None);
    }

    #[test]
    fn test_find_next_picks_first_declared_match() {
        let step = Step::new("root")
            .with_next(Step::new("first").requires_entity("nb_persons"))
            .with_next(Step::new("second").requires_entity("nb_persons"));

        let data = ParsedData::new(
            Some(Intent::new("anything")),
            vec![Entity::integer("nb_persons", 1.0, 2)],
        );

        assert_eq!(step.find_next(&data).map(|s| s.name.as_str()), Some("first"));
        assert!(!step.is_final());
    }

    #[test]
    fn test_find_next_without_candidates() {
        let step = Step::new("leaf");
        assert!(step.is_final());
        assert!(step.find_next(&ParsedData::default()).is_none());
    }
}
