//! Validated story catalog
//!
//! Wraps the list of stories fetched from a [`StoryRepository`] and checks it
//! once at load time: step names must be non-empty and unique across the whole
//! catalog, and every story needs at least one starting step. Lookups walk the
//! trees with an explicit stack, so catalog depth never grows the call stack.
//!
//! [`StoryRepository`]: super::StoryRepository

use std::collections::HashMap;

use sdk::{EngineError, ParsedData};

use super::{can_enter, Step, Story, StoryRepository};

/// Read-only set of stories shared by every turn
#[derive(Debug, Clone)]
pub struct StoryCatalog {
    stories: Vec<Story>,
}

/// One node visited by [`StoryCatalog::walk`]
#[derive(Debug, Clone, Copy)]
pub struct WalkItem<'a> {
    pub story: &'a Story,
    /// 0 for starting steps
    pub depth: usize,
    pub step: &'a Step,
}

impl StoryCatalog {
    /// Validate and wrap `stories`
    pub fn new(stories: Vec<Story>) -> Result<Self, EngineError> {
        let catalog = Self { stories };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Fetch every story from `repository` and validate the result
    pub async fn load(repository: &dyn StoryRepository) -> Result<Self, EngineError> {
        let stories = repository.find_all().await?;
        let catalog = Self::new(stories)?;

        tracing::info!(
            "Loaded story catalog: {} stories, {} steps",
            catalog.stories.len(),
            catalog.step_count()
        );

        Ok(catalog)
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();

        for story in &self.stories {
            if story.name.trim().is_empty() {
                return Err(EngineError::InvalidCatalog(
                    "Story name cannot be empty".to_string(),
                ));
            }
            if story.starting_steps.is_empty() {
                return Err(EngineError::InvalidCatalog(format!(
                    "Story '{}' has no starting step",
                    story.name
                )));
            }
        }

        for item in self.walk() {
            let name = item.step.name.as_str();
            if name.trim().is_empty() {
                return Err(EngineError::InvalidCatalog(format!(
                    "Story '{}' contains a step with an empty name",
                    item.story.name
                )));
            }
            if let Some(first) = seen.insert(name, item.story.name.as_str()) {
                return Err(EngineError::InvalidCatalog(format!(
                    "Duplicate step name '{}' (in story '{}' and story '{}')",
                    name, first, item.story.name
                )));
            }
        }

        Ok(())
    }

    pub fn stories(&self) -> &[Story] {
        &self.stories
    }

    pub fn step_count(&self) -> usize {
        self.walk().count()
    }

    /// Every step, depth-first in declaration order
    pub fn walk(&self) -> StepWalk<'_> {
        let mut stack = Vec::new();
        for story in self.stories.iter().rev() {
            for step in story.starting_steps.iter().rev() {
                stack.push(WalkItem {
                    story,
                    depth: 0,
                    step,
                });
            }
        }
        StepWalk { stack }
    }

    /// Find a step by name
    ///
    /// Stories are searched in list order, each tree depth-first in child
    /// order; the first match wins.
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.walk()
            .find(|item| item.step.name == name)
            .map(|item| item.step)
    }

    /// First starting step, across stories in order, that `data` can enter
    pub fn find_entry_step(&self, data: &ParsedData) -> Option<(&Story, &Step)> {
        self.stories.iter().find_map(|story| {
            story
                .starting_steps
                .iter()
                .find(|step| can_enter(step, data))
                .map(|step| (story, step))
        })
    }

    /// Names of every step, for handler registry checks
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.walk().map(|item| item.step.name.as_str())
    }
}

/// Pre-order traversal over a catalog using an explicit stack
pub struct StepWalk<'a> {
    stack: Vec<WalkItem<'a>>,
}

impl<'a> Iterator for StepWalk<'a> {
    type Item = WalkItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.stack.pop()?;
        for child in item.step.next.iter().rev() {
            self.stack.push(WalkItem {
                story: item.story,
                depth: item.depth + 1,
                step: child,
            });
        }
        Some(item)
    }
}
