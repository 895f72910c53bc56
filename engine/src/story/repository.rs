//! Story catalog providers
//!
//! A [`StoryRepository`] hands out the full list of stories once per process.
//! Two providers exist: the built-in table-booking catalog held in memory, and
//! a TOML file where steps are declared flat and linked by name.
//!
//! ```toml
//! [[stories]]
//! name = "Book a table"
//! starting_steps = ["book_table_entrypoint"]
//!
//! [[steps]]
//! name = "book_table_entrypoint"
//! intent = "book_table"
//! next = ["book_table_get_nb_persons", "book_table_get_time"]
//!
//! [[steps]]
//! name = "book_table_get_nb_persons"
//! entities = ["nb_persons"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sdk::EngineError;

use super::{Step, Story};

/// Source of the story catalog
#[async_trait]
pub trait StoryRepository: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Story>, EngineError>;
}

/// Stories kept in memory
#[derive(Debug, Clone)]
pub struct InMemoryStoryRepository {
    stories: Vec<Story>,
}

impl InMemoryStoryRepository {
    pub fn new(stories: Vec<Story>) -> Self {
        Self { stories }
    }

    /// The built-in table-booking catalog
    pub fn book_table() -> Self {
        let entrypoint = Step::new("book_table_entrypoint")
            .requires_intent("book_table")
            .with_next(Step::new("book_table_get_nb_persons").requires_entity("nb_persons"))
            .with_next(Step::new("book_table_get_time").requires_entity("booking_date"));

        Self::new(vec![Story::new("Book a table", vec![entrypoint])])
    }
}

impl Default for InMemoryStoryRepository {
    fn default() -> Self {
        Self::book_table()
    }
}

#[async_trait]
impl StoryRepository for InMemoryStoryRepository {
    async fn find_all(&self) -> Result<Vec<Story>, EngineError> {
        tracing::debug!("Returning {} in-memory stories", self.stories.len());
        Ok(self.stories.clone())
    }
}

/// Stories read from a TOML catalog file
#[derive(Debug, Clone)]
pub struct TomlStoryRepository {
    path: PathBuf,
}

impl TomlStoryRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StoryRepository for TomlStoryRepository {
    async fn find_all(&self) -> Result<Vec<Story>, EngineError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::InvalidCatalog(format!(
                "Failed to read catalog file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!("Parsing story catalog from {}", self.path.display());
        parse_catalog(&contents)
    }
}

/// On-disk catalog layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub stories: Vec<StoryDef>,

    #[serde(default)]
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryDef {
    pub name: String,
    pub starting_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,

    #[serde(default)]
    pub intent: Option<String>,

    #[serde(default)]
    pub entities: Vec<String>,

    #[serde(default)]
    pub next: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Parse TOML catalog text into step trees
///
/// Rejects duplicate definitions, references to undefined steps, steps
/// referenced from more than one place, steps no story can reach, and cycles.
pub fn parse_catalog(contents: &str) -> Result<Vec<Story>, EngineError> {
    let file: CatalogFile = toml::from_str(contents)
        .map_err(|e| EngineError::InvalidCatalog(format!("Failed to parse catalog: {}", e)))?;

    build_stories(&file)
}

fn build_stories(file: &CatalogFile) -> Result<Vec<Story>, EngineError> {
    let mut defs: HashMap<&str, &StepDef> = HashMap::new();
    for def in &file.steps {
        if defs.insert(def.name.as_str(), def).is_some() {
            return Err(EngineError::InvalidCatalog(format!(
                "Step '{}' is defined more than once",
                def.name
            )));
        }
    }

    // Every step must be referenced exactly once so that each one owns a
    // single place in a single tree
    let mut references: HashMap<&str, &str> = HashMap::new();
    let edges = file
        .stories
        .iter()
        .flat_map(|story| story.starting_steps.iter().map(move |s| (story.name.as_str(), s)))
        .chain(
            file.steps
                .iter()
                .flat_map(|def| def.next.iter().map(move |s| (def.name.as_str(), s))),
        );

    for (owner, target) in edges {
        if !defs.contains_key(target.as_str()) {
            return Err(EngineError::InvalidCatalog(format!(
                "'{}' references undefined step '{}'",
                owner, target
            )));
        }
        if let Some(previous) = references.insert(target.as_str(), owner) {
            return Err(EngineError::InvalidCatalog(format!(
                "Step '{}' is referenced by both '{}' and '{}'",
                target, previous, owner
            )));
        }
    }

    if let Some(orphan) = file
        .steps
        .iter()
        .find(|def| !references.contains_key(def.name.as_str()))
    {
        return Err(EngineError::InvalidCatalog(format!(
            "Step '{}' is not reachable from any story",
            orphan.name
        )));
    }

    detect_cycles(&file.steps, &defs)?;

    // Post-order build: children are assembled before their parent
    let mut built: HashMap<&str, Step> = HashMap::new();
    let mut stories = Vec::with_capacity(file.stories.len());

    for story in &file.stories {
        let mut starting_steps = Vec::with_capacity(story.starting_steps.len());

        for root in &story.starting_steps {
            let mut stack: Vec<(&str, bool)> = vec![(root.as_str(), false)];

            while let Some((name, expanded)) = stack.pop() {
                let def = defs[name];
                if expanded {
                    let next = def
                        .next
                        .iter()
                        .map(|child| {
                            built.remove(child.as_str()).ok_or_else(|| {
                                EngineError::InvalidCatalog(format!(
                                    "Step '{}' could not be built",
                                    child
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;

                    built.insert(
                        name,
                        Step {
                            name: def.name.clone(),
                            required_intent: def.intent.clone().filter(|i| !i.is_empty()),
                            required_entities: def.entities.clone(),
                            next,
                        },
                    );
                } else {
                    stack.push((name, true));
                    for child in def.next.iter().rev() {
                        stack.push((child.as_str(), false));
                    }
                }
            }

            let step = built.remove(root.as_str()).ok_or_else(|| {
                EngineError::InvalidCatalog(format!("Step '{}' could not be built", root))
            })?;
            starting_steps.push(step);
        }

        stories.push(Story::new(story.name.clone(), starting_steps));
    }

    Ok(stories)
}

fn detect_cycles(steps: &[StepDef], defs: &HashMap<&str, &StepDef>) -> Result<(), EngineError> {
    let mut state: HashMap<&str, Visit> = HashMap::new();

    for def in steps {
        if state.contains_key(def.name.as_str()) {
            continue;
        }

        state.insert(def.name.as_str(), Visit::InProgress);
        let mut stack: Vec<(&str, usize)> = vec![(def.name.as_str(), 0)];

        while let Some(top) = stack.last_mut() {
            let (name, index) = *top;
            let current = defs[name];

            if index < current.next.len() {
                top.1 += 1;
                let child = current.next[index].as_str();
                match state.get(child) {
                    Some(Visit::InProgress) => {
                        return Err(EngineError::InvalidCatalog(format!(
                            "Cycle detected: step '{}' leads back to '{}'",
                            name, child
                        )));
                    }
                    Some(Visit::Done) => {}
                    None => {
                        state.insert(child, Visit::InProgress);
                        stack.push((child, 0));
                    }
                }
            } else {
                state.insert(name, Visit::Done);
                stack.pop();
            }
        }
    }

    Ok(())
}
