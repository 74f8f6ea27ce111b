// Exercise catalog: the "exercise lookup" collaborator contract
use anyhow::{Context, Result};
use gavel_common::config::LimitPolicy;
use gavel_common::error::{JudgeError, JudgeResult};
use gavel_common::types::Exercise;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

pub trait ExerciseCatalog: Send + Sync {
    fn lookup(&self, id: &str) -> Option<Exercise>;

    fn list(&self) -> Vec<Exercise>;

    fn upsert(&self, exercise: Exercise) -> JudgeResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ExercisesJson {
    exercises: Vec<Exercise>,
}

/// Check an exercise against the configured limit bounds
pub fn validate_exercise(exercise: &Exercise, policy: &LimitPolicy) -> JudgeResult<()> {
    let mut problems = Vec::new();

    if exercise.id.trim().is_empty() {
        problems.push("exercise id cannot be empty".to_string());
    }
    if exercise.title.trim().is_empty() {
        problems.push("exercise title cannot be empty".to_string());
    }
    if exercise.test_cases.is_empty() {
        problems.push("exercise must have at least one test case".to_string());
    }
    if !(policy.min_time_secs..=policy.max_time_secs).contains(&exercise.time_limit_secs) {
        problems.push(format!(
            "time_limit_secs must be between {} and {}",
            policy.min_time_secs, policy.max_time_secs
        ));
    }
    if !(policy.min_memory_mb..=policy.max_memory_mb).contains(&exercise.memory_limit_mb) {
        problems.push(format!(
            "memory_limit_mb must be between {} and {}",
            policy.min_memory_mb, policy.max_memory_mb
        ));
    }
    if let Some(tc) = exercise
        .test_cases
        .iter()
        .position(|tc| tc.input.len() > policy.max_test_input_bytes)
    {
        problems.push(format!("test case {} input is too large", tc + 1));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(JudgeError::Validation(problems))
    }
}

/// File-seeded, in-memory catalog
#[derive(Debug)]
pub struct StaticCatalog {
    exercises: RwLock<BTreeMap<String, Exercise>>,
    policy: LimitPolicy,
}

impl StaticCatalog {
    pub fn empty(policy: LimitPolicy) -> Self {
        Self {
            exercises: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    pub fn from_exercises(exercises: Vec<Exercise>, policy: LimitPolicy) -> JudgeResult<Self> {
        let catalog = Self::empty(policy);
        for exercise in exercises {
            catalog.upsert(exercise)?;
        }
        Ok(catalog)
    }

    /// Load `{"exercises": [...]}`, validating every entry
    pub fn load(path: &Path, policy: LimitPolicy) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: ExercisesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Self::from_exercises(parsed.exercises, policy)
            .with_context(|| format!("Invalid exercise in {}", path.display()))
    }

    /// Load the file if it exists, otherwise start empty
    pub fn load_or_empty(path: &Path, policy: LimitPolicy) -> Result<Self> {
        if path.exists() {
            Self::load(path, policy)
        } else {
            Ok(Self::empty(policy))
        }
    }
}

impl ExerciseCatalog for StaticCatalog {
    fn lookup(&self, id: &str) -> Option<Exercise> {
        self.exercises.read().ok()?.get(id).cloned()
    }

    fn list(&self) -> Vec<Exercise> {
        self.exercises
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    fn upsert(&self, exercise: Exercise) -> JudgeResult<()> {
        validate_exercise(&exercise, &self.policy)?;
        let mut exercises = self
            .exercises
            .write()
            .map_err(|_| JudgeError::Internal("exercise catalog lock poisoned".to_string()))?;
        exercises.insert(exercise.id.clone(), exercise);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::types::{Difficulty, TestCase};

    fn exercise(id: &str, time: u32, memory: u32) -> Exercise {
        Exercise {
            id: id.to_string(),
            title: "Sum".to_string(),
            description: "Add two numbers".to_string(),
            starter_code: String::new(),
            test_cases: vec![TestCase {
                input: "1 2".to_string(),
                expected_output: "3".to_string(),
                description: None,
            }],
            time_limit_secs: time,
            memory_limit_mb: memory,
            difficulty: Difficulty::Easy,
        }
    }

    #[test]
    fn test_upsert_and_lookup() {
        let catalog = StaticCatalog::empty(LimitPolicy::default());
        catalog.upsert(exercise("sum", 2, 64)).unwrap();
        assert_eq!(catalog.lookup("sum").unwrap().time_limit_secs, 2);
        assert!(catalog.lookup("missing").is_none());

        catalog.upsert(exercise("sum", 3, 64)).unwrap();
        assert_eq!(catalog.list().len(), 1);
        assert_eq!(catalog.lookup("sum").unwrap().time_limit_secs, 3);
    }

    #[test]
    fn test_rejects_out_of_bounds_limits() {
        let catalog = StaticCatalog::empty(LimitPolicy::default());
        match catalog.upsert(exercise("sum", 60, 1024)) {
            Err(JudgeError::Validation(problems)) => assert_eq!(problems.len(), 2),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_tests() {
        let mut ex = exercise("sum", 2, 64);
        ex.test_cases.clear();
        assert!(validate_exercise(&ex, &LimitPolicy::default()).is_err());
    }

    #[test]
    fn test_load_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exercises.json");
        fs::write(
            &path,
            r#"{"exercises": [{"id": "hello", "title": "Hello",
                "test_cases": [{"input": "", "expected_output": "Hello World"}]}]}"#,
        )
        .unwrap();

        let catalog = StaticCatalog::load(&path, LimitPolicy::default()).unwrap();
        let hello = catalog.lookup("hello").unwrap();
        assert_eq!(hello.time_limit_secs, 5);
        assert_eq!(hello.memory_limit_mb, 128);
        assert_eq!(hello.difficulty, Difficulty::Easy);
    }

    #[test]
    fn test_missing_file_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog =
            StaticCatalog::load_or_empty(&dir.path().join("none.json"), LimitPolicy::default())
                .unwrap();
        assert!(catalog.list().is_empty());
    }
}
