pub mod engine;
pub mod evaluator;
pub mod exercises;
pub mod executor;
pub mod intake;
pub mod judge;
pub mod languages;
pub mod sandbox;
pub mod scheduler;
pub mod store;


pub use exercises::{ExerciseCatalog, StaticCatalog};
pub use intake::{JobSpec, SubmitRequest, TestCaseSpec};
pub use judge::{Judge, Submitted};
pub use languages::{LanguageConfig, LanguageRegistry};
pub use store::{ListFilter, MemoryStore, RedisStore, ResultStore};
