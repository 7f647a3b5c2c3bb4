pub mod classifier;
pub mod ingestor;

pub use classifier::{SceneClassification, SceneClassifier};
pub use ingestor::{EventIngestor, IdleDetector, IngestConfig, IngestStats, NeverIdle};
