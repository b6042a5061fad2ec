//! Document classification and field extraction.

pub mod classifier;
pub mod model;
pub mod schema;
pub mod types;

pub use classifier::{Classifier, ClassifyRequest};
pub use model::{RigVision, VisionModel, VisionRequest, anthropic_vision};
pub use schema::ExtractionSchema;
pub use types::{ClassificationResult, DocumentType, ParseResult, ParseStatus};
