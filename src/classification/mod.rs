pub mod client;
pub mod dispatcher;
pub mod prompts;
pub mod reconciler;

pub use client::{
    Classification, ClassificationError, ClassificationRequest, Classifier, OpenAiClassifier,
    OpenAiConfig,
};
pub use dispatcher::{fail_orphaned_captures, ClassificationDispatcher};
pub use reconciler::{ClassificationOutcome, ReconcileStatus, Reconciler};
