pub mod registry;

pub use registry::{dedup_label_names, normalize_label_name, LabelRegistry};
