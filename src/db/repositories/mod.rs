pub mod cadence;
pub mod captures;
pub mod labels;
pub mod summaries;

pub use captures::CaptureRepository;
pub use labels::LabelRepository;
pub use summaries::SummaryRepository;
