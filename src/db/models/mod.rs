pub mod cadence;
pub mod capture;
pub mod label;
pub mod summary;

pub use cadence::CadenceMarker;
pub use capture::{Capture, CaptureStats, ClassificationState};
pub use label::{Label, LabelUsage};
pub use summary::{
    Coverage, FiveMinuteContent, HourlyContent, LabelTally, Summary, SummaryContent, SummaryType,
    Transition,
};
