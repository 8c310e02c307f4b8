mod source;

pub use source::{
    validate_snapshot, CaptureError, CommandSource, SnapshotSource, DEFAULT_MIN_SNAPSHOT_BYTES,
};
