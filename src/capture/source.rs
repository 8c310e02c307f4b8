//! Snapshot acquisition.
//!
//! The pipeline only needs "give me one screenshot as bytes". `CommandSource`
//! gets it from an external screenshot tool that writes an image to stdout
//! (`grim -` on Wayland, `import -window root png:-` on X11,
//! `screencapture -x -t png /dev/stdout` on macOS).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use image::ImageFormat;
use thiserror::Error;
use tokio::process::Command;

/// Anything smaller is almost certainly an error page or a blank frame.
pub const DEFAULT_MIN_SNAPSHOT_BYTES: usize = 1000;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no snapshot command configured")]
    NoCommand,

    #[error("failed to run snapshot command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("snapshot command timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("snapshot too small ({bytes} bytes, need at least {min})")]
    TooSmall { bytes: usize, min: usize },

    #[error("snapshot is not a recognizable image")]
    NotAnImage,

    #[error("snapshot decoded as {0:?}; only PNG and JPEG are accepted")]
    UnsupportedFormat(ImageFormat),
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Checks that `bytes` is a PNG or JPEG of at least `min_bytes`.
pub fn validate_snapshot(bytes: &[u8], min_bytes: usize) -> Result<ImageFormat, CaptureError> {
    if bytes.len() < min_bytes {
        return Err(CaptureError::TooSmall {
            bytes: bytes.len(),
            min: min_bytes,
        });
    }
    let format = image::guess_format(bytes).map_err(|_| CaptureError::NotAnImage)?;
    match format {
        ImageFormat::Png | ImageFormat::Jpeg => Ok(format),
        other => Err(CaptureError::UnsupportedFormat(other)),
    }
}

#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    min_bytes: usize,
}

impl CommandSource {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, CaptureError> {
        let (program, args) = command.split_first().ok_or(CaptureError::NoCommand)?;
        if program.trim().is_empty() {
            return Err(CaptureError::NoCommand);
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            min_bytes: DEFAULT_MIN_SNAPSHOT_BYTES,
        })
    }

    pub fn with_min_bytes(mut self, min_bytes: usize) -> Self {
        self.min_bytes = min_bytes;
        self
    }
}

#[async_trait]
impl SnapshotSource for CommandSource {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CaptureError::Timeout(self.timeout))?
            .map_err(|source| CaptureError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        validate_snapshot(&output.stdout, self.min_bytes)?;
        Ok(output.stdout)
    }
}
