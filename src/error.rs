use crate::intercept::HookError;
use crate::sink::SinkError;

/// Failures that prevent a tap from starting. Nothing on the packet path
/// produces one of these.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("cannot acquire interception point: {0}")]
    Hook(#[from] HookError),
    #[error("cannot open sink: {0}")]
    Sink(#[from] SinkError),
}
