//! Maps a low-level `LndError` to the coarse `LightningErrorCode` the UI
//! is shown in place of a full report (SPEC_FULL.md §4.6).

use super::LndError;
use crate::reports::LightningErrorCode;

/// `None` means the error is not one of the recognized lifecycle states
/// and should be surfaced as a hard failure instead (logged, not
/// reported to the UI as a lightning error code).
pub fn classify_error(err: &LndError) -> Option<LightningErrorCode> {
    match err {
        LndError::ConnectionRefused => Some(LightningErrorCode::NotReady),
        LndError::Api(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("wallet locked") || lower.contains("unlock") {
                Some(LightningErrorCode::Locked)
            } else if lower.contains("not initialized") || lower.contains("no wallet") {
                Some(LightningErrorCode::Uninitialized)
            } else {
                None
            }
        }
        _ => None,
    }
}
