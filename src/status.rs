use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a dataset.
///
/// The status column is the single source of truth for what must happen to a
/// dataset next: the ingest path advances it through the upload states, and
/// the worker pool polls for the queued states. Every write goes through
/// [`crate::catalog::datasets::compare_and_set_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Submitted,
    UploadQueued,
    Uploading,
    Unzipping,
    SyncQueued,
    Syncing,
    ConversionQueued,
    Converting,
    Done,
    UploadError,
    SyncError,
    ConversionError,
    ConversionFailed,
    Cancelled,
}

impl DatasetStatus {
    /// The stored string form. These are the wire values clients poll for.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::UploadQueued => "upload queued",
            Self::Uploading => "uploading",
            Self::Unzipping => "unzipping",
            Self::SyncQueued => "sync queued",
            Self::Syncing => "syncing",
            Self::ConversionQueued => "conversion queued",
            Self::Converting => "converting",
            Self::Done => "done",
            Self::UploadError => "upload error",
            Self::SyncError => "sync error",
            Self::ConversionError => "conversion error",
            Self::ConversionFailed => "conversion failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "submitted" => Self::Submitted,
            "upload queued" => Self::UploadQueued,
            "uploading" => Self::Uploading,
            "unzipping" => Self::Unzipping,
            "sync queued" => Self::SyncQueued,
            "syncing" => Self::Syncing,
            "conversion queued" => Self::ConversionQueued,
            "converting" => Self::Converting,
            "done" => Self::Done,
            "upload error" => Self::UploadError,
            "sync error" => Self::SyncError,
            "conversion error" => Self::ConversionError,
            "conversion failed" => Self::ConversionFailed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// States the next step of a transition may legally reach from `self`.
    pub fn next_states(&self) -> &'static [DatasetStatus] {
        use DatasetStatus::*;
        match self {
            Submitted => &[UploadQueued, SyncQueued, ConversionQueued, Cancelled],
            UploadQueued => &[Uploading, UploadError, Cancelled],
            Uploading => &[Unzipping, ConversionQueued, Done, UploadError, Cancelled],
            Unzipping => &[ConversionQueued, Done, UploadError, Cancelled],
            SyncQueued => &[Syncing, SyncError, Cancelled],
            Syncing => &[Unzipping, ConversionQueued, Done, SyncError, Cancelled],
            ConversionQueued => &[Converting, Cancelled],
            Converting => &[
                Done,
                ConversionQueued,
                ConversionError,
                ConversionFailed,
                Cancelled,
            ],
            // error -> retry resets are the only cycles in the machine
            UploadError => &[UploadQueued, Cancelled],
            SyncError => &[SyncQueued, Cancelled],
            ConversionError => &[ConversionQueued, ConversionFailed, Cancelled],
            Done | ConversionFailed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: DatasetStatus) -> bool {
        self.next_states().contains(&to)
    }

    /// Terminal states are ignored by the worker pool.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::ConversionFailed | Self::Cancelled)
    }

    /// States the claim loop polls for, in claim order.
    pub fn claimable() -> &'static [DatasetStatus] {
        &[Self::SyncQueued, Self::ConversionQueued]
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a chunked upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks.
    Open,
    /// Assembly in progress; gates double completion.
    Completing,
    Complete,
    Aborted,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "open" => Self::Open,
            "completing" => Self::Completing,
            "complete" => Self::Complete,
            "aborted" => Self::Aborted,
            "expired" => Self::Expired,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Expired)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DatasetStatus; 14] = [
        DatasetStatus::Submitted,
        DatasetStatus::UploadQueued,
        DatasetStatus::Uploading,
        DatasetStatus::Unzipping,
        DatasetStatus::SyncQueued,
        DatasetStatus::Syncing,
        DatasetStatus::ConversionQueued,
        DatasetStatus::Converting,
        DatasetStatus::Done,
        DatasetStatus::UploadError,
        DatasetStatus::SyncError,
        DatasetStatus::ConversionError,
        DatasetStatus::ConversionFailed,
        DatasetStatus::Cancelled,
    ];

    #[test]
    fn string_round_trip() {
        for status in ALL {
            assert_eq!(DatasetStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DatasetStatus::parse("nonsense"), None);
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in ALL {
            if status.is_terminal() {
                assert!(status.next_states().is_empty(), "{status} must be terminal");
            } else {
                assert!(!status.next_states().is_empty());
            }
        }
    }

    #[test]
    fn happy_path_is_reachable() {
        use DatasetStatus::*;
        let path = [Submitted, UploadQueued, Uploading, ConversionQueued, Converting, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn sync_path_lands_in_conversion_queue() {
        use DatasetStatus::*;
        assert!(SyncQueued.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(ConversionQueued));
        assert!(!SyncQueued.can_transition_to(Converting));
    }

    #[test]
    fn retry_cycle_goes_through_queue() {
        use DatasetStatus::*;
        assert!(Converting.can_transition_to(ConversionQueued));
        assert!(ConversionError.can_transition_to(ConversionQueued));
        assert!(!Done.can_transition_to(ConversionQueued));
    }

    #[test]
    fn claim_is_the_only_exit_to_converting() {
        for status in ALL {
            if status.can_transition_to(DatasetStatus::Converting) {
                assert_eq!(status, DatasetStatus::ConversionQueued);
            }
        }
    }

    #[test]
    fn session_state_round_trip() {
        for state in [
            SessionState::Open,
            SessionState::Completing,
            SessionState::Complete,
            SessionState::Aborted,
            SessionState::Expired,
        ] {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
    }
}
