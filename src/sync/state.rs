//! Per-placeholder request lifecycle
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Original | `SourceAccepted` | SourceRemoved |
//! | SourceRemoved, Failed | `Selected` | Requesting |
//! | Requesting | `CacheHit` | Succeeded |
//! | Requesting | `CacheMiss` | Downloading |
//! | Downloading | `FetchSucceeded` | Succeeded |
//! | Requesting, Downloading | `FetchFailed { retryable: true }` | Failed |
//! | Requesting, Downloading | `FetchFailed { retryable: false }` | Invalid |
//! | Requesting, Downloading | `Abandoned` | SourceRemoved |
//! | any but Original | `LocatorChanged` | Original |
//!
//! Anything else is rejected and leaves the state unchanged.

use serde::Serialize;
use std::fmt;

/// Where a placeholder is in the request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementState {
    #[default]
    Original,
    SourceRemoved,
    Requesting,
    Downloading,
    Succeeded,
    Failed,
    Invalid,
}

/// Input driving an [`ElementState`] transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementEvent {
    /// Locator is a well-formed, allowed external reference; native load blocked
    SourceAccepted,
    /// Picked for a cache request by a pass
    Selected,
    CacheHit,
    CacheMiss,
    /// Fetched and the blob is on disk
    FetchSucceeded,
    FetchFailed { retryable: bool },
    /// The user edited the locator
    LocatorChanged,
    /// The pass that selected this placeholder lost its view
    Abandoned,
}

impl ElementState {
    /// Next state, or `None` if `event` is not valid here
    pub fn transition(self, event: ElementEvent) -> Option<ElementState> {
        use ElementEvent as E;
        use ElementState as S;

        match (self, event) {
            (S::Original, E::SourceAccepted) => Some(S::SourceRemoved),
            (S::SourceRemoved | S::Failed, E::Selected) => Some(S::Requesting),
            (S::Requesting, E::CacheHit) => Some(S::Succeeded),
            (S::Requesting, E::CacheMiss) => Some(S::Downloading),
            (S::Downloading, E::FetchSucceeded) => Some(S::Succeeded),
            (S::Requesting | S::Downloading, E::FetchFailed { retryable: true }) => Some(S::Failed),
            (S::Requesting | S::Downloading, E::FetchFailed { retryable: false }) => {
                Some(S::Invalid)
            }
            (S::Requesting | S::Downloading, E::Abandoned) => Some(S::SourceRemoved),
            (S::Original, E::LocatorChanged) => None,
            (_, E::LocatorChanged) => Some(S::Original),
            _ => None,
        }
    }

    /// Eligible for (re-)selection by a pass
    pub fn is_selectable(self) -> bool {
        matches!(self, Self::Original | Self::SourceRemoved | Self::Failed)
    }

    /// A pass has claimed this placeholder and not resolved it yet
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Requesting | Self::Downloading)
    }

    /// Terminal until the locator changes
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Invalid)
    }
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Original => "original",
            Self::SourceRemoved => "source-removed",
            Self::Requesting => "requesting",
            Self::Downloading => "downloading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Invalid => "invalid",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::ElementEvent as E;
    use super::ElementState as S;

    const ALL: [S; 7] = [
        S::Original,
        S::SourceRemoved,
        S::Requesting,
        S::Downloading,
        S::Succeeded,
        S::Failed,
        S::Invalid,
    ];

    fn run(start: S, events: &[E]) -> Option<S> {
        events
            .iter()
            .try_fold(start, |state, event| state.transition(*event))
    }

    #[test]
    fn hit_path() {
        assert_eq!(
            run(S::Original, &[E::SourceAccepted, E::Selected, E::CacheHit]),
            Some(S::Succeeded)
        );
    }

    #[test]
    fn download_path() {
        assert_eq!(
            run(
                S::Original,
                &[E::SourceAccepted, E::Selected, E::CacheMiss, E::FetchSucceeded]
            ),
            Some(S::Succeeded)
        );
    }

    #[test]
    fn failures_split_by_retryability() {
        let downloading = run(S::Original, &[E::SourceAccepted, E::Selected, E::CacheMiss]);
        assert_eq!(downloading, Some(S::Downloading));

        assert_eq!(
            S::Downloading.transition(E::FetchFailed { retryable: true }),
            Some(S::Failed)
        );
        assert_eq!(
            S::Downloading.transition(E::FetchFailed { retryable: false }),
            Some(S::Invalid)
        );
        assert_eq!(
            S::Requesting.transition(E::FetchFailed { retryable: false }),
            Some(S::Invalid)
        );
    }

    #[test]
    fn failed_is_reselectable_invalid_is_not() {
        assert_eq!(S::Failed.transition(E::Selected), Some(S::Requesting));
        assert_eq!(S::Invalid.transition(E::Selected), None);
        assert_eq!(S::Succeeded.transition(E::Selected), None);
    }

    #[test]
    fn locator_change_resets_processed_states() {
        for state in ALL {
            let next = state.transition(E::LocatorChanged);
            if state == S::Original {
                assert_eq!(next, None);
            } else {
                assert_eq!(next, Some(S::Original), "from {}", state);
            }
        }
    }

    #[test]
    fn abandoned_returns_claimed_placeholders() {
        assert_eq!(S::Requesting.transition(E::Abandoned), Some(S::SourceRemoved));
        assert_eq!(S::Downloading.transition(E::Abandoned), Some(S::SourceRemoved));
        assert_eq!(S::Succeeded.transition(E::Abandoned), None);
    }

    #[test]
    fn selectable_and_in_flight_are_disjoint() {
        for state in ALL {
            assert!(!(state.is_selectable() && state.is_in_flight()), "{}", state);
            assert!(!(state.is_selectable() && state.is_settled()), "{}", state);
        }
        assert!(S::Original.is_selectable());
        assert!(S::Failed.is_selectable());
        assert!(S::Downloading.is_in_flight());
    }

    #[test]
    fn results_cannot_skip_states() {
        assert_eq!(S::Original.transition(E::CacheHit), None);
        assert_eq!(S::SourceRemoved.transition(E::FetchSucceeded), None);
        assert_eq!(S::Requesting.transition(E::FetchSucceeded), None);
    }
}
