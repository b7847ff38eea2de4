//! Aggregation state machine

use std::fmt;

/// Lifecycle state of a pending text entry.
///
/// `WaitingForMedia` is the only non-terminal state. An entry leaves it
/// exactly once, either combined with a following image/file or processed
/// on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationState {
    /// Text is buffered, a media/file message may still claim it
    WaitingForMedia,
    /// A media/file message claimed the text
    CombinedWithMedia,
    /// The text was delivered alone (timeout, supersession or cleanup)
    ProcessedAsText,
}

impl AggregationState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::WaitingForMedia)
    }

    /// Whether `self -> target` is a legal transition.
    #[must_use]
    pub const fn can_advance_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (
                Self::WaitingForMedia,
                Self::CombinedWithMedia | Self::ProcessedAsText
            )
        )
    }

    /// Move to `target` if the transition is legal.
    ///
    /// Returns `false` and leaves the state untouched otherwise.
    pub fn advance(&mut self, target: Self) -> bool {
        if self.can_advance_to(target) {
            *self = target;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for AggregationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WaitingForMedia => "WAITING_FOR_MEDIA",
            Self::CombinedWithMedia => "COMBINED_WITH_MEDIA",
            Self::ProcessedAsText => "PROCESSED_AS_TEXT",
        };
        f.write_str(label)
    }
}
