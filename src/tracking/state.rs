//! Tracking state reported by the visual front-end and acted on by the
//! fusion loop.

/// State of the visual tracker for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Front-end has not produced a pose yet.
    #[default]
    Initializing,
    /// Pose and landmarks are valid.
    Tracking,
    /// Tracking lost; the fusion loop runs its recovery protocol.
    Lost,
    /// An external reset was consumed on this frame. Handled like `Lost`.
    ResetRequested,
}

impl TrackingState {
    /// Decodes the numeric state used in replay logs: 1 = Initializing,
    /// 2 = Tracking, 3 = Lost. Other codes are rejected.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Initializing),
            2 => Some(Self::Tracking),
            3 => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn is_tracking(self) -> bool {
        self == Self::Tracking
    }

    /// Whether the frame goes through the loss recovery protocol.
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Lost | Self::ResetRequested)
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Tracking => "TRACKING",
            Self::Lost => "LOST",
            Self::ResetRequested => "RESET",
        };
        f.write_str(name)
    }
}
