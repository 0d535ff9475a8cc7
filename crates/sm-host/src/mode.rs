//! Operation mode state machine
//!
//! ```text
//! Command --EnterData--> Data --ExitClean--> Command
//!                         |
//!                     ForceExit
//!                         v
//!                        Null --QuitDetected--> Command
//! ```

use tracing::warn;

use crate::error::ModeError;

/// What the host does with received bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationMode {
    /// Bytes are AT command text
    #[default]
    Command,
    /// Bytes are payload for the data mode handler
    Data,
    /// Bytes are discarded until the quit string
    Null,
}

/// Cause of a mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A command started a data mode session
    EnterData,
    /// The session ended normally
    ExitClean,
    /// The session was aborted
    ForceExit,
    /// The quit string resynchronized an aborted session
    QuitDetected,
}

impl Transition {
    /// Mode the transition starts from
    pub fn source(self) -> OperationMode {
        match self {
            Transition::EnterData => OperationMode::Command,
            Transition::ExitClean | Transition::ForceExit => OperationMode::Data,
            Transition::QuitDetected => OperationMode::Null,
        }
    }

    /// Mode the transition leads to
    pub fn target(self) -> OperationMode {
        match self {
            Transition::EnterData => OperationMode::Data,
            Transition::ExitClean | Transition::QuitDetected => OperationMode::Command,
            Transition::ForceExit => OperationMode::Null,
        }
    }
}

impl OperationMode {
    /// Mode after `transition`, or an error leaving the mode untouched
    pub fn apply(self, transition: Transition) -> Result<OperationMode, ModeError> {
        if self == transition.source() {
            Ok(transition.target())
        } else {
            warn!(
                "Rejected mode transition {:?} -> {:?} ({:?})",
                self,
                transition.target(),
                transition
            );
            Err(ModeError::InvalidTransition {
                from: self,
                to: transition.target(),
            })
        }
    }
}
