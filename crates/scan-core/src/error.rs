use crate::io::{ChannelRef, ValueKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlcError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlcError {
    #[error("channel {channel} is not provided by the configured IO cards")]
    InvalidChannel { channel: ChannelRef },

    #[error("unknown channel name '{name}'")]
    UnknownChannelName { name: String },

    #[error("channel {channel} holds {expected:?} values, got {actual:?}")]
    TypeMismatch {
        channel: ChannelRef,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("a program named '{name}' is already registered")]
    DuplicateName { name: String },

    #[error("no program named '{name}' is registered")]
    ProgramNotFound { name: String },

    #[error("program '{program}' has no transition for state {state} at tick {tick}")]
    UnhandledTransition {
        program: String,
        state: String,
        tick: u64,
    },

    #[error("program '{program}' cannot evaluate {expression}: division by zero")]
    Arithmetic { program: String, expression: String },

    #[error("simulation clock is stopped (tick {tick})")]
    ClockStopped { tick: u64 },

    #[error("cannot {operation} while the engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid program definition: {reason}")]
    InvalidProgram { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("control channel unavailable: {reason}")]
    ControlUnavailable { reason: &'static str },

    #[error("{worker} thread panicked")]
    WorkerPanicked { worker: &'static str },
}

impl PlcError {
    /// Short machine-readable tag, used for metric labels and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidChannel { .. } => "invalid_channel",
            Self::UnknownChannelName { .. } => "unknown_channel_name",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::DuplicateName { .. } => "duplicate_name",
            Self::ProgramNotFound { .. } => "program_not_found",
            Self::UnhandledTransition { .. } => "unhandled_transition",
            Self::Arithmetic { .. } => "arithmetic",
            Self::ClockStopped { .. } => "clock_stopped",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidProgram { .. } => "invalid_program",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::ControlUnavailable { .. } => "control_unavailable",
            Self::WorkerPanicked { .. } => "worker_panicked",
        }
    }
}
