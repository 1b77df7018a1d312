use crate::error::Result;
use crate::io::{ChannelRef, InputSnapshot, OutputCommand, ValueKind};
use std::fmt::Debug;

/// Result of stepping a program once.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<S> {
    pub next: S,
    pub outputs: Vec<OutputCommand>,
}

impl<S> Step<S> {
    pub fn new(next: S, outputs: Vec<OutputCommand>) -> Self {
        Self { next, outputs }
    }

    /// Stay in `state` and write nothing.
    pub fn hold(state: S) -> Self {
        Self {
            next: state,
            outputs: Vec::new(),
        }
    }
}

/// A channel a program reads or writes, with the value kind it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelUse {
    pub channel: ChannelRef,
    pub kind: ValueKind,
}

/// A control algorithm.
///
/// Programs never touch the IO store: `step` maps the current state and the
/// cycle's input snapshot to the next state and a list of output commands,
/// which the engine applies. The state value is owned by the registry entry,
/// not by the program.
pub trait Program: Send + 'static {
    type State: Clone + Debug + Send + 'static;

    /// Stable and unique within a registry.
    fn name(&self) -> &str;

    fn initialize(&self, inputs: &InputSnapshot) -> Self::State;

    fn step(&self, state: &Self::State, inputs: &InputSnapshot) -> Result<Step<Self::State>>;

    /// Output values written when the program is started.
    fn initial_outputs(&self) -> Vec<OutputCommand> {
        Vec::new()
    }

    /// Channels the program reads or writes. Checked against the IO layout
    /// when the program is loaded.
    fn channels(&self) -> Vec<ChannelUse> {
        Vec::new()
    }

    /// Human readable rendering of a state for logs and observers.
    fn describe(&self, state: &Self::State) -> String {
        format!("{state:?}")
    }
}
