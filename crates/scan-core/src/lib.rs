pub mod clock;
#[cfg(feature = "simulation")]
pub mod door;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fsm;
mod fsm_proptest;
pub mod io;
pub mod master;
pub mod program;
pub mod registry;
pub mod sync;

pub use clock::{Pacing, SimulationClock, TickEvent};
pub use engine::{
    CycleReport, EngineState, ExecutionEngine, ExecutionStats, ProgramFailure, StartTarget,
    StopHandle,
};
pub use environment::{InputEvent, InputScript, ScriptedEnvironment, SimulationEnvironment, TickInfo};
pub use error::{PlcError, Result};
pub use fsm::{ArithOp, Cmp, FsmBuilder, FsmProgram, FsmState, Guard, Operand, Transition, VarUpdate};
pub use io::{
    AnalogIoCard, BasicIoCard, ChannelRef, Direction, InputSnapshot, InputUpdate, IoCard,
    IoLayout, IoStore, OutputCommand, OutputSnapshot, Value, ValueKind,
};
pub use master::{
    ControlCommand, ControlSender, MasterConfig, PlcMaster, RunHandle, RunOutcome, RunSummary,
};
pub use program::{ChannelUse, Program, Step};
pub use registry::{ProgramRegistry, ProgramSlot};
pub use sync::{BarrierWait, ChannelValue, CycleExchange, CycleSnapshot, Phase, ProgramStatus, TickBarrier};
