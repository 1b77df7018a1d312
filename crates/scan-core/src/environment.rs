use crate::io::{ChannelRef, InputUpdate, IoLayout, OutputSnapshot, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInfo {
    /// Tick the clock just advanced to. Inputs written now are scanned by the
    /// cycle at this tick.
    pub tick: u64,
    pub time: Duration,
}

/// The simulated plant wired to the IO cards.
///
/// Between two cycles the environment observes the committed outputs and
/// decides the inputs the next cycle will see. It never writes outputs.
pub trait SimulationEnvironment: Send {
    fn name(&self) -> &str;

    /// Inputs in place before the engine starts.
    fn prepare(&mut self, _layout: &IoLayout) -> Vec<InputUpdate> {
        Vec::new()
    }

    fn on_tick(&mut self, tick: TickInfo, outputs: &OutputSnapshot) -> Vec<InputUpdate>;
}

/// An input value forced at a given tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub at_tick: u64,
    pub channel: ChannelRef,
    pub value: Value,
}

impl InputEvent {
    pub fn new(at_tick: u64, channel: ChannelRef, value: impl Into<Value>) -> Self {
        Self {
            at_tick,
            channel,
            value: value.into(),
        }
    }
}

/// Scripted stimulus, replayed by tick.
#[derive(Debug, Clone, Default)]
pub struct InputScript {
    events: Vec<InputEvent>,
}

impl InputScript {
    pub fn new(mut events: Vec<InputEvent>) -> Self {
        // Stable: events sharing a tick keep their relative order.
        events.sort_by_key(|e| e.at_tick);
        Self { events }
    }

    pub fn push(&mut self, event: InputEvent) {
        let at = self.events.partition_point(|e| e.at_tick <= event.at_tick);
        self.events.insert(at, event);
    }

    pub fn due(&self, tick: u64) -> impl Iterator<Item = InputUpdate> + '_ {
        self.events
            .iter()
            .filter(move |e| e.at_tick == tick)
            .map(|e| InputUpdate::new(e.channel, e.value))
    }

    pub fn last_tick(&self) -> Option<u64> {
        self.events.last().map(|e| e.at_tick)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Environment that only replays a script. Useful for driving programs
/// without a plant model.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEnvironment {
    script: InputScript,
}

impl ScriptedEnvironment {
    pub fn new(script: InputScript) -> Self {
        Self { script }
    }
}

impl SimulationEnvironment for ScriptedEnvironment {
    fn name(&self) -> &str {
        "scripted"
    }

    fn prepare(&mut self, _layout: &IoLayout) -> Vec<InputUpdate> {
        self.script.due(0).collect()
    }

    fn on_tick(&mut self, tick: TickInfo, _outputs: &OutputSnapshot) -> Vec<InputUpdate> {
        self.script.due(tick.tick).collect()
    }
}
