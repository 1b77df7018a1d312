//! Garage door demo: a control program and the motor-driven door it drives.
//!
//! Both use the first [`BasicIoCard`](crate::io::BasicIoCard) of the layout:
//!
//! | channel  | meaning                       |
//! |----------|-------------------------------|
//! | `0/in/1` | open button                   |
//! | `0/in/2` | close button                  |
//! | `0/in/3` | top end switch (fully open)   |
//! | `0/in/4` | bottom end switch (closed)    |
//! | `0/in/5` | obstacle under the door       |
//! | `0/out/1`| motor forward (opening)       |
//! | `0/out/2`| motor reverse (closing)       |

use crate::environment::{InputEvent, InputScript, SimulationEnvironment, TickInfo};
use crate::error::Result;
use crate::fsm::{FsmProgram, Guard, Transition};
use crate::io::{ChannelRef, InputUpdate, IoLayout, OutputSnapshot};

pub const OPEN_BUTTON: ChannelRef = ChannelRef::input(0, 0);
pub const CLOSE_BUTTON: ChannelRef = ChannelRef::input(0, 1);
pub const TOP_SENSOR: ChannelRef = ChannelRef::input(0, 2);
pub const BOTTOM_SENSOR: ChannelRef = ChannelRef::input(0, 3);
pub const OBSTACLE: ChannelRef = ChannelRef::input(0, 4);
pub const MOTOR_FORWARD: ChannelRef = ChannelRef::output(0, 0);
pub const MOTOR_REVERSE: ChannelRef = ChannelRef::output(0, 1);

pub const PROGRAM_NAME: &str = "garage-door";
pub const DEFAULT_TRAVEL_TICKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorState {
    Closed,
    Opening,
    Open,
    Closing,
}

pub fn garage_door_program() -> Result<FsmProgram<DoorState>> {
    use DoorState::*;

    FsmProgram::builder(PROGRAM_NAME, Closed)
        .states([Closed, Opening, Open, Closing])
        .holding_all()
        .output(MOTOR_FORWARD, false)
        .output(MOTOR_REVERSE, false)
        .transition(
            Transition::new(Closed, Opening)
                .when(Guard::input(OPEN_BUTTON))
                .set(MOTOR_FORWARD, true),
        )
        .transition(
            Transition::new(Opening, Open)
                .when(Guard::input(TOP_SENSOR))
                .set(MOTOR_FORWARD, false),
        )
        .transition(
            Transition::new(Opening, Closing)
                .when(Guard::input(CLOSE_BUTTON))
                .set(MOTOR_FORWARD, false)
                .set(MOTOR_REVERSE, true),
        )
        .transition(
            Transition::new(Open, Closing)
                .when(Guard::input(CLOSE_BUTTON))
                .set(MOTOR_REVERSE, true),
        )
        // Reopen on an obstacle before checking the end switch.
        .transition(
            Transition::new(Closing, Opening)
                .when(Guard::input(OBSTACLE).or(Guard::input(OPEN_BUTTON)))
                .set(MOTOR_REVERSE, false)
                .set(MOTOR_FORWARD, true),
        )
        .transition(
            Transition::new(Closing, Closed)
                .when(Guard::input(BOTTOM_SENSOR))
                .set(MOTOR_REVERSE, false),
        )
        .build()
}

/// Door leaf moving one step per tick while a motor output is on.
///
/// Position 0 is closed, `travel_ticks` is fully open. End switches follow
/// the position; buttons and obstacles come from a script.
#[derive(Debug, Clone)]
pub struct DoorWorld {
    travel_ticks: u32,
    position: u32,
    script: InputScript,
    motor_faults: u64,
}

impl Default for DoorWorld {
    fn default() -> Self {
        Self::new(DEFAULT_TRAVEL_TICKS)
    }
}

impl DoorWorld {
    pub fn new(travel_ticks: u32) -> Self {
        Self {
            travel_ticks: travel_ticks.max(1),
            position: 0,
            script: InputScript::default(),
            motor_faults: 0,
        }
    }

    pub fn with_script(mut self, events: Vec<InputEvent>) -> Self {
        self.script = InputScript::new(events);
        self
    }

    /// Press and release a button: high at `at_tick`, low one tick later.
    pub fn press(mut self, button: ChannelRef, at_tick: u64) -> Self {
        self.script.push(InputEvent::new(at_tick, button, true));
        self.script.push(InputEvent::new(at_tick + 1, button, false));
        self
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn travel_ticks(&self) -> u32 {
        self.travel_ticks
    }

    pub fn is_open(&self) -> bool {
        self.position >= self.travel_ticks
    }

    pub fn is_closed(&self) -> bool {
        self.position == 0
    }

    /// Ticks on which both motor directions were driven at once.
    pub fn motor_faults(&self) -> u64 {
        self.motor_faults
    }

    fn sensors(&self) -> [InputUpdate; 2] {
        [
            InputUpdate::new(TOP_SENSOR, self.is_open()),
            InputUpdate::new(BOTTOM_SENSOR, self.is_closed()),
        ]
    }
}

impl SimulationEnvironment for DoorWorld {
    fn name(&self) -> &str {
        "door-world"
    }

    fn prepare(&mut self, _layout: &IoLayout) -> Vec<InputUpdate> {
        let mut updates = self.sensors().to_vec();
        updates.extend(self.script.due(0));
        updates
    }

    fn on_tick(&mut self, tick: TickInfo, outputs: &OutputSnapshot) -> Vec<InputUpdate> {
        let forward = outputs.bool(MOTOR_FORWARD).unwrap_or(false);
        let reverse = outputs.bool(MOTOR_REVERSE).unwrap_or(false);
        match (forward, reverse) {
            (true, true) => {
                self.motor_faults += 1;
                log::warn!("Door motor driven both ways at tick {}", tick.tick);
            }
            (true, false) => self.position = (self.position + 1).min(self.travel_ticks),
            (false, true) => self.position = self.position.saturating_sub(1),
            (false, false) => {}
        }

        let mut updates = self.sensors().to_vec();
        updates.extend(self.script.due(tick.tick));
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BasicIoCard, InputSnapshot, IoCard, IoStore, OutputCommand};
    use crate::program::Program;
    use std::sync::Arc;
    use std::time::Duration;

    fn layout() -> Arc<IoLayout> {
        let cards: Vec<Box<dyn IoCard>> = vec![Box::new(BasicIoCard::new("door"))];
        Arc::new(IoLayout::new(&cards).unwrap())
    }

    #[test]
    fn closed_door_opens_on_button() {
        let program = garage_door_program().unwrap();
        let snap = InputSnapshot::empty(layout(), 0, Duration::ZERO);
        let state = program.initialize(&snap);
        assert_eq!(state.current, DoorState::Closed);

        let snap = snap
            .advanced(1, Duration::from_millis(50), &[InputUpdate::new(OPEN_BUTTON, true)])
            .unwrap();
        let step = program.step(&state, &snap).unwrap();
        assert_eq!(step.next.current, DoorState::Opening);
        assert_eq!(step.outputs, vec![OutputCommand::new(MOTOR_FORWARD, true)]);
    }

    #[test]
    fn obstacle_reverses_a_closing_door() {
        let program = garage_door_program().unwrap();
        let snap = InputSnapshot::empty(layout(), 0, Duration::ZERO);
        let mut state = program.initialize(&snap);
        state.current = DoorState::Closing;

        let snap = snap
            .advanced(
                1,
                Duration::from_millis(50),
                &[
                    InputUpdate::new(OBSTACLE, true),
                    InputUpdate::new(BOTTOM_SENSOR, true),
                ],
            )
            .unwrap();
        let step = program.step(&state, &snap).unwrap();
        assert_eq!(step.next.current, DoorState::Opening);
        assert!(step.outputs.contains(&OutputCommand::new(MOTOR_FORWARD, true)));
    }

    #[test]
    fn world_moves_with_the_motor_and_reports_end_switches() {
        let cards: Vec<Box<dyn IoCard>> = vec![Box::new(BasicIoCard::new("door"))];
        let store = IoStore::new(&cards).unwrap();
        let mut world = DoorWorld::new(2);
        let initial = world.prepare(store.layout());
        assert!(initial.contains(&InputUpdate::new(BOTTOM_SENSOR, true)));

        store
            .apply_outputs(&[OutputCommand::new(MOTOR_FORWARD, true)], 0)
            .unwrap();
        let tick = |n| TickInfo {
            tick: n,
            time: Duration::from_millis(50 * n),
        };
        world.on_tick(tick(1), &store.snapshot_outputs());
        let updates = world.on_tick(tick(2), &store.snapshot_outputs());
        assert!(world.is_open());
        assert!(updates.contains(&InputUpdate::new(TOP_SENSOR, true)));
        // Saturates at the top.
        world.on_tick(tick(3), &store.snapshot_outputs());
        assert_eq!(world.position(), 2);

        store
            .apply_outputs(&[OutputCommand::new(MOTOR_REVERSE, true)], 3)
            .unwrap();
        world.on_tick(tick(4), &store.snapshot_outputs());
        assert_eq!(world.position(), 2);
        assert_eq!(world.motor_faults(), 1);
    }

    #[test]
    fn scripted_press_is_released_a_tick_later() {
        let cards: Vec<Box<dyn IoCard>> = vec![Box::new(BasicIoCard::new("door"))];
        let store = IoStore::new(&cards).unwrap();
        let mut world = DoorWorld::default().press(CLOSE_BUTTON, 4);
        let outputs = store.snapshot_outputs();
        let at = |world: &mut DoorWorld, n: u64| {
            world.on_tick(
                TickInfo {
                    tick: n,
                    time: Duration::from_millis(50 * n),
                },
                &outputs,
            )
        };
        assert!(at(&mut world, 4).contains(&InputUpdate::new(CLOSE_BUTTON, true)));
        assert!(at(&mut world, 5).contains(&InputUpdate::new(CLOSE_BUTTON, false)));
    }
}
