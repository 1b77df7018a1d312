//! IO channel model and the channel store.
//!
//! The [`IoStore`] is the only place IO state lives. Inputs are written by the
//! simulation environment and latched once per scan cycle into an
//! [`InputSnapshot`]; outputs are written by the engine in one batch per cycle.

use crate::error::{PlcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn segment(self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

/// Address of a single channel: card position in the layout, direction and
/// zero-based index. The textual form is `"<card>/in/<n>"` with a 1-based `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelRef {
    pub card: u16,
    pub direction: Direction,
    pub index: u16,
}

impl ChannelRef {
    pub const fn input(card: u16, index: u16) -> Self {
        Self {
            card,
            direction: Direction::Input,
            index,
        }
    }

    pub const fn output(card: u16, index: u16) -> Self {
        Self {
            card,
            direction: Direction::Output,
            index,
        }
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.card,
            self.direction.segment(),
            u32::from(self.index) + 1
        )
    }
}

impl FromStr for ChannelRef {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || PlcError::UnknownChannelName {
            name: s.to_string(),
        };
        let mut parts = s.trim().split('/');
        let (Some(card), Some(dir), Some(n), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(unknown());
        };
        let card: u16 = card.parse().map_err(|_| unknown())?;
        let direction = match dir {
            "in" => Direction::Input,
            "out" => Direction::Output,
            _ => return Err(unknown()),
        };
        let n: u16 = n.parse().map_err(|_| unknown())?;
        if n == 0 {
            return Err(unknown());
        }
        Ok(Self {
            card,
            direction,
            index: n - 1,
        })
    }
}

impl TryFrom<String> for ChannelRef {
    type Error = PlcError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChannelRef> for String {
    fn from(value: ChannelRef) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Analog,
}

impl ValueKind {
    pub fn default_value(self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Analog => Value::Analog(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Analog(f64),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Analog(_) => ValueKind::Analog,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Analog(_) => None,
        }
    }

    pub fn as_analog(&self) -> Option<f64> {
        match self {
            Value::Analog(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Analog(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Analog(v) => write!(f, "{v}"),
        }
    }
}

/// A write the engine performs on behalf of a program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputCommand {
    pub channel: ChannelRef,
    pub value: Value,
}

impl OutputCommand {
    pub fn new(channel: ChannelRef, value: impl Into<Value>) -> Self {
        Self {
            channel,
            value: value.into(),
        }
    }
}

/// A write the simulation environment performs on an input channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputUpdate {
    pub channel: ChannelRef,
    pub value: Value,
}

impl InputUpdate {
    pub fn new(channel: ChannelRef, value: impl Into<Value>) -> Self {
        Self {
            channel,
            value: value.into(),
        }
    }
}

/// A named, fixed-size bundle of channels.
pub trait IoCard: Send + Sync {
    fn name(&self) -> &str;
    fn inputs(&self) -> &[ValueKind];
    fn outputs(&self) -> &[ValueKind];

    fn channel_count(&self) -> usize {
        self.inputs().len() + self.outputs().len()
    }
}

/// Six digital inputs and six digital outputs.
#[derive(Debug, Clone)]
pub struct BasicIoCard {
    name: String,
    inputs: Vec<ValueKind>,
    outputs: Vec<ValueKind>,
}

impl BasicIoCard {
    pub const INPUTS: usize = 6;
    pub const OUTPUTS: usize = 6;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: vec![ValueKind::Bool; Self::INPUTS],
            outputs: vec![ValueKind::Bool; Self::OUTPUTS],
        }
    }
}

impl IoCard for BasicIoCard {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[ValueKind] {
        &self.inputs
    }

    fn outputs(&self) -> &[ValueKind] {
        &self.outputs
    }
}

#[derive(Debug, Clone)]
pub struct AnalogIoCard {
    name: String,
    inputs: Vec<ValueKind>,
    outputs: Vec<ValueKind>,
}

impl AnalogIoCard {
    pub fn new(name: impl Into<String>, inputs: usize, outputs: usize) -> Self {
        Self {
            name: name.into(),
            inputs: vec![ValueKind::Analog; inputs],
            outputs: vec![ValueKind::Analog; outputs],
        }
    }
}

impl IoCard for AnalogIoCard {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[ValueKind] {
        &self.inputs
    }

    fn outputs(&self) -> &[ValueKind] {
        &self.outputs
    }
}

#[derive(Debug, Clone)]
struct CardSlots {
    name: String,
    inputs: Vec<ValueKind>,
    outputs: Vec<ValueKind>,
    input_offset: usize,
    output_offset: usize,
}

/// Channel layout of all cards, frozen at construction.
#[derive(Debug, Clone)]
pub struct IoLayout {
    cards: Vec<CardSlots>,
    input_kinds: Vec<ValueKind>,
    output_kinds: Vec<ValueKind>,
}

impl IoLayout {
    pub fn new(cards: &[Box<dyn IoCard>]) -> Result<Self> {
        if cards.len() > usize::from(u16::MAX) {
            return Err(PlcError::InvalidConfig {
                reason: format!("too many IO cards ({})", cards.len()),
            });
        }
        let mut slots: Vec<CardSlots> = Vec::with_capacity(cards.len());
        let mut input_kinds = Vec::new();
        let mut output_kinds = Vec::new();
        for card in cards {
            if slots.iter().any(|c| c.name == card.name()) {
                return Err(PlcError::InvalidConfig {
                    reason: format!("duplicate IO card name '{}'", card.name()),
                });
            }
            if card.inputs().len() > usize::from(u16::MAX)
                || card.outputs().len() > usize::from(u16::MAX)
            {
                return Err(PlcError::InvalidConfig {
                    reason: format!("IO card '{}' has too many channels", card.name()),
                });
            }
            slots.push(CardSlots {
                name: card.name().to_string(),
                inputs: card.inputs().to_vec(),
                outputs: card.outputs().to_vec(),
                input_offset: input_kinds.len(),
                output_offset: output_kinds.len(),
            });
            input_kinds.extend_from_slice(card.inputs());
            output_kinds.extend_from_slice(card.outputs());
        }
        Ok(Self {
            cards: slots,
            input_kinds,
            output_kinds,
        })
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    pub fn card_name(&self, card: u16) -> Option<&str> {
        self.cards.get(usize::from(card)).map(|c| c.name.as_str())
    }

    pub fn input_count(&self) -> usize {
        self.input_kinds.len()
    }

    pub fn output_count(&self) -> usize {
        self.output_kinds.len()
    }

    /// Flat position of the channel within its direction's image.
    fn slot(&self, channel: ChannelRef) -> Result<usize> {
        let invalid = || PlcError::InvalidChannel { channel };
        let card = self.cards.get(usize::from(channel.card)).ok_or_else(invalid)?;
        let index = usize::from(channel.index);
        match channel.direction {
            Direction::Input if index < card.inputs.len() => Ok(card.input_offset + index),
            Direction::Output if index < card.outputs.len() => Ok(card.output_offset + index),
            _ => Err(invalid()),
        }
    }

    pub fn kind_of(&self, channel: ChannelRef) -> Result<ValueKind> {
        let slot = self.slot(channel)?;
        Ok(match channel.direction {
            Direction::Input => self.input_kinds[slot],
            Direction::Output => self.output_kinds[slot],
        })
    }

    /// Fails unless `channel` exists and carries values of `kind`.
    pub fn check(&self, channel: ChannelRef, kind: ValueKind) -> Result<()> {
        let expected = self.kind_of(channel)?;
        if expected != kind {
            return Err(PlcError::TypeMismatch {
                channel,
                expected,
                actual: kind,
            });
        }
        Ok(())
    }

    /// Every command must target an existing output of the matching kind.
    pub fn check_commands(&self, commands: &[OutputCommand]) -> Result<()> {
        for command in commands {
            if !command.channel.is_output() {
                return Err(PlcError::InvalidChannel {
                    channel: command.channel,
                });
            }
            self.check(command.channel, command.value.kind())?;
        }
        Ok(())
    }

    /// Accepts `"0/in/1"` or the card's name in place of its position
    /// (`"door/in/1"`).
    pub fn resolve(&self, name: &str) -> Result<ChannelRef> {
        let channel = match name.parse::<ChannelRef>() {
            Ok(channel) => channel,
            Err(_) => {
                let (card_name, rest) = name.split_once('/').ok_or_else(|| {
                    PlcError::UnknownChannelName {
                        name: name.to_string(),
                    }
                })?;
                let position = self
                    .cards
                    .iter()
                    .position(|c| c.name == card_name)
                    .ok_or_else(|| PlcError::UnknownChannelName {
                        name: name.to_string(),
                    })?;
                let mut channel: ChannelRef =
                    format!("0/{rest}")
                        .parse()
                        .map_err(|_| PlcError::UnknownChannelName {
                            name: name.to_string(),
                        })?;
                channel.card = position as u16;
                channel
            }
        };
        self.slot(channel)?;
        Ok(channel)
    }

    pub fn inputs(&self) -> impl Iterator<Item = ChannelRef> + '_ {
        self.cards.iter().enumerate().flat_map(|(card, slots)| {
            (0..slots.inputs.len()).map(move |i| ChannelRef::input(card as u16, i as u16))
        })
    }

    pub fn outputs(&self) -> impl Iterator<Item = ChannelRef> + '_ {
        self.cards.iter().enumerate().flat_map(|(card, slots)| {
            (0..slots.outputs.len()).map(move |i| ChannelRef::output(card as u16, i as u16))
        })
    }

    fn default_inputs(&self) -> Vec<Value> {
        self.input_kinds.iter().map(|k| k.default_value()).collect()
    }

    fn default_outputs(&self) -> Vec<Value> {
        self.output_kinds.iter().map(|k| k.default_value()).collect()
    }
}

/// Input image latched at the start of a scan cycle. Every program stepped in
/// that cycle reads from the same snapshot.
#[derive(Debug, Clone)]
pub struct InputSnapshot {
    layout: Arc<IoLayout>,
    tick: u64,
    time: Duration,
    current: Arc<[Value]>,
    previous: Arc<[Value]>,
}

impl InputSnapshot {
    /// Snapshot with every input at its default value and no edges.
    pub fn empty(layout: Arc<IoLayout>, tick: u64, time: Duration) -> Self {
        let values: Arc<[Value]> = layout.default_inputs().into();
        Self {
            layout,
            tick,
            time,
            previous: Arc::clone(&values),
            current: values,
        }
    }

    /// Synthetic snapshot for exercising programs without a store.
    pub fn with_values(
        layout: Arc<IoLayout>,
        tick: u64,
        time: Duration,
        values: &[InputUpdate],
    ) -> Result<Self> {
        let base = Self::empty(layout, tick, time);
        base.advanced(tick, time, values)
    }

    /// Next synthetic snapshot: the current image becomes the previous one and
    /// `values` are applied on top of it.
    pub fn advanced(&self, tick: u64, time: Duration, values: &[InputUpdate]) -> Result<Self> {
        let mut current = self.current.to_vec();
        for update in values {
            if !update.channel.is_input() {
                return Err(PlcError::InvalidChannel {
                    channel: update.channel,
                });
            }
            self.layout.check(update.channel, update.value.kind())?;
            current[self.layout.slot(update.channel)?] = update.value;
        }
        Ok(Self {
            layout: Arc::clone(&self.layout),
            tick,
            time,
            previous: Arc::clone(&self.current),
            current: current.into(),
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulated time at the start of the cycle.
    pub fn time(&self) -> Duration {
        self.time
    }

    pub fn layout(&self) -> &IoLayout {
        &self.layout
    }

    fn input_slot(&self, channel: ChannelRef) -> Result<usize> {
        if !channel.is_input() {
            return Err(PlcError::InvalidChannel { channel });
        }
        self.layout.slot(channel)
    }

    pub fn get(&self, channel: ChannelRef) -> Result<Value> {
        Ok(self.current[self.input_slot(channel)?])
    }

    pub fn previous(&self, channel: ChannelRef) -> Result<Value> {
        Ok(self.previous[self.input_slot(channel)?])
    }

    pub fn bool(&self, channel: ChannelRef) -> Result<bool> {
        let value = self.get(channel)?;
        value.as_bool().ok_or(PlcError::TypeMismatch {
            channel,
            expected: ValueKind::Bool,
            actual: value.kind(),
        })
    }

    pub fn analog(&self, channel: ChannelRef) -> Result<f64> {
        let value = self.get(channel)?;
        value.as_analog().ok_or(PlcError::TypeMismatch {
            channel,
            expected: ValueKind::Analog,
            actual: value.kind(),
        })
    }

    /// `false` in the previous latched image, `true` now.
    pub fn rising(&self, channel: ChannelRef) -> Result<bool> {
        let now = self.bool(channel)?;
        let before = self.previous(channel)?.as_bool().unwrap_or(false);
        Ok(now && !before)
    }

    pub fn falling(&self, channel: ChannelRef) -> Result<bool> {
        let now = self.bool(channel)?;
        let before = self.previous(channel)?.as_bool().unwrap_or(false);
        Ok(!now && before)
    }

    pub fn values(&self) -> &[Value] {
        &self.current
    }
}

/// Output image as committed by the last completed cycle.
#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    layout: Arc<IoLayout>,
    tick: u64,
    values: Arc<[Value]>,
}

impl OutputSnapshot {
    /// Tick of the cycle that committed this image.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn get(&self, channel: ChannelRef) -> Result<Value> {
        if !channel.is_output() {
            return Err(PlcError::InvalidChannel { channel });
        }
        Ok(self.values[self.layout.slot(channel)?])
    }

    pub fn bool(&self, channel: ChannelRef) -> Result<bool> {
        let value = self.get(channel)?;
        value.as_bool().ok_or(PlcError::TypeMismatch {
            channel,
            expected: ValueKind::Bool,
            actual: value.kind(),
        })
    }

    pub fn analog(&self, channel: ChannelRef) -> Result<f64> {
        let value = self.get(channel)?;
        value.as_analog().ok_or(PlcError::TypeMismatch {
            channel,
            expected: ValueKind::Analog,
            actual: value.kind(),
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

struct OutputImage {
    tick: u64,
    values: Arc<[Value]>,
}

/// Holds the value of every input and output channel.
///
/// Single writer per direction: the environment writes inputs, the engine
/// writes outputs. Readers may be concurrent.
pub struct IoStore {
    layout: Arc<IoLayout>,
    inputs: RwLock<Vec<Value>>,
    latched: Mutex<Arc<[Value]>>,
    outputs: RwLock<OutputImage>,
}

impl IoStore {
    pub fn new(cards: &[Box<dyn IoCard>]) -> Result<Self> {
        Ok(Self::from_layout(IoLayout::new(cards)?))
    }

    pub fn from_layout(layout: IoLayout) -> Self {
        let inputs = layout.default_inputs();
        let outputs = layout.default_outputs();
        Self {
            latched: Mutex::new(inputs.clone().into()),
            inputs: RwLock::new(inputs),
            outputs: RwLock::new(OutputImage {
                tick: 0,
                values: outputs.into(),
            }),
            layout: Arc::new(layout),
        }
    }

    pub fn layout(&self) -> &IoLayout {
        &self.layout
    }

    pub fn shared_layout(&self) -> Arc<IoLayout> {
        Arc::clone(&self.layout)
    }

    pub fn read(&self, channel: ChannelRef) -> Result<Value> {
        let slot = self.layout.slot(channel)?;
        Ok(match channel.direction {
            Direction::Input => read_lock(&self.inputs)[slot],
            Direction::Output => read_lock(&self.outputs).values[slot],
        })
    }

    pub fn write(&self, channel: ChannelRef, value: Value) -> Result<()> {
        self.layout.check(channel, value.kind())?;
        let slot = self.layout.slot(channel)?;
        match channel.direction {
            Direction::Input => write_lock(&self.inputs)[slot] = value,
            Direction::Output => {
                let mut image = write_lock(&self.outputs);
                let mut values = image.values.to_vec();
                values[slot] = value;
                image.values = values.into();
            }
        }
        Ok(())
    }

    /// Applies a batch of input writes. Nothing is written unless every update
    /// is valid.
    pub fn apply_inputs(&self, updates: &[InputUpdate]) -> Result<()> {
        let mut slots = Vec::with_capacity(updates.len());
        for update in updates {
            if !update.channel.is_input() {
                return Err(PlcError::InvalidChannel {
                    channel: update.channel,
                });
            }
            self.layout.check(update.channel, update.value.kind())?;
            slots.push((self.layout.slot(update.channel)?, update.value));
        }
        let mut inputs = write_lock(&self.inputs);
        for (slot, value) in slots {
            inputs[slot] = value;
        }
        Ok(())
    }

    /// Latches the current input image. The previously latched image is kept
    /// in the snapshot for edge detection.
    pub fn snapshot_inputs(&self, tick: u64, time: Duration) -> InputSnapshot {
        let current: Arc<[Value]> = read_lock(&self.inputs).as_slice().into();
        let mut latched = self.latched.lock().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *latched, Arc::clone(&current));
        InputSnapshot {
            layout: Arc::clone(&self.layout),
            tick,
            time,
            current,
            previous,
        }
    }

    /// Commits one cycle's output commands in order; the last write to a
    /// channel wins. The image is swapped in one step so readers never observe
    /// a partially applied cycle.
    pub fn apply_outputs(&self, commands: &[OutputCommand], tick: u64) -> Result<usize> {
        let mut slots = Vec::with_capacity(commands.len());
        for command in commands {
            if !command.channel.is_output() {
                return Err(PlcError::InvalidChannel {
                    channel: command.channel,
                });
            }
            self.layout.check(command.channel, command.value.kind())?;
            slots.push((self.layout.slot(command.channel)?, command.value));
        }
        let mut image = write_lock(&self.outputs);
        let mut values = image.values.to_vec();
        for (slot, value) in slots {
            values[slot] = value;
        }
        image.values = values.into();
        image.tick = tick;
        Ok(commands.len())
    }

    pub fn snapshot_outputs(&self) -> OutputSnapshot {
        let image = read_lock(&self.outputs);
        OutputSnapshot {
            layout: Arc::clone(&self.layout),
            tick: image.tick,
            values: Arc::clone(&image.values),
        }
    }

    /// Live input image, including writes not yet latched by a cycle.
    pub fn input_values(&self) -> Vec<Value> {
        read_lock(&self.inputs).clone()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IoStore {
        let cards: Vec<Box<dyn IoCard>> = vec![
            Box::new(BasicIoCard::new("bIO0")),
            Box::new(AnalogIoCard::new("aIO1", 2, 1)),
        ];
        IoStore::new(&cards).unwrap()
    }

    #[test]
    fn channel_names_round_trip_through_display() {
        let ch = ChannelRef::input(0, 4);
        assert_eq!(ch.to_string(), "0/in/5");
        assert_eq!("0/in/5".parse::<ChannelRef>().unwrap(), ch);
        assert!("0/in/0".parse::<ChannelRef>().is_err());
        assert!("0/sideways/1".parse::<ChannelRef>().is_err());
    }

    #[test]
    fn resolves_card_names() {
        let store = store();
        assert_eq!(
            store.layout().resolve("aIO1/out/1").unwrap(),
            ChannelRef::output(1, 0)
        );
        assert!(matches!(
            store.layout().resolve("aIO1/out/2"),
            Err(PlcError::InvalidChannel { .. })
        ));
        assert!(matches!(
            store.layout().resolve("nope/in/1"),
            Err(PlcError::UnknownChannelName { .. })
        ));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let store = store();
        let bad = ChannelRef::input(0, 6);
        assert_eq!(
            store.read(bad),
            Err(PlcError::InvalidChannel { channel: bad })
        );
        assert!(store.write(ChannelRef::output(7, 0), Value::Bool(true)).is_err());
    }

    #[test]
    fn wrong_kind_is_a_type_mismatch() {
        let store = store();
        let res = store.write(ChannelRef::input(1, 0), Value::Bool(true));
        assert!(matches!(res, Err(PlcError::TypeMismatch { .. })));
    }

    #[test]
    fn snapshot_is_stable_while_inputs_change() {
        let store = store();
        let ch = ChannelRef::input(0, 0);
        store.write(ch, Value::Bool(true)).unwrap();
        let snap = store.snapshot_inputs(0, Duration::ZERO);
        store.write(ch, Value::Bool(false)).unwrap();
        assert!(snap.bool(ch).unwrap());
        assert!(!store.read(ch).unwrap().as_bool().unwrap());
    }

    #[test]
    fn snapshots_track_edges_between_latches() {
        let store = store();
        let ch = ChannelRef::input(0, 1);
        store.snapshot_inputs(0, Duration::ZERO);
        store.write(ch, Value::Bool(true)).unwrap();
        let snap = store.snapshot_inputs(1, Duration::from_millis(50));
        assert!(snap.rising(ch).unwrap());
        let snap = store.snapshot_inputs(2, Duration::from_millis(100));
        assert!(!snap.rising(ch).unwrap());
        store.write(ch, Value::Bool(false)).unwrap();
        let snap = store.snapshot_inputs(3, Duration::from_millis(150));
        assert!(snap.falling(ch).unwrap());
    }

    #[test]
    fn output_batch_is_last_write_wins() {
        let store = store();
        let ch = ChannelRef::output(0, 0);
        let commands = [OutputCommand::new(ch, true), OutputCommand::new(ch, false)];
        store.apply_outputs(&commands, 3).unwrap();
        let out = store.snapshot_outputs();
        assert_eq!(out.tick(), 3);
        assert!(!out.bool(ch).unwrap());
    }

    #[test]
    fn invalid_input_batch_writes_nothing() {
        let store = store();
        let good = InputUpdate::new(ChannelRef::input(0, 0), true);
        let bad = InputUpdate::new(ChannelRef::input(0, 9), true);
        assert!(store.apply_inputs(&[good, bad]).is_err());
        assert_eq!(store.read(good.channel).unwrap(), Value::Bool(false));
    }

    #[test]
    fn duplicate_card_names_are_rejected() {
        let cards: Vec<Box<dyn IoCard>> = vec![
            Box::new(BasicIoCard::new("x")),
            Box::new(BasicIoCard::new("x")),
        ];
        assert!(matches!(
            IoStore::new(&cards),
            Err(PlcError::InvalidConfig { .. })
        ));
    }
}
