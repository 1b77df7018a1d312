//! Finite-state-machine programs.
//!
//! An [`FsmProgram`] is a fixed set of states and an ordered transition table.
//! On every step the transitions leaving the current state are tried in
//! declaration order and the first one whose guard holds is taken. When no
//! guard holds the program stays put if the state was declared as holding,
//! otherwise the step fails with `UnhandledTransition`.
//!
//! Guards compare numeric [`Operand`]s, which may be arithmetic over inputs,
//! variables and named timers. Variables and timers change only through the
//! [`VarUpdate`]s of the transition taken.

use crate::error::{PlcError, Result};
use crate::io::{ChannelRef, InputSnapshot, OutputCommand, ValueKind};
use crate::program::{ChannelUse, Program, Step};
use std::fmt::{self, Debug};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl Cmp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
            Cmp::Ge => lhs >= rhs,
            Cmp::Gt => lhs > rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Remainder with the sign of the dividend.
    Rem,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
        }
    }
}

/// Numeric value a guard can compare or an update can assign.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Analog input.
    Input(ChannelRef),
    /// Program variable.
    Var(String),
    /// Milliseconds of simulated time since the named timer was last set.
    Timer(String),
    Const(f64),
    /// Milliseconds of simulated time since the current state was entered.
    TimeInStateMs,
    Arith(Box<Operand>, ArithOp, Box<Operand>),
    /// Truncates toward zero.
    Trunc(Box<Operand>),
}

impl Operand {
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Var(name.into())
    }

    pub fn timer(name: impl Into<String>) -> Self {
        Operand::Timer(name.into())
    }

    pub fn trunc(self) -> Self {
        Operand::Trunc(Box::new(self))
    }

    fn arith(self, op: ArithOp, rhs: Operand) -> Self {
        Operand::Arith(Box::new(self), op, Box::new(rhs))
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Operand)) {
        f(self);
        match self {
            Operand::Arith(lhs, _, rhs) => {
                lhs.visit(&mut *f);
                rhs.visit(&mut *f);
            }
            Operand::Trunc(inner) => inner.visit(&mut *f),
            _ => {}
        }
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Const(value)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Input(ch) => write!(f, "{ch}"),
            Operand::Var(name) => write!(f, "{name}"),
            Operand::Timer(name) => write!(f, "timer({name})"),
            Operand::Const(v) => write!(f, "{v}"),
            Operand::TimeInStateMs => write!(f, "time_in_state"),
            Operand::Arith(lhs, op, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Operand::Trunc(inner) => write!(f, "int({inner})"),
        }
    }
}

macro_rules! operand_ops {
    ($($trait:ident $method:ident $op:ident),*) => {$(
        impl<R: Into<Operand>> std::ops::$trait<R> for Operand {
            type Output = Operand;

            fn $method(self, rhs: R) -> Operand {
                self.arith(ArithOp::$op, rhs.into())
            }
        }
    )*};
}

operand_ops!(Add add Add, Sub sub Sub, Mul mul Mul, Div div Div, Rem rem Rem);

#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    Always,
    /// Digital input is high.
    Input(ChannelRef),
    /// Digital input went low to high since the previous cycle.
    Rising(ChannelRef),
    /// Digital input went high to low since the previous cycle.
    Falling(ChannelRef),
    Compare(Operand, Cmp, Operand),
    Not(Box<Guard>),
    All(Vec<Guard>),
    Any(Vec<Guard>),
    Xor(Box<Guard>, Box<Guard>),
}

impl Guard {
    pub fn input(channel: ChannelRef) -> Self {
        Guard::Input(channel)
    }

    pub fn rising(channel: ChannelRef) -> Self {
        Guard::Rising(channel)
    }

    pub fn falling(channel: ChannelRef) -> Self {
        Guard::Falling(channel)
    }

    pub fn compare(lhs: Operand, cmp: Cmp, rhs: Operand) -> Self {
        Guard::Compare(lhs, cmp, rhs)
    }

    /// At least `duration` of simulated time spent in the current state.
    pub fn in_state_for(duration: Duration) -> Self {
        Guard::Compare(
            Operand::TimeInStateMs,
            Cmp::Ge,
            Operand::Const(millis(duration)),
        )
    }

    pub fn all(guards: impl IntoIterator<Item = Guard>) -> Self {
        Guard::All(guards.into_iter().collect())
    }

    pub fn any(guards: impl IntoIterator<Item = Guard>) -> Self {
        Guard::Any(guards.into_iter().collect())
    }

    pub fn and(self, other: Guard) -> Self {
        match self {
            Guard::All(mut guards) => {
                guards.push(other);
                Guard::All(guards)
            }
            first => Guard::All(vec![first, other]),
        }
    }

    pub fn or(self, other: Guard) -> Self {
        match self {
            Guard::Any(mut guards) => {
                guards.push(other);
                Guard::Any(guards)
            }
            first => Guard::Any(vec![first, other]),
        }
    }

    pub fn xor(self, other: Guard) -> Self {
        Guard::Xor(Box::new(self), Box::new(other))
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Result<bool> {
        Ok(match self {
            Guard::Always => true,
            Guard::Input(ch) => ctx.inputs.bool(*ch)?,
            Guard::Rising(ch) => ctx.inputs.rising(*ch)?,
            Guard::Falling(ch) => ctx.inputs.falling(*ch)?,
            Guard::Compare(lhs, cmp, rhs) => cmp.apply(ctx.operand(lhs)?, ctx.operand(rhs)?),
            Guard::Not(inner) => !inner.eval(ctx)?,
            Guard::All(guards) => {
                for guard in guards {
                    if !guard.eval(ctx)? {
                        return Ok(false);
                    }
                }
                true
            }
            Guard::Any(guards) => {
                for guard in guards {
                    if guard.eval(ctx)? {
                        return Ok(true);
                    }
                }
                false
            }
            Guard::Xor(a, b) => a.eval(ctx)? != b.eval(ctx)?,
        })
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Guard)) {
        f(self);
        match self {
            Guard::Not(inner) => inner.visit(&mut *f),
            Guard::All(guards) | Guard::Any(guards) => {
                for guard in guards {
                    guard.visit(&mut *f);
                }
            }
            Guard::Xor(a, b) => {
                a.visit(&mut *f);
                b.visit(&mut *f);
            }
            _ => {}
        }
    }
}

impl std::ops::Not for Guard {
    type Output = Guard;

    fn not(self) -> Guard {
        Guard::Not(Box::new(self))
    }
}

/// Applied in declaration order when a transition is taken; each update sees
/// the effect of the ones before it.
#[derive(Debug, Clone, PartialEq)]
pub enum VarUpdate {
    Set(String, Operand),
    Add(String, Operand),
    /// The timer reads the given number of milliseconds right after the
    /// transition and keeps counting from there.
    SetTimer(String, Operand),
}

impl VarUpdate {
    pub fn set(name: impl Into<String>, value: impl Into<Operand>) -> Self {
        VarUpdate::Set(name.into(), value.into())
    }

    pub fn add(name: impl Into<String>, value: impl Into<Operand>) -> Self {
        VarUpdate::Add(name.into(), value.into())
    }

    pub fn reset_timer(name: impl Into<String>) -> Self {
        VarUpdate::SetTimer(name.into(), Operand::Const(0.0))
    }

    fn target(&self) -> &str {
        match self {
            VarUpdate::Set(name, _) | VarUpdate::Add(name, _) | VarUpdate::SetTimer(name, _) => name,
        }
    }

    fn value(&self) -> &Operand {
        match self {
            VarUpdate::Set(_, v) | VarUpdate::Add(_, v) | VarUpdate::SetTimer(_, v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    from: S,
    to: S,
    guard: Guard,
    outputs: Vec<OutputCommand>,
    updates: Vec<VarUpdate>,
}

impl<S> Transition<S> {
    /// Unconditional transition; narrow it with [`Transition::when`].
    pub fn new(from: S, to: S) -> Self {
        Self {
            from,
            to,
            guard: Guard::Always,
            outputs: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn set(mut self, channel: ChannelRef, value: impl Into<crate::io::Value>) -> Self {
        self.outputs.push(OutputCommand::new(channel, value));
        self
    }

    pub fn update(mut self, update: VarUpdate) -> Self {
        self.updates.push(update);
        self
    }
}

/// Explicit state of an FSM program, owned by its registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FsmState<S> {
    pub current: S,
    /// Simulated time at which `current` was entered.
    pub entered_at: Duration,
    pub vars: Vec<f64>,
    /// Simulated time, in milliseconds, at which each timer read zero.
    pub timer_origins: Vec<f64>,
}

struct EvalContext<'a> {
    program: &'a str,
    inputs: &'a InputSnapshot,
    var_names: &'a [String],
    vars: &'a [f64],
    timer_names: &'a [String],
    timer_origins: &'a [f64],
    time_in_state: Duration,
}

fn millis(time: Duration) -> f64 {
    time.as_nanos() as f64 / 1e6
}

fn lookup<'v>(names: &[String], values: &'v [f64], name: &str) -> Result<&'v f64> {
    names
        .iter()
        .position(|n| n == name)
        .and_then(|i| values.get(i))
        .ok_or_else(|| PlcError::InvalidProgram {
            reason: format!("undeclared '{name}'"),
        })
}

impl EvalContext<'_> {
    fn operand(&self, operand: &Operand) -> Result<f64> {
        match operand {
            Operand::Input(ch) => self.inputs.analog(*ch),
            Operand::Var(name) => lookup(self.var_names, self.vars, name).copied(),
            Operand::Timer(name) => {
                let origin = lookup(self.timer_names, self.timer_origins, name)?;
                Ok(millis(self.inputs.time()) - origin)
            }
            Operand::Const(v) => Ok(*v),
            Operand::TimeInStateMs => Ok(millis(self.time_in_state)),
            Operand::Arith(lhs, op, rhs) => {
                let (a, b) = (self.operand(lhs)?, self.operand(rhs)?);
                match op {
                    ArithOp::Add => Ok(a + b),
                    ArithOp::Sub => Ok(a - b),
                    ArithOp::Mul => Ok(a * b),
                    ArithOp::Div | ArithOp::Rem if b == 0.0 => Err(PlcError::Arithmetic {
                        program: self.program.to_string(),
                        expression: operand.to_string(),
                    }),
                    ArithOp::Div => Ok(a / b),
                    ArithOp::Rem => Ok(a % b),
                }
            }
            Operand::Trunc(inner) => Ok(self.operand(inner)?.trunc()),
        }
    }
}

pub struct FsmProgram<S> {
    name: String,
    states: Vec<S>,
    holding: Vec<S>,
    initial: S,
    transitions: Vec<Transition<S>>,
    initial_outputs: Vec<OutputCommand>,
    var_names: Vec<String>,
    var_initial: Vec<f64>,
    timer_names: Vec<String>,
}

impl<S> FsmProgram<S>
where
    S: Copy + Eq + Debug + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>, initial: S) -> FsmBuilder<S> {
        FsmBuilder {
            name: name.into(),
            states: Vec::new(),
            holding: Vec::new(),
            initial,
            transitions: Vec::new(),
            initial_outputs: Vec::new(),
            variables: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    pub fn initial_state(&self) -> S {
        self.initial
    }

    pub fn var(&self, state: &FsmState<S>, name: &str) -> Option<f64> {
        self.var_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| state.vars.get(i).copied())
    }

    /// Milliseconds the named timer reads at simulated time `now`.
    pub fn timer(&self, state: &FsmState<S>, name: &str, now: Duration) -> Option<f64> {
        lookup(&self.timer_names, &state.timer_origins, name)
            .ok()
            .map(|origin| millis(now) - origin)
    }

    fn context<'a>(
        &'a self,
        inputs: &'a InputSnapshot,
        vars: &'a [f64],
        timer_origins: &'a [f64],
        time_in_state: Duration,
    ) -> EvalContext<'a> {
        EvalContext {
            program: &self.name,
            inputs,
            var_names: &self.var_names,
            vars,
            timer_names: &self.timer_names,
            timer_origins,
            time_in_state,
        }
    }
}

impl<S> Program for FsmProgram<S>
where
    S: Copy + Eq + Debug + Send + Sync + 'static,
{
    type State = FsmState<S>;

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, inputs: &InputSnapshot) -> FsmState<S> {
        log::debug!("Init fsm program '{}' in state {:?}", self.name, self.initial);
        FsmState {
            current: self.initial,
            entered_at: inputs.time(),
            vars: self.var_initial.clone(),
            timer_origins: vec![millis(inputs.time()); self.timer_names.len()],
        }
    }

    fn step(&self, state: &FsmState<S>, inputs: &InputSnapshot) -> Result<Step<FsmState<S>>> {
        let time_in_state = inputs.time().saturating_sub(state.entered_at);
        let ctx = self.context(inputs, &state.vars, &state.timer_origins, time_in_state);

        for transition in self.transitions.iter().filter(|t| t.from == state.current) {
            if !transition.guard.eval(&ctx)? {
                continue;
            }
            let mut vars = state.vars.clone();
            let mut timer_origins = state.timer_origins.clone();
            for update in &transition.updates {
                let value = self
                    .context(inputs, &vars, &timer_origins, time_in_state)
                    .operand(update.value())?;
                let unknown = || PlcError::InvalidProgram {
                    reason: format!("undeclared '{}'", update.target()),
                };
                match update {
                    VarUpdate::Set(name, _) | VarUpdate::Add(name, _) => {
                        let slot = self
                            .var_names
                            .iter()
                            .position(|n| n == name)
                            .ok_or_else(unknown)?;
                        if matches!(update, VarUpdate::Add(..)) {
                            vars[slot] += value;
                        } else {
                            vars[slot] = value;
                        }
                    }
                    VarUpdate::SetTimer(name, _) => {
                        let slot = self
                            .timer_names
                            .iter()
                            .position(|n| n == name)
                            .ok_or_else(unknown)?;
                        timer_origins[slot] = millis(inputs.time()) - value;
                    }
                }
            }
            log::debug!(
                "{}: {:?} -> {:?} @tick {}",
                self.name,
                transition.from,
                transition.to,
                inputs.tick()
            );
            return Ok(Step::new(
                FsmState {
                    current: transition.to,
                    entered_at: inputs.time(),
                    vars,
                    timer_origins,
                },
                transition.outputs.clone(),
            ));
        }

        if self.holding.contains(&state.current) {
            return Ok(Step::hold(state.clone()));
        }
        Err(PlcError::UnhandledTransition {
            program: self.name.clone(),
            state: format!("{:?}", state.current),
            tick: inputs.tick(),
        })
    }

    fn initial_outputs(&self) -> Vec<OutputCommand> {
        self.initial_outputs.clone()
    }

    fn channels(&self) -> Vec<ChannelUse> {
        let mut uses: Vec<ChannelUse> = Vec::new();
        let mut push = |channel: ChannelRef, kind: ValueKind| {
            let entry = ChannelUse { channel, kind };
            if !uses.contains(&entry) {
                uses.push(entry);
            }
        };
        for transition in &self.transitions {
            transition.guard.visit(&mut |g| match g {
                Guard::Input(ch) | Guard::Rising(ch) | Guard::Falling(ch) => {
                    push(*ch, ValueKind::Bool)
                }
                Guard::Compare(lhs, _, rhs) => {
                    for operand in [lhs, rhs] {
                        operand.visit(&mut |o| {
                            if let Operand::Input(ch) = o {
                                push(*ch, ValueKind::Analog);
                            }
                        });
                    }
                }
                _ => {}
            });
            for update in &transition.updates {
                update.value().visit(&mut |o| {
                    if let Operand::Input(ch) = o {
                        push(*ch, ValueKind::Analog);
                    }
                });
            }
        }
        for command in self.initial_outputs.iter().chain(
            self.transitions
                .iter()
                .flat_map(|t| t.outputs.iter()),
        ) {
            push(command.channel, command.value.kind());
        }
        uses
    }

    fn describe(&self, state: &FsmState<S>) -> String {
        format!("{:?}", state.current)
    }
}

pub struct FsmBuilder<S> {
    name: String,
    states: Vec<S>,
    holding: Vec<S>,
    initial: S,
    transitions: Vec<Transition<S>>,
    initial_outputs: Vec<OutputCommand>,
    variables: Vec<(String, f64)>,
    timers: Vec<String>,
}

impl<S> FsmBuilder<S>
where
    S: Copy + Eq + Debug + Send + Sync + 'static,
{
    pub fn state(mut self, state: S) -> Self {
        self.states.push(state);
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.states.extend(states);
        self
    }

    /// When no transition fires in `state`, stay there instead of failing.
    pub fn holding(mut self, state: S) -> Self {
        self.holding.push(state);
        self
    }

    pub fn holding_all(mut self) -> Self {
        self.holding = self.states.clone();
        self
    }

    pub fn transition(mut self, transition: Transition<S>) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Value written to `channel` when the program starts.
    pub fn output(mut self, channel: ChannelRef, value: impl Into<crate::io::Value>) -> Self {
        self.initial_outputs.push(OutputCommand::new(channel, value));
        self
    }

    pub fn variable(mut self, name: impl Into<String>, initial: f64) -> Self {
        self.variables.push((name.into(), initial));
        self
    }

    /// Declares a timer that counts simulated milliseconds from program start
    /// until a transition sets it.
    pub fn timer(mut self, name: impl Into<String>) -> Self {
        self.timers.push(name.into());
        self
    }

    pub fn build(self) -> Result<FsmProgram<S>> {
        let invalid = |reason: String| Err(PlcError::InvalidProgram { reason });

        if self.states.is_empty() {
            return invalid(format!("'{}' declares no states", self.name));
        }
        for (i, state) in self.states.iter().enumerate() {
            if self.states[..i].contains(state) {
                return invalid(format!("duplicate state {state:?}"));
            }
        }
        if !self.states.contains(&self.initial) {
            return invalid(format!(
                "initial state {:?} is not part of the state set",
                self.initial
            ));
        }
        if let Some(state) = self.holding.iter().find(|s| !self.states.contains(*s)) {
            return invalid(format!("holding state {state:?} is not part of the state set"));
        }
        for t in &self.transitions {
            if !self.states.contains(&t.from) || !self.states.contains(&t.to) {
                return invalid(format!(
                    "transition {:?} -> {:?} uses a state outside the state set",
                    t.from, t.to
                ));
            }
        }

        for command in &self.initial_outputs {
            if !command.channel.is_output() {
                return invalid(format!("initial value given for input {}", command.channel));
            }
        }
        for t in &self.transitions {
            for command in &t.outputs {
                if !command.channel.is_output() {
                    return invalid(format!("transition writes input {}", command.channel));
                }
                match self
                    .initial_outputs
                    .iter()
                    .find(|init| init.channel == command.channel)
                {
                    None => {
                        return invalid(format!(
                            "missing initial value for output {}",
                            command.channel
                        ))
                    }
                    Some(init) if init.value.kind() != command.value.kind() => {
                        return invalid(format!(
                            "output {} is written with mixed value kinds",
                            command.channel
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        let var_names: Vec<String> = self.variables.iter().map(|(n, _)| n.clone()).collect();
        for (i, name) in var_names.iter().chain(&self.timers).enumerate() {
            if var_names.iter().chain(&self.timers).take(i).any(|n| n == name) {
                return invalid(format!("duplicate variable or timer '{name}'"));
            }
        }
        let timers = &self.timers;
        let check_operand = |operand: &Operand, problem: &mut Option<String>| {
            operand.visit(&mut |o| match o {
                Operand::Var(name) if !var_names.contains(name) => {
                    problem.get_or_insert_with(|| format!("unknown variable '{name}'"));
                }
                Operand::Timer(name) if !timers.contains(name) => {
                    problem.get_or_insert_with(|| format!("unknown timer '{name}'"));
                }
                Operand::Arith(_, ArithOp::Div | ArithOp::Rem, rhs)
                    if matches!(**rhs, Operand::Const(v) if v == 0.0) =>
                {
                    problem.get_or_insert_with(|| format!("division by zero in {o}"));
                }
                _ => {}
            });
        };
        for t in &self.transitions {
            let mut problem: Option<String> = None;
            t.guard.visit(&mut |g| {
                if let Guard::Compare(lhs, _, rhs) = g {
                    check_operand(lhs, &mut problem);
                    check_operand(rhs, &mut problem);
                }
                if let Guard::Input(ch) | Guard::Rising(ch) | Guard::Falling(ch) = g {
                    if !ch.is_input() {
                        problem.get_or_insert_with(|| format!("guard reads output {ch}"));
                    }
                }
            });
            for update in &t.updates {
                let known = match update {
                    VarUpdate::Set(name, _) | VarUpdate::Add(name, _) => var_names.contains(name),
                    VarUpdate::SetTimer(name, _) => timers.contains(name),
                };
                if !known {
                    problem.get_or_insert_with(|| format!("assigns unknown '{}'", update.target()));
                }
                check_operand(update.value(), &mut problem);
            }
            if let Some(problem) = problem {
                return invalid(format!(
                    "transition {:?} -> {:?} {problem}",
                    t.from, t.to
                ));
            }
        }

        Ok(FsmProgram {
            name: self.name,
            states: self.states,
            holding: self.holding,
            initial: self.initial,
            transitions: self.transitions,
            initial_outputs: self.initial_outputs,
            var_names,
            var_initial: self.variables.into_iter().map(|(_, v)| v).collect(),
            timer_names: self.timers,
        })
    }
}
