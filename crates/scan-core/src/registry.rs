use crate::error::{PlcError, Result};
use crate::io::{InputSnapshot, OutputCommand};
use crate::program::{ChannelUse, Program};

/// Type-erased registry entry. Each entry owns its program and the program's
/// explicit state value; the program itself is dispatched statically.
pub trait ProgramSlot: Send {
    fn name(&self) -> &str;
    fn initialize(&mut self, inputs: &InputSnapshot);
    /// Steps the program. On success the entry's state advances and the
    /// output commands are returned; on failure the state is left untouched.
    /// Commands that do not fit the snapshot's layout count as a failure.
    fn step(&mut self, inputs: &InputSnapshot) -> Result<Vec<OutputCommand>>;
    fn initial_outputs(&self) -> Vec<OutputCommand>;
    fn channels(&self) -> Vec<ChannelUse>;
    fn is_initialized(&self) -> bool;
    fn state_label(&self) -> Option<String>;
}

struct Slot<P: Program> {
    program: P,
    state: Option<P::State>,
}

impl<P: Program> ProgramSlot for Slot<P> {
    fn name(&self) -> &str {
        self.program.name()
    }

    fn initialize(&mut self, inputs: &InputSnapshot) {
        self.state = Some(self.program.initialize(inputs));
    }

    fn step(&mut self, inputs: &InputSnapshot) -> Result<Vec<OutputCommand>> {
        let state = match self.state.take() {
            Some(state) => state,
            None => self.program.initialize(inputs),
        };
        let result = self.program.step(&state, inputs).and_then(|step| {
            inputs.layout().check_commands(&step.outputs)?;
            Ok(step)
        });
        match result {
            Ok(step) => {
                self.state = Some(step.next);
                Ok(step.outputs)
            }
            Err(e) => {
                self.state = Some(state);
                Err(e)
            }
        }
    }

    fn initial_outputs(&self) -> Vec<OutputCommand> {
        self.program.initial_outputs()
    }

    fn channels(&self) -> Vec<ChannelUse> {
        self.program.channels()
    }

    fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn state_label(&self) -> Option<String> {
        self.state.as_ref().map(|s| self.program.describe(s))
    }
}

/// Loaded programs in registration order, which is also execution order.
#[derive(Default)]
pub struct ProgramRegistry {
    entries: Vec<Box<dyn ProgramSlot>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Program>(&mut self, program: P) -> Result<()> {
        self.register_slot(Box::new(Slot {
            program,
            state: None,
        }))
    }

    pub fn register_slot(&mut self, slot: Box<dyn ProgramSlot>) -> Result<()> {
        if self.contains(slot.name()) {
            return Err(PlcError::DuplicateName {
                name: slot.name().to_string(),
            });
        }
        log::info!("Registered program '{}'", slot.name());
        self.entries.push(slot);
        Ok(())
    }

    /// Removes the named program. Unknown names are ignored.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name() != name);
        let removed = self.entries.len() != before;
        if removed {
            log::info!("Unregistered program '{name}'");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn ProgramSlot> {
        self.entries
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.as_ref())
    }

    pub fn list_in_order(&self) -> impl Iterator<Item = &dyn ProgramSlot> {
        self.entries.iter().map(|e| e.as_ref())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ProgramSlot>> {
        self.entries.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn state_label(&self, name: &str) -> Option<String> {
        self.get(name).and_then(|e| e.state_label())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Step;

    struct Counter(&'static str);

    impl Program for Counter {
        type State = u32;

        fn name(&self) -> &str {
            self.0
        }

        fn initialize(&self, _inputs: &InputSnapshot) -> u32 {
            0
        }

        fn step(&self, state: &u32, _inputs: &InputSnapshot) -> Result<Step<u32>> {
            Ok(Step::hold(state + 1))
        }
    }

    #[test]
    fn duplicate_names_leave_registry_unchanged() {
        let mut registry = ProgramRegistry::new();
        registry.register(Counter("a")).unwrap();
        registry.register(Counter("b")).unwrap();
        let err = registry.register(Counter("a")).unwrap_err();
        assert_eq!(err, PlcError::DuplicateName { name: "a".into() });
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn unregister_is_no_op_safe() {
        let mut registry = ProgramRegistry::new();
        registry.register(Counter("a")).unwrap();
        assert!(!registry.unregister("missing"));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn order_is_registration_order() {
        let mut registry = ProgramRegistry::new();
        for name in ["c", "a", "b"] {
            registry.register(Counter(name)).unwrap();
        }
        let order: Vec<&str> = registry.list_in_order().map(|p| p.name()).collect();
        assert_eq!(order, ["c", "a", "b"]);
    }
}
