#[cfg(test)]
mod proptest_fsm {
    use crate::error::PlcError;
    use crate::fsm::*;
    use crate::io::*;
    use crate::program::Program;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tank {
        Idle,
        Filling,
        Draining,
    }

    const STATES: [Tank; 3] = [Tank::Idle, Tank::Filling, Tank::Draining];
    const START: ChannelRef = ChannelRef::input(0, 0);
    const STOP: ChannelRef = ChannelRef::input(0, 1);
    const LEVEL: ChannelRef = ChannelRef::input(1, 0);
    const PUMP: ChannelRef = ChannelRef::output(0, 0);
    const VALVE: ChannelRef = ChannelRef::output(0, 1);

    fn layout() -> Arc<IoLayout> {
        let cards: Vec<Box<dyn IoCard>> = vec![
            Box::new(BasicIoCard::new("bIO0")),
            Box::new(AnalogIoCard::new("aIO1", 1, 1)),
        ];
        Arc::new(IoLayout::new(&cards).unwrap())
    }

    fn tank() -> FsmProgram<Tank> {
        use Tank::*;
        FsmProgram::builder("tank", Idle)
            .states(STATES)
            .holding(Idle)
            .output(PUMP, false)
            .output(VALVE, false)
            .variable("high", 80.0)
            .variable("batches", 0.0)
            .transition(
                Transition::new(Idle, Filling)
                    .when(Guard::rising(START))
                    .set(PUMP, true)
                    .update(VarUpdate::add("batches", 1.0)),
            )
            .transition(
                Transition::new(Filling, Draining)
                    .when(Guard::compare(
                        Operand::Input(LEVEL),
                        Cmp::Ge,
                        Operand::Var("high".into()),
                    ))
                    .set(PUMP, false)
                    .set(VALVE, true),
            )
            .transition(
                Transition::new(Filling, Idle)
                    .when(Guard::input(STOP))
                    .set(PUMP, false),
            )
            .transition(
                Transition::new(Draining, Idle)
                    .when(
                        Guard::compare(Operand::Input(LEVEL), Cmp::Le, Operand::Const(5.0))
                            .or(Guard::in_state_for(Duration::from_secs(10))),
                    )
                    .set(VALVE, false),
            )
            .build()
            .unwrap()
    }

    fn snapshot(tick: u64, before: (bool, bool), now: (bool, bool), level: f64) -> InputSnapshot {
        let time = Duration::from_millis(50 * tick);
        let previous = InputSnapshot::with_values(
            layout(),
            tick.saturating_sub(1),
            time,
            &[
                InputUpdate::new(START, before.0),
                InputUpdate::new(STOP, before.1),
            ],
        )
        .unwrap();
        previous
            .advanced(
                tick,
                time,
                &[
                    InputUpdate::new(START, now.0),
                    InputUpdate::new(STOP, now.1),
                    InputUpdate::new(LEVEL, level),
                ],
            )
            .unwrap()
    }

    fn state(index: usize, entered_ms: u64, batches: f64) -> FsmState<Tank> {
        FsmState {
            current: STATES[index],
            entered_at: Duration::from_millis(entered_ms),
            vars: vec![80.0, batches],
            timer_origins: Vec::new(),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // Same state and inputs always give the same step.
        #[test]
        fn step_is_a_pure_function(
            index in 0usize..3,
            entered_ms in 0u64..20_000,
            batches in 0.0f64..10.0,
            tick in 0u64..1000,
            before in any::<(bool, bool)>(),
            now in any::<(bool, bool)>(),
            level in 0.0f64..100.0,
        ) {
            let program = tank();
            let state = state(index, entered_ms, batches);
            let inputs = snapshot(tick, before, now, level);

            let first = program.step(&state, &inputs);
            let second = program.step(&state, &inputs);
            prop_assert_eq!(&first, &second);

            // A fresh program instance agrees as well: no hidden state.
            let third = tank().step(&state, &inputs);
            prop_assert_eq!(first, third);
        }

        // Steps stay inside the declared states and channels, and only
        // non-holding states may fail.
        #[test]
        fn step_respects_the_definition(
            index in 0usize..3,
            entered_ms in 0u64..20_000,
            tick in 0u64..1000,
            before in any::<(bool, bool)>(),
            now in any::<(bool, bool)>(),
            level in 0.0f64..100.0,
        ) {
            let program = tank();
            let state = state(index, entered_ms, 0.0);
            let inputs = snapshot(tick, before, now, level);
            let declared = program.channels();

            match program.step(&state, &inputs) {
                Ok(step) => {
                    prop_assert!(STATES.contains(&step.next.current));
                    for command in &step.outputs {
                        prop_assert!(declared.iter().any(|u| u.channel == command.channel));
                    }
                    if step.next.current == state.current && step.outputs.is_empty() {
                        prop_assert_eq!(step.next, state);
                    } else {
                        prop_assert_eq!(step.next.entered_at, inputs.time());
                    }
                }
                Err(PlcError::UnhandledTransition { state: label, tick: at, .. }) => {
                    prop_assert_ne!(state.current, Tank::Idle);
                    prop_assert_eq!(label, format!("{:?}", state.current));
                    prop_assert_eq!(at, tick);
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }
}
