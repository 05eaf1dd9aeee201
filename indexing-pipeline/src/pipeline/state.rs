use state_machines::state_machine;

state_machine! {
    name: EtlMachine,
    state: EtlState,
    initial: Pending,
    states: [Pending, Bootstrapped, Idle, Extracting, Transforming, Loading, CursorAdvanced, Done],
    events {
        bootstrap { transition: { from: Pending, to: Bootstrapped } }
        validate_cursor { transition: { from: Bootstrapped, to: Idle } }
        extract { transition: { from: Idle, to: Extracting } }
        transform { transition: { from: Extracting, to: Transforming } }
        load { transition: { from: Transforming, to: Loading } }
        advance_cursor { transition: { from: Loading, to: CursorAdvanced } }
        next_batch { transition: { from: CursorAdvanced, to: Idle } }
        finish { transition: { from: Idle, to: Done } }
    }
}

pub fn pending() -> EtlMachine<(), Pending> {
    EtlMachine::new(())
}
