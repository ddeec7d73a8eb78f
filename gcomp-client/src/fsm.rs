//! Table-driven state machine and the client's states and events.

use gcomp_common::KeyContent;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tracing::debug;

/// Receives state entry and exit callbacks.
pub trait StateHandler<S> {
    type Payload;

    fn on_enter(&mut self, state: S, payload: Self::Payload);

    fn on_exit(&mut self, _state: S) {}
}

/// A state machine over a fixed transition table.
///
/// Events with no transition from the current state are ignored.
#[derive(Debug, Clone)]
pub struct StateMachine<S, E> {
    initial: S,
    current: S,
    transitions: HashMap<(S, E), S>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            current: initial,
            transitions: HashMap::new(),
        }
    }

    pub fn add_transition(&mut self, from: S, event: E, to: S) -> &mut Self {
        self.transitions.insert((from, event), to);
        self
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// State `event` would lead to from the current state.
    pub fn target(&self, event: E) -> Option<S> {
        self.transitions.get(&(self.current, event)).copied()
    }

    /// Reset to the initial state and run its entry action.
    pub fn start<H: StateHandler<S>>(&mut self, handler: &mut H, payload: H::Payload) {
        self.current = self.initial;
        debug!(state = ?self.current, "state machine started");
        handler.on_enter(self.current, payload);
    }

    /// Apply `event`. Returns `false` when no transition exists.
    pub fn fire<H: StateHandler<S>>(&mut self, event: E, payload: H::Payload, handler: &mut H) -> bool {
        let Some(next) = self.target(event) else {
            debug!(state = ?self.current, ?event, "event ignored");
            return false;
        };
        debug!(from = ?self.current, to = ?next, ?event, "transition");
        handler.on_exit(self.current);
        self.current = next;
        handler.on_enter(next, payload);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Starting,
    WaitingKey,
    ReadingKey,
    ResumingJob,
    GettingJob,
    ExecutingJob,
    Killing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    TxGetKey,
    RxKey,
    TxKeyAccepted,
    WasPaused,
    WasNotPaused,
    TxJobReceived,
    RxGetJobError,
    TxJobFinished,
    RxKillClient,
}

/// Data carried into a state's entry action.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    Key(KeyContent),
    /// Wait before the next job request.
    Delay(Duration),
    /// Script to execute and the delay to use if it fails.
    Job { script: Vec<u8>, next_delay: Duration },
}

/// The client's transition table.
pub fn client_state_machine() -> StateMachine<ClientState, ClientEvent> {
    use ClientEvent::*;
    use ClientState::*;

    let mut fsm = StateMachine::new(Starting);
    fsm.add_transition(Starting, TxGetKey, WaitingKey)
        .add_transition(WaitingKey, RxKey, ReadingKey)
        .add_transition(ReadingKey, TxKeyAccepted, ResumingJob)
        .add_transition(ResumingJob, WasNotPaused, GettingJob)
        .add_transition(ResumingJob, WasPaused, ExecutingJob)
        .add_transition(GettingJob, TxJobReceived, ExecutingJob)
        .add_transition(GettingJob, RxGetJobError, GettingJob)
        .add_transition(ExecutingJob, TxJobFinished, GettingJob);
    for state in [
        Starting,
        WaitingKey,
        ReadingKey,
        ResumingJob,
        GettingJob,
        ExecutingJob,
    ] {
        fsm.add_transition(state, RxKillClient, Killing);
    }
    fsm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl StateHandler<ClientState> for Recorder {
        type Payload = Payload;

        fn on_enter(&mut self, state: ClientState, payload: Payload) {
            self.calls.push(format!("enter {state:?} {payload:?}"));
        }

        fn on_exit(&mut self, state: ClientState) {
            self.calls.push(format!("exit {state:?}"));
        }
    }

    #[test]
    fn test_start_enters_initial_state() {
        let mut fsm = client_state_machine();
        let mut rec = Recorder::default();
        fsm.start(&mut rec, Payload::Empty);
        assert_eq!(fsm.current(), ClientState::Starting);
        assert_eq!(rec.calls, vec!["enter Starting Empty"]);
    }

    #[test]
    fn test_fire_calls_exit_then_enter_with_payload() {
        let mut fsm = client_state_machine();
        let mut rec = Recorder::default();
        fsm.start(&mut rec, Payload::Empty);
        assert!(fsm.fire(ClientEvent::TxGetKey, Payload::Empty, &mut rec));
        assert!(fsm.fire(
            ClientEvent::RxKey,
            Payload::Key(KeyContent::default()),
            &mut rec
        ));
        assert_eq!(fsm.current(), ClientState::ReadingKey);
        assert_eq!(rec.calls[1], "exit Starting");
        assert_eq!(rec.calls[2], "enter WaitingKey Empty");
        assert!(rec.calls[4].starts_with("enter ReadingKey Key("));
    }

    #[test]
    fn test_unregistered_event_is_ignored() {
        let mut fsm = client_state_machine();
        let mut rec = Recorder::default();
        fsm.start(&mut rec, Payload::Empty);
        rec.calls.clear();

        for event in [
            ClientEvent::RxKey,
            ClientEvent::WasPaused,
            ClientEvent::TxJobFinished,
            ClientEvent::RxGetJobError,
        ] {
            assert!(!fsm.fire(event, Payload::Empty, &mut rec));
        }
        assert_eq!(fsm.current(), ClientState::Starting);
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn test_kill_reachable_from_every_live_state() {
        let live = [
            ClientState::Starting,
            ClientState::WaitingKey,
            ClientState::ReadingKey,
            ClientState::ResumingJob,
            ClientState::GettingJob,
            ClientState::ExecutingJob,
        ];
        let fsm = client_state_machine();
        for state in live {
            assert_eq!(
                fsm.transitions.get(&(state, ClientEvent::RxKillClient)),
                Some(&ClientState::Killing)
            );
        }
        assert!(
            !fsm.transitions
                .keys()
                .any(|(from, _)| *from == ClientState::Killing)
        );
    }

    #[test]
    fn test_job_loop() {
        let mut fsm = client_state_machine();
        let mut rec = Recorder::default();
        fsm.start(&mut rec, Payload::Empty);
        for event in [
            ClientEvent::TxGetKey,
            ClientEvent::RxKey,
            ClientEvent::TxKeyAccepted,
            ClientEvent::WasNotPaused,
            ClientEvent::RxGetJobError,
            ClientEvent::TxJobReceived,
            ClientEvent::TxJobFinished,
        ] {
            assert!(fsm.fire(event, Payload::Empty, &mut rec), "{event:?}");
        }
        assert_eq!(fsm.current(), ClientState::GettingJob);
    }

    #[test]
    fn test_start_resets_to_initial() {
        let mut fsm = client_state_machine();
        let mut rec = Recorder::default();
        fsm.start(&mut rec, Payload::Empty);
        fsm.fire(ClientEvent::TxGetKey, Payload::Empty, &mut rec);
        fsm.start(&mut rec, Payload::Empty);
        assert_eq!(fsm.current(), ClientState::Starting);
    }
}
