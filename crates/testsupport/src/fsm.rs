//! An observable state machine for tests: records every applied
//! command and round-trips through snapshots with bincode.

use common::{Entry, EntryPayload, LogIndex};
use raft::StateMachine;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FsmState {
    last_applied: LogIndex,
    commands: Vec<Vec<u8>>,
}

/// The state machine half, handed to `Raft::start`.
pub struct TestFsm {
    state: Arc<Mutex<FsmState>>,
}

/// The observation half, kept by the test.
#[derive(Clone)]
pub struct FsmProbe {
    state: Arc<Mutex<FsmState>>,
}

impl TestFsm {
    pub fn new() -> (Box<TestFsm>, FsmProbe) {
        let state = Arc::new(Mutex::new(FsmState::default()));
        (
            Box::new(TestFsm {
                state: state.clone(),
            }),
            FsmProbe { state },
        )
    }
}

impl StateMachine for TestFsm {
    fn apply(&mut self, entry: &Entry) {
        let mut state = self.state.lock().unwrap();
        state.last_applied = entry.index;
        if let EntryPayload::Command(data) = &entry.payload {
            state.commands.push(data.clone());
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        bincode::serde::encode_to_vec(&*state, bincode::config::legacy())
            .expect("fsm state serialises")
    }

    fn restore(&mut self, data: &[u8]) {
        let (restored, _): (FsmState, _) =
            bincode::serde::decode_from_slice(data, bincode::config::legacy())
                .expect("fsm snapshot decodes");
        *self.state.lock().unwrap() = restored;
    }
}

impl FsmProbe {
    /// All commands applied so far, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().commands.clone()
    }

    /// How many times `payload` was applied.
    pub fn count_of(&self, payload: &[u8]) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.as_slice() == payload)
            .count()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.lock().unwrap().last_applied
    }
}
