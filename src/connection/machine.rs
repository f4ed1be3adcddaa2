//! Pure link lifecycle machine.
//!
//! `transition(state, input, now, budget)` holds every lifecycle rule; the
//! async driver in the parent module only turns I/O outcomes into
//! [`LinkInput`]s and performs the side effects of the resulting state.
//!
//! ```text
//!                Reconnected (gen + 1)
//!   Connecting ─────────────────────────► Connected ◄──────────┐
//!       │                                  │     │             │ StillLinked
//!       │        LinkLost/Timeout/Corrupted│     │ disconnect- │
//!       │                                  ▼     └─triggering─►AwaitingDisconnection
//!       │                     Disconnected(deadline)  success  │
//!       │                       │   ▲   └────────◄─────────────┘ LinkLost/Timeout/Corrupted
//!       │         BudgetExpired │   └ Reconnected (gen + 1, before deadline)
//!       └─────────────────────► ▼
//!                          Terminated  ◄── CloseRequested (from any state)
//! ```

use core::time::Duration;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link has been established yet.
    Connecting,
    Connected {
        generation: u32,
    },
    /// A command that restarts the device link succeeded; probing.
    AwaitingDisconnection {
        generation: u32,
    },
    Disconnected {
        generation: u32,
        deadline: Instant,
    },
    /// Absorbing.
    Terminated,
}

impl LinkState {
    /// Generation of the last established link (0 before the first).
    pub fn generation(&self) -> Option<u32> {
        match *self {
            Self::Connecting => Some(0),
            Self::Connected { generation }
            | Self::AwaitingDisconnection { generation }
            | Self::Disconnected { generation, .. } => Some(generation),
            Self::Terminated => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether a live sender exists in this state.
    pub fn has_link(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::AwaitingDisconnection { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    /// The transport reported link loss, or frame retries were exhausted.
    LinkLost,
    /// A fresh sender finished its handshake.
    Reconnected,
    /// The reconnection deadline passed.
    BudgetExpired,
    CloseRequested,
    /// An exchange hit its timeout mid-command.
    ExchangeTimedOut,
    /// A response frame was out of sequence or malformed; the rest of that
    /// response may still be in flight on this link.
    ExchangeCorrupted,
    ExchangeSucceeded { triggers_disconnection: bool },
    /// Nothing reached the wire: the caller had gone away or the sender
    /// was not ready.
    ExchangeRejected,
    /// The device answered the post-restart check on the same link.
    StillLinked,
}

pub fn transition(state: LinkState, input: LinkInput, now: Instant, budget: Duration) -> LinkState {
    use LinkInput as I;
    use LinkState as S;

    let lost = |generation| S::Disconnected {
        generation,
        deadline: now + budget,
    };

    match (state, input) {
        (S::Terminated, _) | (_, I::CloseRequested) => S::Terminated,

        (S::Connecting, I::Reconnected) => S::Connected { generation: 1 },
        (S::Connecting, I::BudgetExpired) => S::Terminated,

        (
            S::Connected { generation },
            I::LinkLost | I::ExchangeTimedOut | I::ExchangeCorrupted,
        ) => lost(generation),
        (
            S::Connected { generation },
            I::ExchangeSucceeded {
                triggers_disconnection: true,
            },
        ) => S::AwaitingDisconnection { generation },

        (
            S::AwaitingDisconnection { generation },
            I::LinkLost | I::ExchangeTimedOut | I::ExchangeCorrupted,
        ) => lost(generation),
        (S::AwaitingDisconnection { generation }, I::StillLinked) => {
            S::Connected { generation }
        }

        (
            S::Disconnected {
                generation,
                deadline,
            },
            I::Reconnected,
        ) => {
            if now > deadline {
                S::Terminated
            } else {
                S::Connected {
                    generation: generation.wrapping_add(1),
                }
            }
        }
        (S::Disconnected { .. }, I::BudgetExpired) => S::Terminated,

        (state, _) => state,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_input() -> impl Strategy<Value = LinkInput> {
        prop_oneof![
            Just(LinkInput::LinkLost),
            Just(LinkInput::Reconnected),
            Just(LinkInput::BudgetExpired),
            Just(LinkInput::CloseRequested),
            Just(LinkInput::ExchangeTimedOut),
            Just(LinkInput::ExchangeCorrupted),
            any::<bool>().prop_map(|t| LinkInput::ExchangeSucceeded {
                triggers_disconnection: t
            }),
            Just(LinkInput::ExchangeRejected),
            Just(LinkInput::StillLinked),
        ]
    }

    proptest! {
        #[test]
        fn terminated_is_absorbing(inputs in prop::collection::vec(arb_input(), 0..50)) {
            let now = Instant::now();
            let mut s = LinkState::Terminated;
            for input in inputs {
                s = transition(s, input, now, Duration::from_secs(1));
                prop_assert_eq!(s, LinkState::Terminated);
            }
        }

        #[test]
        fn generation_never_decreases(
            inputs in prop::collection::vec(arb_input(), 0..100),
            steps_ms in prop::collection::vec(0u64..100, 100),
        ) {
            let mut now = Instant::now();
            let mut s = LinkState::Connecting;
            let mut last = 0;
            for (input, step) in inputs.into_iter().zip(steps_ms) {
                now += Duration::from_millis(step);
                let next = transition(s, input, now, Duration::from_millis(500));
                if let Some(generation) = next.generation() {
                    prop_assert!(generation >= last);
                    if generation > last {
                        prop_assert_eq!(input, LinkInput::Reconnected);
                    }
                    last = generation;
                }
                s = next;
            }
        }

        #[test]
        fn close_always_terminates(inputs in prop::collection::vec(arb_input(), 0..30)) {
            let now = Instant::now();
            let mut s = LinkState::Connecting;
            for input in inputs {
                s = transition(s, input, now, Duration::from_secs(1));
            }
            prop_assert_eq!(
                transition(s, LinkInput::CloseRequested, now, Duration::from_secs(1)),
                LinkState::Terminated
            );
        }
    }
}
