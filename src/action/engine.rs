//! Device action engine.
//!
//! A [`DeviceAction`] is a table-driven state machine: [`DeviceAction::enter`]
//! maps each state to a [`Node`], and the engine walks the nodes.
//!
//! ```text
//!            ┌─────────── Decide(next) ───────────┐
//!            ▼                                    │
//!   enter(state) ── Invoke(call) ──► await call ──┴─► on_event(event) ──► next
//!            │                          ▲
//!            │                 cancel ──┘ (raced; late results dropped)
//!            ├── Success(o)  ──► Completed(o)
//!            ├── Failure(e)  ──► Error(e)
//!            └── Stopped     ──► Stopped
//! ```
//!
//! Entering an `Invoke` node publishes `Pending(intermediate(state))`;
//! `Decide` nodes publish nothing.  [`execute`] publishes the first
//! `Pending` itself, so an `Invoke` initial state (or a sub-action started
//! from it) does not publish it again.  Capability failures never escape an
//! invocation: the `map` function of each [`Invocation`] folds them into an
//! event, and the action routes the event to a failure state.

use core::fmt;
use core::future::Future;
use std::rc::Rc;

use futures_lite::{StreamExt, future};
use log::{debug, info};

use super::broadcast::{StateLog, Subscription};
use super::cancel::CancelToken;
use super::state::{DeviceActionState, Intermediate};
use crate::apdu::{Apdu, ApduResponse};
use crate::command::{Command, CommandResult, CommandSender, LocalFuture, SendOptions, send_command};
use crate::error::ConnectionError;

pub trait DeviceAction: Sized + 'static {
    type Output: Clone + 'static;
    type Error: Clone + 'static;
    type Intermediate: Intermediate;
    type State: Copy + fmt::Debug + 'static;
    type Context: 'static;
    type Event: 'static;

    fn name(&self) -> &'static str;

    fn initial(&self) -> (Self::State, Self::Context);

    fn enter(&self, state: Self::State, ctx: &mut Self::Context) -> Node<Self>;

    /// Route the result of the invocation started in `state`.
    fn on_event(&self, state: Self::State, event: Self::Event, ctx: &mut Self::Context)
    -> Self::State;

    fn intermediate(&self, state: Self::State, ctx: &Self::Context) -> Self::Intermediate;
}

pub enum Node<A: DeviceAction> {
    Invoke(Invocation<A>),
    /// Guard: move on without touching the device.
    Decide(A::State),
    Success(A::Output),
    Failure(A::Error),
    Stopped,
}

/// How a nested action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<O, E> {
    Completed(O),
    Error(E),
    Stopped,
}

impl<O, E> Outcome<O, E> {
    pub fn into_state<I>(self) -> DeviceActionState<O, E, I> {
        match self {
            Self::Completed(o) => DeviceActionState::Completed(o),
            Self::Error(e) => DeviceActionState::Error(e),
            Self::Stopped => DeviceActionState::Stopped,
        }
    }
}

// ── Invocation environment ───────────────────────────────────

/// What an invocation may use: the command sender, its cancellation token
/// and the progress sink of the action that started it.
pub struct Env<I> {
    sender: Rc<dyn CommandSender>,
    cancel: CancelToken,
    progress: Rc<dyn Fn(I)>,
    /// The current step was already published by `execute`.
    announced: bool,
}

impl<I> Clone for Env<I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            announced: self.announced,
        }
    }
}

impl<I> Env<I> {
    pub fn sender(&self) -> &dyn CommandSender {
        &*self.sender
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Publish `Pending(intermediate)` for the owning action.
    pub fn report(&self, intermediate: I) {
        if !self.cancel.is_cancelled() {
            (self.progress)(intermediate);
        }
    }
}

// ── Invocations ──────────────────────────────────────────────

type Run<I, Ev> = Box<dyn FnOnce(Env<I>) -> LocalFuture<'static, Ev>>;

/// One asynchronous step.  Every constructor takes a `map` turning the
/// step's result, failures included, into the action's event.
pub struct Invocation<A: DeviceAction> {
    label: &'static str,
    run: Run<A::Intermediate, A::Event>,
}

impl<A: DeviceAction> Invocation<A> {
    pub fn command<C, F>(command: C, map: F) -> Self
    where
        C: Command + 'static,
        F: FnOnce(CommandResult<C::Response, C::Error>) -> A::Event + 'static,
    {
        Self {
            label: core::any::type_name::<C>(),
            run: Box::new(move |env: Env<A::Intermediate>| -> LocalFuture<'static, A::Event> {
                Box::pin(async move { map(send_command(env.sender(), &command).await) })
            }),
        }
    }

    pub fn apdu<F>(apdu: Apdu, options: SendOptions, map: F) -> Self
    where
        F: FnOnce(Result<ApduResponse, ConnectionError>) -> A::Event + 'static,
    {
        Self {
            label: "raw APDU",
            run: Box::new(move |env: Env<A::Intermediate>| -> LocalFuture<'static, A::Event> {
                Box::pin(async move { map(env.sender().send_apdu_with(&apdu, options).await) })
            }),
        }
    }

    /// Run `child` to completion.  Its intermediates are republished
    /// through `map_intermediate`; cancelling the parent cancels it.
    pub fn sub_action<B, MI, MO>(child: B, map_intermediate: MI, map_outcome: MO) -> Self
    where
        B: DeviceAction,
        MI: Fn(B::Intermediate) -> A::Intermediate + 'static,
        MO: FnOnce(Outcome<B::Output, B::Error>) -> A::Event + 'static,
    {
        Self {
            label: child.name(),
            run: Box::new(move |env: Env<A::Intermediate>| -> LocalFuture<'static, A::Event> {
                let parent = env.progress.clone();
                let child_env = Env {
                    sender: env.sender.clone(),
                    cancel: env.cancel.child(),
                    progress: Rc::new(move |i: B::Intermediate| parent(map_intermediate(i))),
                    announced: env.announced,
                };
                Box::pin(async move { map_outcome(drive(&child, &child_env).await) })
            }),
        }
    }

    /// Arbitrary async work, e.g. a delay or several raw exchanges.
    pub fn task<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Env<A::Intermediate>) -> Fut + 'static,
        Fut: Future<Output = A::Event> + 'static,
    {
        Self {
            label: "task",
            run: Box::new(move |env: Env<A::Intermediate>| -> LocalFuture<'static, A::Event> {
                Box::pin(f(env))
            }),
        }
    }
}

// ── Driver ───────────────────────────────────────────────────

pub(crate) async fn drive<A: DeviceAction>(
    action: &A,
    env: &Env<A::Intermediate>,
) -> Outcome<A::Output, A::Error> {
    let (state, ctx) = action.initial();
    drive_from(action, state, ctx, env).await
}

async fn drive_from<A: DeviceAction>(
    action: &A,
    mut state: A::State,
    mut ctx: A::Context,
    env: &Env<A::Intermediate>,
) -> Outcome<A::Output, A::Error> {
    let name = action.name();
    let mut first = env.announced;
    loop {
        if env.cancel.is_cancelled() {
            debug!("{name}: stopped in {:?}", state);
            return Outcome::Stopped;
        }
        let announced = core::mem::take(&mut first);
        match action.enter(state, &mut ctx) {
            Node::Decide(next) => {
                debug!("{name}: {:?} -> {:?}", state, next);
                state = next;
            }
            Node::Invoke(invocation) => {
                if !announced {
                    env.report(action.intermediate(state, &ctx));
                }
                debug!("{name}: {:?} invokes {}", state, invocation.label);
                let call = (invocation.run)(Env {
                    announced,
                    ..env.clone()
                });
                let event = future::or(async { Some(call.await) }, async {
                    env.cancel.cancelled().await;
                    None
                })
                .await;
                match event {
                    Some(event) if !env.cancel.is_cancelled() => {
                        state = action.on_event(state, event, &mut ctx);
                    }
                    _ => {
                        debug!("{name}: cancelled during {:?}", state);
                        return Outcome::Stopped;
                    }
                }
            }
            Node::Success(output) => return Outcome::Completed(output),
            Node::Failure(error) => return Outcome::Error(error),
            Node::Stopped => return Outcome::Stopped,
        }
    }
}

// ── Execution handle ─────────────────────────────────────────

/// Future that performs the run; poll it on the executor that drives the
/// connection.
pub type ActionRun = LocalFuture<'static, ()>;

pub type ActionState<A> = DeviceActionState<
    <A as DeviceAction>::Output,
    <A as DeviceAction>::Error,
    <A as DeviceAction>::Intermediate,
>;

pub struct ActionHandle<O, E, I> {
    log: StateLog<DeviceActionState<O, E, I>>,
    cancel: CancelToken,
}

impl<O, E, I> Clone for ActionHandle<O, E, I> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<O: Clone, E: Clone, I: Clone> ActionHandle<O, E, I> {
    /// Replays every state emitted so far, then follows the run.  Empty
    /// once the run has finished.
    pub fn subscribe(&self) -> Subscription<DeviceActionState<O, E, I>> {
        self.log.subscribe()
    }

    /// Stop the run.  Publishes a single `Stopped` unless the run already
    /// finished; nothing is published after it.
    pub fn cancel(&self) {
        if self.log.push(DeviceActionState::Stopped) {
            info!("device action cancelled");
        }
        self.cancel.cancel();
    }

    pub fn latest(&self) -> DeviceActionState<O, E, I> {
        self.log.latest().unwrap_or(DeviceActionState::NotStarted)
    }

    pub fn is_finished(&self) -> bool {
        self.log.is_finished()
    }

    /// Wait for the terminal state.
    pub async fn finished(&self) -> DeviceActionState<O, E, I> {
        let mut states = self.subscribe();
        while states.next().await.is_some() {}
        self.latest()
    }
}

/// Start `action`.  The first `Pending` is published before this returns;
/// nothing else happens until the returned [`ActionRun`] is polled.
pub fn execute<A: DeviceAction>(
    action: A,
    sender: Rc<dyn CommandSender>,
) -> (ActionHandle<A::Output, A::Error, A::Intermediate>, ActionRun) {
    let log = StateLog::new();
    let cancel = CancelToken::new();

    let (state, ctx) = action.initial();
    log.push(DeviceActionState::Pending(action.intermediate(state, &ctx)));

    let progress = log.clone();
    let env = Env {
        sender,
        cancel: cancel.clone(),
        progress: Rc::new(move |i: A::Intermediate| {
            progress.push(DeviceActionState::Pending(i));
        }),
        announced: true,
    };

    let run_log = log.clone();
    let run: ActionRun = Box::pin(async move {
        let name = action.name();
        info!("{name} started");
        let outcome = drive_from(&action, state, ctx, &env).await;
        let label = match &outcome {
            Outcome::Completed(_) => "completed",
            Outcome::Error(_) => "failed",
            Outcome::Stopped => "stopped",
        };
        if run_log.push(outcome.into_state()) {
            info!("{name} {label}");
        }
    });

    (ActionHandle { log, cancel }, run)
}
