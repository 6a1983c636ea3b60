// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Command-driven node state machine.
//!
//! A [`Vocabulary`] names the states and the legality table; a [`Hooks`]
//! implementation does the work of each command. The engine serializes
//! commands, enters transitional states, resolves them once the hook
//! returns and sends exactly one reply per accepted command.

use crate::errors::HookError;
use log::{debug, info, warn};
use slc_log::Priority;
use slc_nsm::{
    CommandHandler, DispatchError, Dispatcher, FnHandler, Message, Value, VarType, Variable,
    request,
};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

/// States from which a command is accepted.
#[derive(Debug)]
pub enum Legal<S: 'static> {
    Any,
    From(&'static [S]),
}

/// One row of a legality table.
#[derive(Debug)]
pub struct Rule<S: 'static> {
    pub command: &'static str,
    pub legal: Legal<S>,
    /// Entered when the command is accepted, before the hook runs.
    pub transitional: Option<S>,
    /// Reached when the hook succeeds without settling on a stable state.
    pub next: S,
    /// Already being in `next` is a successful no-op.
    pub idempotent: bool,
}

impl<S: Copy + PartialEq> Rule<S> {
    pub fn allows(&self, state: S) -> bool {
        match self.legal {
            Legal::Any => true,
            Legal::From(states) => states.contains(&state),
        }
    }

    /// Commands accepted in any state may cut short the command in progress.
    pub fn preempts(&self) -> bool {
        matches!(self.legal, Legal::Any)
    }
}

pub trait Vocabulary: Send + Sync + 'static {
    type State: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Read-only text variable publishing the node state.
    const STATE_VARIABLE: &'static str;
    const INITIAL: Self::State;
    const ERROR: Self::State;

    fn rules() -> &'static [Rule<Self::State>];

    fn is_transitional(state: Self::State) -> bool;

    fn is_error(state: Self::State) -> bool;

    fn rule(command: &str) -> Option<&'static Rule<Self::State>> {
        Self::rules().iter().find(|r| r.command == command)
    }
}

/// Domain work behind each command of a vocabulary.
pub trait Hooks<V: Vocabulary>: Send + Sync {
    /// Run `command`, accepted while the node was in `from`. The node is
    /// already in the command's transitional state, if it has one.
    fn run(
        &self,
        command: &str,
        from: V::State,
        msg: &Message,
        node: &NodeHandle<V>,
    ) -> Result<(), HookError>;

    /// Called for a pre-empting command before it waits its turn, while an
    /// earlier command may still be running its hook. Must not wait for that hook.
    fn interrupt(&self, _command: &str, _node: &NodeHandle<V>) {}

    fn on_ok(&self, _msg: &Message, _node: &NodeHandle<V>) {}

    fn on_error(&self, _msg: &Message, _node: &NodeHandle<V>) {}

    fn on_fatal(&self, _msg: &Message, _node: &NodeHandle<V>) {}
}

struct NodeCore<V: Vocabulary> {
    dispatcher: Arc<Dispatcher>,
    state: Arc<Mutex<V::State>>,
    reply: Mutex<String>,
}

/// Cloneable access to a node's state, for hooks and for asynchronous
/// sources such as a controller listener.
pub struct NodeHandle<V: Vocabulary> {
    core: Arc<NodeCore<V>>,
}

impl<V: Vocabulary> Clone for NodeHandle<V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<V: Vocabulary> NodeHandle<V> {
    fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let state = Arc::new(Mutex::new(V::INITIAL));
        let published = Arc::clone(&state);
        dispatcher.register_variable(Variable::with_handler(
            V::STATE_VARIABLE,
            VarType::Text,
            Arc::new(FnHandler::getter(move || {
                let state = *published.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(Value::Text(state.to_string()))
            })),
        ));
        Self {
            core: Arc::new(NodeCore {
                dispatcher,
                state,
                reply: Mutex::new(String::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.core.dispatcher.node()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.core.dispatcher
    }

    pub fn state(&self) -> V::State {
        *self.core.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the state changed. Subscribers of the state variable
    /// are notified of every change.
    pub fn set_state(&self, next: V::State) -> bool {
        let prev = {
            let mut state = self.core.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, next)
        };
        if prev == next {
            return false;
        }
        info!("[{}] {prev} -> {next}", self.name());
        if let Err(e) = self.core.dispatcher.notify(V::STATE_VARIABLE) {
            warn!("[{}] failed to publish state: {e}", self.name());
        }
        true
    }

    /// Move from `expected` to `next` only if the node is still in
    /// `expected`. Returns whether it moved.
    pub fn transition(&self, expected: V::State, next: V::State) -> bool {
        {
            let mut state = self.core.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != expected || expected == next {
                return false;
            }
            *state = next;
        }
        info!("[{}] {expected} -> {next}", self.name());
        if let Err(e) = self.core.dispatcher.notify(V::STATE_VARIABLE) {
            warn!("[{}] failed to publish state: {e}", self.name());
        }
        true
    }

    /// Push the node into `state` from outside a command, typically
    /// `ERROR` or `FATAL` reported by a worker.
    pub fn force_state(&self, state: V::State) {
        if self.set_state(state) {
            warn!("[{}] forced to {state}", self.name());
        }
    }

    /// Append text to the reply of the command being handled.
    pub fn reply(&self, text: &str) {
        let mut reply = self.core.reply.lock().unwrap_or_else(PoisonError::into_inner);
        if !reply.is_empty() {
            reply.push_str("; ");
        }
        reply.push_str(text);
    }

    fn take_reply(&self) -> String {
        std::mem::take(&mut *self.core.reply.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn log(&self, priority: Priority, message: &str) {
        self.core.dispatcher.log(priority, message);
    }
}

pub struct StateMachine<V: Vocabulary> {
    node: NodeHandle<V>,
    hooks: Arc<dyn Hooks<V>>,
    serial: Mutex<()>,
}

impl<V: Vocabulary> StateMachine<V> {
    /// Publish the state variable and register every command of the
    /// vocabulary, plus the `OK`/`ERROR`/`FATAL` notices, on `dispatcher`.
    pub fn install(dispatcher: Arc<Dispatcher>, hooks: Arc<dyn Hooks<V>>) -> Arc<Self> {
        let machine = Arc::new(Self {
            node: NodeHandle::new(Arc::clone(&dispatcher)),
            hooks,
            serial: Mutex::new(()),
        });
        let names = V::rules()
            .iter()
            .map(|r| r.command)
            .chain([request::OK, request::ERROR, request::FATAL]);
        for name in names {
            dispatcher.register_command(name, Arc::clone(&machine) as Arc<dyn CommandHandler>);
        }
        machine
    }

    pub fn node(&self) -> &NodeHandle<V> {
        &self.node
    }

    pub fn state(&self) -> V::State {
        self.node.state()
    }

    /// Run one command. Returns `Ok(false)` when the command was ignored or
    /// answered with `ERROR`; only reply delivery failures are errors.
    pub fn execute(&self, msg: &Message) -> Result<bool, DispatchError> {
        let node = &self.node;
        let command = msg.request();
        match command {
            request::OK => return Ok(self.notice(command, || self.hooks.on_ok(msg, node))),
            request::ERROR => return Ok(self.notice(command, || self.hooks.on_error(msg, node))),
            request::FATAL => return Ok(self.notice(command, || self.hooks.on_fatal(msg, node))),
            _ => {}
        }
        let Some(rule) = V::rule(command) else {
            return Ok(false);
        };
        self.interrupt(msg);

        let _serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = msg.node();
        let dispatcher = node.dispatcher();
        let from = node.state();
        if !rule.allows(from) {
            debug!("[{}] {command} from {sender} ignored in {from}", node.name());
            return Ok(false);
        }
        if rule.idempotent && from == rule.next {
            debug!("[{}] {command}: already in {from}", node.name());
            dispatcher.reply_ok(sender, &format!("already in {from}"))?;
            return Ok(true);
        }

        info!("[{}] {command} from {sender} in {from}", node.name());
        node.take_reply();
        let entry = match rule.transitional {
            Some(transitional) => {
                node.set_state(transitional);
                transitional
            }
            None => from,
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| {
            self.hooks.run(command, from, msg, node)
        })) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => Err(format!("{command} panicked: {}", panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(()) => {
                let current = node.state();
                if current == entry || V::is_transitional(current) {
                    node.set_state(rule.next);
                }
                let text = node.take_reply();
                let end = node.state();
                if V::is_error(end) {
                    let text = if text.is_empty() {
                        format!("{command} left node in {end}")
                    } else {
                        text
                    };
                    dispatcher.reply_error(sender, &text)?;
                    return Ok(false);
                }
                dispatcher.reply_ok(sender, &text)?;
                Ok(true)
            }
            Err(reason) => {
                node.take_reply();
                if !V::is_error(node.state()) {
                    node.set_state(V::ERROR);
                }
                node.log(Priority::Error, &format!("{command} failed: {reason}"));
                dispatcher.reply_error(sender, &reason)?;
                Ok(false)
            }
        }
    }

    /// Let a pre-empting command cut short the running hook. No-op for
    /// every other command.
    pub fn interrupt(&self, msg: &Message) {
        let command = msg.request();
        if !V::rule(command).is_some_and(Rule::preempts) {
            return;
        }
        debug!("[{}] {command} from {} interrupts", self.node.name(), msg.node());
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
            self.hooks.interrupt(command, &self.node)
        })) {
            warn!(
                "[{}] {command} interrupt panicked: {}",
                self.node.name(),
                panic_message(panic.as_ref())
            );
        }
    }

    fn notice(&self, command: &str, f: impl FnOnce()) -> bool {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(panic) => {
                warn!(
                    "[{}] {command} notice handler panicked: {}",
                    self.node.name(),
                    panic_message(panic.as_ref())
                );
                false
            }
        }
    }
}

impl<V: Vocabulary> CommandHandler for StateMachine<V> {
    fn handle(&self, msg: &Message, _dispatcher: &Dispatcher) -> Result<bool, DispatchError> {
        self.execute(msg)
    }

    fn interrupt(&self, msg: &Message, _dispatcher: &Dispatcher) {
        StateMachine::interrupt(self, msg);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
