// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::message::request;
use crate::{
    DispatchError, Endpoint, Message, Transport, TransportError, Value, VarInfo, VarValue,
    Variable, VariableError, VariableRegistry,
};
use log::{debug, error, info, warn};
use slc_log::Priority;
use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

/// Handler for one request name.
///
/// Returning `Err` makes the dispatcher send an `ERROR` reply to the sender;
/// transport errors are passed up to the caller of `dispatch` instead.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, msg: &Message, dispatcher: &Dispatcher) -> Result<bool, DispatchError>;

    /// Called as soon as `msg` is received, before any earlier message has
    /// finished dispatching. Must not wait for the message being dispatched.
    fn interrupt(&self, _msg: &Message, _dispatcher: &Dispatcher) {}
}

impl<F> CommandHandler for F
where
    F: Fn(&Message, &Dispatcher) -> Result<bool, DispatchError> + Send + Sync,
{
    fn handle(&self, msg: &Message, dispatcher: &Dispatcher) -> Result<bool, DispatchError> {
        self(msg, dispatcher)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No handler is registered for the request.
    Unhandled,
    /// The handler ran and returned this result.
    Handled(bool),
}

/// Routes incoming messages of one node and owns that node's variables.
pub struct Dispatcher {
    node: String,
    transport: Arc<dyn Transport>,
    log_node: Mutex<Option<String>>,
    handlers: Mutex<HashMap<String, Arc<dyn CommandHandler>>>,
    registry: Mutex<VariableRegistry>,
    /// Held from reading a changed value until every subscriber got it, so
    /// notifications for a variable leave in the order the values were read.
    notify: Mutex<()>,
}

impl Dispatcher {
    pub fn new(node: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            node: node.into(),
            transport,
            log_node: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            registry: Mutex::new(VariableRegistry::new()),
            notify: Mutex::new(()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Node that receives a copy of every [`Dispatcher::log`] entry.
    pub fn set_log_node(&self, node: Option<String>) {
        *self.log_node.lock().unwrap_or_else(PoisonError::into_inner) = node;
    }

    pub fn log_node(&self) -> Option<String> {
        self.log_node
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register_command(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        let name = name.to_ascii_uppercase();
        debug!("[{}] registered command {name}", self.node);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    pub fn register_variable(&self, mut var: Variable) {
        var.bind(&self.node);
        debug!("[{}] registered variable {}", self.node, var.name());
        self.registry().insert(var);
    }

    fn registry(&self) -> MutexGuard<'_, VariableRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `msg` to `dest`, stamped with this node as the source.
    pub fn send(&self, dest: &str, msg: &Message) -> Result<(), TransportError> {
        let mut msg = msg.clone();
        msg.set_node(&self.node);
        let frame = msg
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.transport.send(dest, &frame)
    }

    pub fn reply_ok(&self, dest: &str, text: &str) -> Result<(), TransportError> {
        self.send(dest, &Message::new(request::OK).with_data(text))
    }

    pub fn reply_error(&self, dest: &str, text: &str) -> Result<(), TransportError> {
        self.send(dest, &Message::new(request::ERROR).with_data(text))
    }

    pub fn dispatch_frame(&self, frame: &[u8]) -> Result<Dispatch, DispatchError> {
        let msg = Message::decode(frame)?;
        self.dispatch(&msg)
    }

    pub fn dispatch(&self, msg: &Message) -> Result<Dispatch, DispatchError> {
        match msg.request() {
            request::VGET => return self.serve_get(msg).map(Dispatch::Handled),
            request::VSET => return self.serve_set(msg).map(Dispatch::Handled),
            request::VLISTGET => {
                let list = self.list_variables()?;
                let reply = Message::new(request::VLISTSET).with_data(list);
                self.send(msg.node(), &reply)?;
                return Ok(Dispatch::Handled(true));
            }
            request::VLISTSET => {
                if let Err(e) = self.apply_variable_list(msg.data()) {
                    warn!("[{}] ignoring variable list from {}: {e}", self.node, msg.node());
                    return Ok(Dispatch::Handled(false));
                }
                return Ok(Dispatch::Handled(true));
            }
            request::VREPLY => self.cache_remote_value(msg),
            _ => {}
        }

        let Some(handler) = self.handler(msg.request()) else {
            if msg.request() == request::VREPLY {
                return Ok(Dispatch::Handled(true));
            }
            return Ok(Dispatch::Unhandled);
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(msg, self))) {
            Ok(Ok(handled)) => Ok(Dispatch::Handled(handled)),
            Ok(Err(DispatchError::Transport(e))) => Err(DispatchError::Transport(e)),
            Ok(Err(e)) => {
                warn!(
                    "[{}] {} from {} failed: {e}",
                    self.node,
                    msg.request(),
                    msg.node()
                );
                self.reply_error(msg.node(), &e.to_string())?;
                Ok(Dispatch::Handled(false))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    "[{}] handler for {} panicked: {reason}",
                    self.node,
                    msg.request()
                );
                self.reply_error(msg.node(), &reason)?;
                Ok(Dispatch::Handled(false))
            }
        }
    }

    /// Give the handler of `msg` a chance to cut short whatever the node is
    /// busy with. Variable requests and unknown requests are ignored.
    pub fn interrupt(&self, msg: &Message) {
        let Some(handler) = self.handler(msg.request()) else {
            return;
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.interrupt(msg, self))) {
            error!(
                "[{}] interrupt for {} panicked: {}",
                self.node,
                msg.request(),
                panic_message(panic.as_ref())
            );
        }
    }

    fn handler(&self, request: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request)
            .cloned()
    }

    /// Read `name` and subscribe `requester` to its future changes.
    pub fn get_variable(&self, requester: &str, name: &str) -> Result<Value, VariableError> {
        let mut registry = self.registry();
        let var = registry
            .get(name)
            .ok_or_else(|| VariableError::NotFound(name.to_string()))?;
        let value = var.read()?;
        if !requester.is_empty() && requester != self.node && registry.subscribe(name, requester) {
            debug!("[{}] {requester} subscribed to {name}", self.node);
        }
        Ok(value)
    }

    /// Write a local variable on behalf of `requester` and notify subscribers.
    pub fn set_variable(&self, requester: &str, target: &VarValue) -> Result<(), VariableError> {
        let _notify = self.notify_guard();
        let (value, subscribers) = {
            let registry = self.registry();
            let var = registry
                .get(&target.name)
                .ok_or_else(|| VariableError::NotFound(target.name.clone()))?;
            if !target.node.is_empty() && target.node != self.node {
                return Err(VariableError::WrongNode {
                    name: target.name.clone(),
                    owner: self.node.clone(),
                    requested: target.node.clone(),
                });
            }
            var.write(&target.value)?;
            debug!(
                "[{}] {} set by {requester} to {}",
                self.node, target.name, target.value
            );
            (target.value.clone(), registry.subscribers(&target.name))
        };
        self.fan_out(&target.name, value, subscribers);
        Ok(())
    }

    /// Re-read `name` and push its value to every subscriber. Used when the
    /// owner changed the value itself.
    pub fn notify(&self, name: &str) -> Result<(), VariableError> {
        let _notify = self.notify_guard();
        let (value, subscribers) = {
            let registry = self.registry();
            let var = registry
                .get(name)
                .ok_or_else(|| VariableError::NotFound(name.to_string()))?;
            (var.read()?, registry.subscribers(name))
        };
        self.fan_out(name, value, subscribers);
        Ok(())
    }

    fn notify_guard(&self) -> MutexGuard<'_, ()> {
        self.notify.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribers(&self, name: &str) -> Vec<String> {
        self.registry().subscribers(name)
    }

    fn fan_out(&self, name: &str, value: Value, subscribers: Vec<String>) {
        if subscribers.is_empty() {
            return;
        }
        let payload = match serde_json::to_string(&VarValue::new(self.node.clone(), name, value)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[{}] cannot encode {name}: {e}", self.node);
                return;
            }
        };
        let msg = Message::new(request::VREPLY).with_data(payload);
        let unreachable: Vec<String> = subscribers
            .into_iter()
            .filter(|dest| match self.send(dest, &msg) {
                Ok(()) => false,
                Err(e) => {
                    warn!("[{}] dropping subscriber {dest} of {name}: {e}", self.node);
                    true
                }
            })
            .collect();
        if unreachable.is_empty() {
            return;
        }
        let mut registry = self.registry();
        for dest in &unreachable {
            registry.unsubscribe(name, dest);
        }
    }

    /// JSON catalogue of the variables this node exposes.
    pub fn list_variables(&self) -> Result<String, VariableError> {
        serde_json::to_string(&self.registry().infos())
            .map_err(|e| VariableError::Malformed(e.to_string()))
    }

    /// Store a peer's catalogue (as produced by
    /// [`Dispatcher::list_variables`]). Returns the number of entries.
    pub fn apply_variable_list(&self, serialized: &str) -> Result<usize, VariableError> {
        let list: Vec<VarInfo> =
            serde_json::from_str(serialized).map_err(|e| VariableError::Malformed(e.to_string()))?;
        let count = list.len();
        let mut by_node: HashMap<String, Vec<VarInfo>> = HashMap::new();
        for info in list {
            by_node.entry(info.node.clone()).or_default().push(info);
        }
        let mut registry = self.registry();
        for (node, infos) in by_node {
            registry.set_remote_list(&node, infos);
        }
        Ok(count)
    }

    pub fn remote_variables(&self, node: &str) -> Vec<VarInfo> {
        self.registry()
            .remote_list(node)
            .map(<[VarInfo]>::to_vec)
            .unwrap_or_default()
    }

    /// Last value received from `node` for `name`, via a get reply or a
    /// change notification.
    pub fn remote_value(&self, node: &str, name: &str) -> Option<Value> {
        self.registry().remote_value(node, name).cloned()
    }

    /// Log locally and relay to the log node when one is configured. Relay
    /// failures are logged, never returned.
    pub fn log(&self, priority: Priority, message: &str) {
        log::log!(priority.level(), "[{}] {message}", self.node);
        let Some(dest) = self.log_node() else {
            return;
        };
        let msg = Message::new(request::LOG)
            .with_param(priority.code())
            .with_data(message);
        if let Err(e) = self.send(&dest, &msg) {
            warn!("[{}] failed to relay log entry to {dest}: {e}", self.node);
        }
    }

    fn serve_get(&self, msg: &Message) -> Result<bool, DispatchError> {
        match self.get_variable(msg.node(), msg.data()) {
            Ok(value) => {
                let payload = serde_json::to_string(&VarValue::new(self.node.clone(), msg.data(), value))
                    .map_err(|e| DispatchError::Handler(e.to_string()))?;
                self.send(msg.node(), &Message::new(request::VREPLY).with_data(payload))?;
                Ok(true)
            }
            Err(e) => {
                debug!("[{}] VGET {} from {} failed: {e}", self.node, msg.data(), msg.node());
                self.reply_error(msg.node(), &e.to_string())?;
                Ok(false)
            }
        }
    }

    fn serve_set(&self, msg: &Message) -> Result<bool, DispatchError> {
        let result = serde_json::from_str::<VarValue>(msg.data())
            .map_err(|e| VariableError::Malformed(e.to_string()))
            .and_then(|target| self.set_variable(msg.node(), &target));
        match result {
            Ok(()) => {
                self.reply_ok(msg.node(), "")?;
                Ok(true)
            }
            Err(e) => {
                debug!("[{}] VSET from {} failed: {e}", self.node, msg.node());
                self.reply_error(msg.node(), &e.to_string())?;
                Ok(false)
            }
        }
    }

    fn cache_remote_value(&self, msg: &Message) {
        match serde_json::from_str::<VarValue>(msg.data()) {
            Ok(v) => {
                let node = if v.node.is_empty() { msg.node() } else { &v.node };
                self.registry().set_remote_value(node, &v.name, v.value);
            }
            Err(e) => warn!(
                "[{}] ignoring malformed variable reply from {}: {e}",
                self.node,
                msg.node()
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run the receive loop of `endpoint`. One thread reads frames and offers
/// each message to [`Dispatcher::interrupt`] right away; a second thread
/// dispatches the messages in arrival order, so a long-running command never
/// keeps later frames unread. The returned thread ends when the endpoint is
/// detached and every received message has been dispatched.
pub fn spawn_receive_loop(
    dispatcher: Arc<Dispatcher>,
    endpoint: Endpoint,
) -> io::Result<JoinHandle<()>> {
    let (tx, rx) = mpsc::channel::<Message>();
    let worker = {
        let dispatcher = Arc::clone(&dispatcher);
        thread::Builder::new()
            .name(format!("nsm-{}-dispatch", endpoint.node()))
            .spawn(move || {
                for msg in rx {
                    match dispatcher.dispatch(&msg) {
                        Ok(Dispatch::Unhandled) => {
                            debug!(
                                "[{}] unhandled {} dropped",
                                dispatcher.node(),
                                msg.request()
                            );
                        }
                        Ok(Dispatch::Handled(_)) => {}
                        Err(e) => error!("[{}] dispatch failed: {e}", dispatcher.node()),
                    }
                }
            })?
    };
    thread::Builder::new()
        .name(format!("nsm-{}", endpoint.node()))
        .spawn(move || {
            while let Some(frame) = endpoint.recv() {
                let msg = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("[{}] dropping malformed frame: {e}", dispatcher.node());
                        continue;
                    }
                };
                dispatcher.interrupt(&msg);
                if tx.send(msg).is_err() {
                    break;
                }
            }
            drop(tx);
            if worker.join().is_err() {
                error!("[{}] dispatch thread panicked", dispatcher.node());
            }
            info!("[{}] receive loop finished", dispatcher.node());
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnHandler, LocalBus, VarType};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_millis(500);

    fn handler<F>(f: F) -> Arc<dyn CommandHandler>
    where
        F: Fn(&Message, &Dispatcher) -> Result<bool, DispatchError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn setup() -> (LocalBus, Arc<Dispatcher>) {
        let bus = LocalBus::new();
        let dispatcher = Arc::new(Dispatcher::new("CPR5001", Arc::new(bus.clone())));
        (bus, dispatcher)
    }

    fn next(ep: &Endpoint) -> Message {
        let frame = ep.recv_timeout(WAIT).unwrap().expect("expected a message");
        Message::decode(&frame).unwrap()
    }

    fn nothing(ep: &Endpoint) -> bool {
        ep.recv_timeout(Duration::from_millis(50)).unwrap().is_none()
    }

    #[test]
    fn test_unhandled_request() {
        let (_bus, d) = setup();
        let msg = Message::new("NOPE").from_node("RC");
        assert_eq!(d.dispatch(&msg).unwrap(), Dispatch::Unhandled);
    }

    #[test]
    fn test_handler_result_propagated() {
        let (_bus, d) = setup();
        d.register_command("ping", handler(|_: &Message, _: &Dispatcher| Ok(false)));
        let msg = Message::new("PING").from_node("RC");
        assert_eq!(d.dispatch(&msg).unwrap(), Dispatch::Handled(false));
    }

    #[test]
    fn test_reregistering_replaces_handler() {
        let (_bus, d) = setup();
        d.register_command("PING", handler(|_: &Message, _: &Dispatcher| Ok(false)));
        d.register_command("PING", handler(|_: &Message, _: &Dispatcher| Ok(true)));
        let msg = Message::new("PING").from_node("RC");
        assert_eq!(d.dispatch(&msg).unwrap(), Dispatch::Handled(true));
    }

    #[test]
    fn test_malformed_frame_never_reaches_handler() {
        let (_bus, d) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        d.register_command(
            "LOAD",
            handler(move |_: &Message, _: &Dispatcher| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        );
        let err = d
            .dispatch_frame(br#"{"req":"LOAD","node":"RC","npar":-3,"pars":[]}"#)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_panic_becomes_error_reply() {
        let (bus, d) = setup();
        let rc = bus.attach("RC");
        d.register_command(
            "LOAD",
            handler(|_: &Message, _: &Dispatcher| -> Result<bool, DispatchError> {
                panic!("device table missing")
            }),
        );
        let out = d.dispatch(&Message::new("LOAD").from_node("RC")).unwrap();
        assert_eq!(out, Dispatch::Handled(false));
        let reply = next(&rc);
        assert_eq!(reply.request(), request::ERROR);
        assert_eq!(reply.data(), "device table missing");
        assert_eq!(reply.node(), "CPR5001");
    }

    #[test]
    fn test_handler_error_becomes_error_reply() {
        let (bus, d) = setup();
        let rc = bus.attach("RC");
        d.register_command(
            "LOAD",
            handler(|_: &Message, _: &Dispatcher| Err(DispatchError::Handler("no config".into()))),
        );
        d.dispatch(&Message::new("LOAD").from_node("RC")).unwrap();
        let reply = next(&rc);
        assert_eq!(reply.request(), request::ERROR);
        assert!(reply.data().contains("no config"));
    }

    #[test]
    fn test_reply_transport_failure_surfaces() {
        let (_bus, d) = setup();
        d.register_command(
            "LOAD",
            handler(|_: &Message, _: &Dispatcher| Err(DispatchError::Handler("x".into()))),
        );
        // Nobody is attached as RC, so the error reply cannot be delivered.
        let err = d.dispatch(&Message::new("LOAD").from_node("RC")).unwrap_err();
        assert!(matches!(err, DispatchError::Transport(TransportError::Unreachable(_))));
    }

    #[test]
    fn test_set_then_get_roundtrip() {
        let (_bus, d) = setup();
        d.register_variable(Variable::new("ttrx.msg", "").settable(true));
        d.set_variable("GUI", &VarValue::new("", "ttrx.msg", "link up"))
            .unwrap();
        assert_eq!(d.get_variable("GUI", "ttrx.msg").unwrap(), Value::from("link up"));
    }

    #[test]
    fn test_set_on_read_only_keeps_value() {
        let (_bus, d) = setup();
        d.register_variable(Variable::new("copper.err.ffull", 0));
        let err = d
            .set_variable("GUI", &VarValue::new("CPR5001", "copper.err.ffull", 1))
            .unwrap_err();
        assert_eq!(err, VariableError::NotWritable("copper.err.ffull".into()));
        assert_eq!(d.get_variable("GUI", "copper.err.ffull").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_set_with_foreign_owner_rejected() {
        let (_bus, d) = setup();
        d.register_variable(Variable::new("nevents", 0).settable(true));
        let err = d
            .set_variable("GUI", &VarValue::new("CPR5002", "nevents", 7))
            .unwrap_err();
        assert!(matches!(err, VariableError::WrongNode { .. }));
        assert_eq!(d.get_variable("GUI", "nevents").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_double_subscription_notifies_once() {
        let (bus, d) = setup();
        let gui = bus.attach("GUI");
        d.register_variable(Variable::new("nevents", 0).settable(true));
        d.get_variable("GUI", "nevents").unwrap();
        d.get_variable("GUI", "nevents").unwrap();
        assert_eq!(d.subscribers("nevents"), vec!["GUI"]);

        d.set_variable("RC", &VarValue::new("", "nevents", 42)).unwrap();
        let note = next(&gui);
        assert_eq!(note.request(), request::VREPLY);
        let vv: VarValue = serde_json::from_str(note.data()).unwrap();
        assert_eq!(vv, VarValue::new("CPR5001", "nevents", 42));
        assert!(nothing(&gui), "subscriber must be notified only once");
    }

    #[test]
    fn test_unreachable_subscriber_is_removed() {
        let (bus, d) = setup();
        let gui = bus.attach("GUI");
        d.register_variable(Variable::new("nevents", 0).settable(true));
        d.get_variable("GUI", "nevents").unwrap();
        d.get_variable("GHOST", "nevents").unwrap();

        d.set_variable("RC", &VarValue::new("", "nevents", 1)).unwrap();
        assert_eq!(d.subscribers("nevents"), vec!["GUI"]);
        next(&gui);

        drop(gui);
        d.set_variable("RC", &VarValue::new("", "nevents", 2)).unwrap();
        assert!(d.subscribers("nevents").is_empty());
    }

    #[test]
    fn test_notify_rereads_handler() {
        let (bus, d) = setup();
        let gui = bus.attach("GUI");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        d.register_variable(Variable::with_handler(
            "nevents",
            VarType::Int,
            Arc::new(FnHandler::getter(move || {
                Ok(Value::Int(c.load(Ordering::SeqCst) as i32))
            })),
        ));
        d.get_variable("GUI", "nevents").unwrap();
        counter.store(9, Ordering::SeqCst);
        d.notify("nevents").unwrap();
        let vv: VarValue = serde_json::from_str(next(&gui).data()).unwrap();
        assert_eq!(vv.value, Value::Int(9));
    }

    #[test]
    fn test_vget_protocol() {
        let (bus, d) = setup();
        let gui = bus.attach("GUI");
        d.register_variable(Variable::new("hslb[0].fw", "b2l-v34"));

        let req = Message::new(request::VGET).from_node("GUI").with_data("hslb[0].fw");
        assert_eq!(d.dispatch(&req).unwrap(), Dispatch::Handled(true));
        let reply = next(&gui);
        assert_eq!(reply.request(), request::VREPLY);
        let vv: VarValue = serde_json::from_str(reply.data()).unwrap();
        assert_eq!(vv.value, Value::from("b2l-v34"));

        let missing = Message::new(request::VGET).from_node("GUI").with_data("nope");
        assert_eq!(d.dispatch(&missing).unwrap(), Dispatch::Handled(false));
        assert_eq!(next(&gui).request(), request::ERROR);
    }

    #[test]
    fn test_vset_protocol() {
        let (bus, d) = setup();
        let gui = bus.attach("GUI");
        d.register_variable(Variable::new("trigio", "off").settable(true));
        let payload = serde_json::to_string(&VarValue::new("", "trigio", "on")).unwrap();
        let req = Message::new(request::VSET).from_node("GUI").with_data(payload);
        assert_eq!(d.dispatch(&req).unwrap(), Dispatch::Handled(true));
        assert_eq!(next(&gui).request(), request::OK);
        assert_eq!(d.get_variable("", "trigio").unwrap(), Value::from("on"));

        let bad = Message::new(request::VSET).from_node("GUI").with_data("{");
        assert_eq!(d.dispatch(&bad).unwrap(), Dispatch::Handled(false));
        assert_eq!(next(&gui).request(), request::ERROR);
    }

    #[test]
    fn test_variable_list_exchange() {
        let bus = LocalBus::new();
        let a = Dispatcher::new("CPR5001", Arc::new(bus.clone()));
        let b = Dispatcher::new("GUI", Arc::new(bus.clone()));
        let gui = bus.attach("GUI");
        a.register_variable(Variable::new("nevents", 0));
        a.register_variable(Variable::new("trigio", "off").settable(true));

        a.dispatch(&Message::new(request::VLISTGET).from_node("GUI"))
            .unwrap();
        let list = next(&gui);
        assert_eq!(list.request(), request::VLISTSET);
        assert_eq!(b.dispatch(&list).unwrap(), Dispatch::Handled(true));

        let remote = b.remote_variables("CPR5001");
        assert_eq!(remote.len(), 2);
        assert_eq!(remote[1].name, "trigio");
        assert!(remote[1].set);
        assert!(b.remote_variables("OTHER").is_empty());
    }

    #[test]
    fn test_apply_malformed_list() {
        let (_bus, d) = setup();
        assert!(matches!(
            d.apply_variable_list("[{]"),
            Err(VariableError::Malformed(_))
        ));
    }

    #[test]
    fn test_vreply_cached() {
        let (_bus, d) = setup();
        let payload = serde_json::to_string(&VarValue::new("HV", "hvstate", "PEAK")).unwrap();
        let msg = Message::new(request::VREPLY).from_node("HV").with_data(payload);
        assert_eq!(d.dispatch(&msg).unwrap(), Dispatch::Handled(true));
        assert_eq!(d.remote_value("HV", "hvstate"), Some(Value::from("PEAK")));
    }

    #[test]
    fn test_log_relay() {
        let (bus, d) = setup();
        let logger = bus.attach("LOGCOLLECTOR");
        d.set_log_node(Some("LOGCOLLECTOR".into()));
        d.log(Priority::Warning, "ttrx-130 is not consistent");
        let entry = next(&logger);
        assert_eq!(entry.request(), request::LOG);
        assert_eq!(entry.param(0), Some(Priority::Warning.code()));
        assert_eq!(entry.data(), "ttrx-130 is not consistent");
    }

    #[test]
    fn test_log_relay_failure_is_swallowed() {
        let (_bus, d) = setup();
        d.set_log_node(Some("NOWHERE".into()));
        d.log(Priority::Error, "still fine");
    }

    #[test]
    fn test_receive_loop_dispatches_until_detached() {
        let bus = LocalBus::new();
        let d = Arc::new(Dispatcher::new("CPR5001", Arc::new(bus.clone())));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        d.register_command(
            "PING",
            handler(move |msg: &Message, d: &Dispatcher| {
                seen.fetch_add(1, Ordering::SeqCst);
                d.reply_ok(msg.node(), "pong")?;
                Ok(true)
            }),
        );
        let rc = bus.attach("RC");
        let handle = spawn_receive_loop(Arc::clone(&d), bus.attach("CPR5001")).unwrap();

        let frame = Message::new("PING").from_node("RC").encode().unwrap();
        bus.send("CPR5001", &frame).unwrap();
        bus.send("CPR5001", b"garbage").unwrap();
        bus.send("CPR5001", &frame).unwrap();
        assert_eq!(next(&rc).data(), "pong");
        assert_eq!(next(&rc).data(), "pong");

        bus.detach("CPR5001");
        handle.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Blocks in `handle` until a later message interrupts it.
    struct Blocking {
        cancelled: AtomicBool,
    }

    impl CommandHandler for Blocking {
        fn handle(&self, msg: &Message, d: &Dispatcher) -> Result<bool, DispatchError> {
            if msg.request() == "CANCEL" {
                d.reply_ok(msg.node(), "cancel")?;
                return Ok(true);
            }
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.cancelled.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            let text = if self.cancelled.load(Ordering::SeqCst) {
                "interrupted"
            } else {
                "timed out"
            };
            d.reply_ok(msg.node(), text)?;
            Ok(true)
        }

        fn interrupt(&self, msg: &Message, _d: &Dispatcher) {
            if msg.request() == "CANCEL" {
                self.cancelled.store(true, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_receive_loop_interrupts_busy_handler() {
        let bus = LocalBus::new();
        let d = Arc::new(Dispatcher::new("CPR5001", Arc::new(bus.clone())));
        let blocking = Arc::new(Blocking {
            cancelled: AtomicBool::new(false),
        });
        d.register_command("WORK", Arc::clone(&blocking) as Arc<dyn CommandHandler>);
        d.register_command("CANCEL", blocking);
        let rc = bus.attach("RC");
        let handle = spawn_receive_loop(Arc::clone(&d), bus.attach("CPR5001")).unwrap();

        let begin = Instant::now();
        for req in ["WORK", "CANCEL"] {
            let frame = Message::new(req).from_node("RC").encode().unwrap();
            bus.send("CPR5001", &frame).unwrap();
        }
        let first = rc.recv_timeout(Duration::from_secs(3)).unwrap().unwrap();
        assert_eq!(Message::decode(&first).unwrap().data(), "interrupted");
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert_eq!(next(&rc).data(), "cancel");

        bus.detach("CPR5001");
        handle.join().unwrap();
    }

    #[test]
    fn test_interrupt_skips_unknown_request() {
        let (_bus, d) = setup();
        d.interrupt(&Message::new("NOPE").from_node("RC"));
        d.interrupt(&Message::new(request::VGET).from_node("RC").with_data("x"));
    }

    #[test]
    fn test_concurrent_sets_leave_subscribers_current() {
        let (bus, d) = setup();
        let gui = bus.attach("GUI");
        d.register_variable(Variable::new("rcstate", "NOTREADY").settable(true));
        d.get_variable("GUI", "rcstate").unwrap();

        let writers: Vec<_> = ["READY", "ERROR", "RUNNING", "FATAL"]
            .into_iter()
            .map(|state| {
                let d = Arc::clone(&d);
                thread::spawn(move || {
                    for _ in 0..50 {
                        d.set_variable("RC", &VarValue::new("", "rcstate", state)).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let mut last = None;
        while let Some(frame) = gui.recv_timeout(Duration::from_millis(100)).unwrap() {
            let vv: VarValue = serde_json::from_str(Message::decode(&frame).unwrap().data()).unwrap();
            last = Some(vv.value);
        }
        assert_eq!(last, Some(d.get_variable("GUI", "rcstate").unwrap()));
    }
}
