// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::TransportError;
use log::debug;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Delivers encoded frames to a named node. Incoming frames are handed to
/// [`Dispatcher::dispatch_frame`](crate::Dispatcher::dispatch_frame) by
/// whatever owns the receiving side.
pub trait Transport: Send + Sync {
    fn send(&self, dest: &str, frame: &[u8]) -> Result<(), TransportError>;
}

/// In-process transport: every attached node gets a channel.
#[derive(Clone, Default)]
pub struct LocalBus {
    nodes: Arc<Mutex<HashMap<String, Sender<Vec<u8>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node`, replacing any previous attachment under that name.
    pub fn attach(&self, node: &str) -> Endpoint {
        let (tx, rx) = mpsc::channel();
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.to_string(), tx);
        debug!("[{node}] attached to local bus");
        Endpoint {
            node: node.to_string(),
            rx,
        }
    }

    /// Detach `node`; its endpoint sees end-of-stream once drained.
    pub fn detach(&self, node: &str) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
    }

    pub fn is_attached(&self, node: &str) -> bool {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node)
    }
}

impl Transport for LocalBus {
    fn send(&self, dest: &str, frame: &[u8]) -> Result<(), TransportError> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = nodes.get(dest) else {
            return Err(TransportError::Unreachable(dest.to_string()));
        };
        if tx.send(frame.to_vec()).is_err() {
            nodes.remove(dest);
            return Err(TransportError::Closed(dest.to_string()));
        }
        Ok(())
    }
}

/// Receiving side of a [`LocalBus`] attachment.
pub struct Endpoint {
    node: String,
    rx: Receiver<Vec<u8>>,
}

impl Endpoint {
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Block until a frame arrives; `None` once the node is detached.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }

    /// `Ok(None)` on timeout, `Err` once the node is detached.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed(self.node.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_to_attached_node() {
        let bus = LocalBus::new();
        let ep = bus.attach("GUI");
        bus.send("GUI", b"frame").unwrap();
        assert_eq!(ep.recv().unwrap(), b"frame");
    }

    #[test]
    fn test_send_to_unknown_node() {
        let bus = LocalBus::new();
        assert_eq!(
            bus.send("NOBODY", b"x"),
            Err(TransportError::Unreachable("NOBODY".into()))
        );
    }

    #[test]
    fn test_dropped_endpoint_is_closed_and_forgotten() {
        let bus = LocalBus::new();
        drop(bus.attach("GUI"));
        assert_eq!(bus.send("GUI", b"x"), Err(TransportError::Closed("GUI".into())));
        assert!(!bus.is_attached("GUI"));
    }

    #[test]
    fn test_detach_ends_stream() {
        let bus = LocalBus::new();
        let ep = bus.attach("GUI");
        bus.detach("GUI");
        assert!(ep.recv().is_none());
        assert!(ep.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
