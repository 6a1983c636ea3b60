// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::{Value, VarInfo, Variable};
use std::collections::{BTreeSet, HashMap};

/// Variables exposed by one node, who subscribed to them, and what this node
/// has learnt about its peers' variables.
///
/// Owned by a [`Dispatcher`](crate::Dispatcher); not shared between nodes.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    vars: HashMap<String, Variable>,
    subscribers: HashMap<String, BTreeSet<String>>,
    remote_lists: HashMap<String, Vec<VarInfo>>,
    remote_values: HashMap<(String, String), Value>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variable. Existing subscriptions survive the
    /// replacement.
    pub fn insert(&mut self, var: Variable) -> Option<Variable> {
        self.vars.insert(var.name().to_string(), var)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Returns true only when the subscription is new.
    pub fn subscribe(&mut self, name: &str, node: &str) -> bool {
        self.subscribers
            .entry(name.to_string())
            .or_default()
            .insert(node.to_string())
    }

    pub fn unsubscribe(&mut self, name: &str, node: &str) -> bool {
        let Some(set) = self.subscribers.get_mut(name) else {
            return false;
        };
        let removed = set.remove(node);
        if set.is_empty() {
            self.subscribers.remove(name);
        }
        removed
    }

    pub fn subscribers(&self, name: &str) -> Vec<String> {
        self.subscribers
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Local variables, sorted by name.
    pub fn infos(&self) -> Vec<VarInfo> {
        let mut infos: Vec<VarInfo> = self.vars.values().map(|v| v.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn set_remote_list(&mut self, node: &str, list: Vec<VarInfo>) {
        self.remote_lists.insert(node.to_string(), list);
    }

    pub fn remote_list(&self, node: &str) -> Option<&[VarInfo]> {
        self.remote_lists.get(node).map(Vec::as_slice)
    }

    pub fn set_remote_value(&mut self, node: &str, name: &str, value: Value) {
        self.remote_values
            .insert((node.to_string(), name.to_string()), value);
    }

    pub fn remote_value(&self, node: &str, name: &str) -> Option<&Value> {
        self.remote_values.get(&(node.to_string(), name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut reg = VariableRegistry::new();
        assert!(reg.subscribe("rcstate", "GUI"));
        assert!(!reg.subscribe("rcstate", "GUI"));
        assert!(reg.subscribe("rcstate", "LOGGER"));
        assert_eq!(reg.subscribers("rcstate"), vec!["GUI", "LOGGER"]);
    }

    #[test]
    fn test_unsubscribe_drops_empty_sets() {
        let mut reg = VariableRegistry::new();
        reg.subscribe("rcstate", "GUI");
        assert!(reg.unsubscribe("rcstate", "GUI"));
        assert!(!reg.unsubscribe("rcstate", "GUI"));
        assert!(reg.subscribers("rcstate").is_empty());
    }

    #[test]
    fn test_replace_keeps_subscribers() {
        let mut reg = VariableRegistry::new();
        reg.insert(Variable::new("nevents", 0));
        reg.subscribe("nevents", "GUI");
        let old = reg.insert(Variable::new("nevents", 5));
        assert!(old.is_some());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.subscribers("nevents"), vec!["GUI"]);
        assert_eq!(reg.get("nevents").unwrap().read().unwrap(), Value::Int(5));
    }

    #[test]
    fn test_infos_sorted() {
        let mut reg = VariableRegistry::new();
        reg.insert(Variable::new("b", 0));
        reg.insert(Variable::new("a", "x"));
        let names: Vec<_> = reg.infos().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
