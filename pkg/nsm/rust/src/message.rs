// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};

/// Upper bound on integer parameters carried by one message.
pub const MAX_PARAMS: usize = 256;

/// Request names understood by every node.
pub mod request {
    pub const OK: &str = "OK";
    pub const ERROR: &str = "ERROR";
    pub const FATAL: &str = "FATAL";
    pub const LOG: &str = "LOG";
    pub const VGET: &str = "VGET";
    pub const VSET: &str = "VSET";
    pub const VREPLY: &str = "VREPLY";
    pub const VLISTGET: &str = "VLISTGET";
    pub const VLISTSET: &str = "VLISTSET";
}

/// A control-bus message: request name, sender, integer parameters and an
/// opaque text payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    req: String,
    node: String,
    pars: Vec<i32>,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct Frame {
    req: String,
    #[serde(default)]
    node: String,
    npar: i64,
    #[serde(default)]
    pars: Vec<i32>,
    #[serde(default)]
    data: String,
}

impl Message {
    pub fn new(req: impl Into<String>) -> Self {
        Self {
            req: req.into().to_ascii_uppercase(),
            ..Default::default()
        }
    }

    pub fn from_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_param(mut self, value: i32) -> Self {
        self.pars.push(value);
        self
    }

    pub fn with_params(mut self, values: &[i32]) -> Self {
        self.pars.extend_from_slice(values);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    pub fn request(&self) -> &str {
        &self.req
    }

    /// Name of the node that sent the message; replies go there.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn params(&self) -> &[i32] {
        &self.pars
    }

    pub fn param(&self, index: usize) -> Option<i32> {
        self.pars.get(index).copied()
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub(crate) fn set_node(&mut self, node: &str) {
        node.clone_into(&mut self.node);
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.req.is_empty() {
            return Err(ProtocolError::EmptyRequest);
        }
        if self.pars.len() > MAX_PARAMS {
            return Err(ProtocolError::InvalidParamCount(self.pars.len() as i64));
        }
        let frame = Frame {
            req: self.req.clone(),
            node: self.node.clone(),
            npar: self.pars.len() as i64,
            pars: self.pars.clone(),
            data: self.data.clone(),
        };
        serde_json::to_vec(&frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
        let frame: Frame =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if frame.req.trim().is_empty() {
            return Err(ProtocolError::EmptyRequest);
        }
        if frame.npar < 0 || frame.npar > MAX_PARAMS as i64 {
            return Err(ProtocolError::InvalidParamCount(frame.npar));
        }
        if frame.npar as usize != frame.pars.len() {
            return Err(ProtocolError::ParamCountMismatch {
                declared: frame.npar,
                actual: frame.pars.len(),
            });
        }
        Ok(Message {
            req: frame.req.trim().to_ascii_uppercase(),
            node: frame.node,
            pars: frame.pars,
            data: frame.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_start_command() {
        let msg = Message::decode(
            br#"{"req":"start","node":"RC","npar":2,"pars":[3,12],"data":"physics"}"#,
        )
        .unwrap();
        assert_eq!(msg.request(), "START");
        assert_eq!(msg.node(), "RC");
        assert_eq!(msg.params(), &[3, 12]);
        assert_eq!(msg.param(1), Some(12));
        assert_eq!(msg.param(2), None);
        assert_eq!(msg.data(), "physics");
    }

    #[test]
    fn test_encode_then_decode_keeps_fields() {
        let msg = Message::new("load")
            .from_node("RUNCONTROL")
            .with_params(&[1, -2])
            .with_data("cfg");
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_negative_param_count_rejected() {
        let err = Message::decode(br#"{"req":"LOAD","npar":-1,"pars":[]}"#).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidParamCount(-1));
    }

    #[test]
    fn test_overflowing_param_count_rejected() {
        let err = Message::decode(br#"{"req":"LOAD","npar":100000,"pars":[]}"#).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidParamCount(100000));
    }

    #[test]
    fn test_param_count_mismatch_rejected() {
        let err = Message::decode(br#"{"req":"START","npar":3,"pars":[1,2]}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ParamCountMismatch {
                declared: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_param_out_of_i32_range_rejected() {
        let err =
            Message::decode(br#"{"req":"START","npar":1,"pars":[4294967296]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_empty_request_rejected() {
        let err = Message::decode(br#"{"req":"  ","npar":0}"#).unwrap_err();
        assert_eq!(err, ProtocolError::EmptyRequest);
        assert!(Message::new("").encode().is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Message::decode(b"\x00\x01not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_too_many_params_cannot_be_encoded() {
        let pars = vec![0; MAX_PARAMS + 1];
        let msg = Message::new("START").with_params(&pars);
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::InvalidParamCount(_))
        ));
    }
}
