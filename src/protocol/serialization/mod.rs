// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use binary::BinarySerialization;

mod binary;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use bytes::BytesMut;

use crate::protocol::{RpcInvocation, RpcResult};
use crate::{AppError, AppResult};

/// Byte-level codec for request and response bodies. The exchange layer
/// only needs this contract, the concrete format is selected by name in
/// the configuration and carried on the wire as a 5-bit id in the flag
/// byte.
pub trait Serialization: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Wire id, must fit in 5 bits.
    fn content_type_id(&self) -> u8;

    fn encode_invocation(&self, invocation: &RpcInvocation, buf: &mut BytesMut) -> AppResult<()>;

    fn decode_invocation(&self, buf: &mut BytesMut) -> AppResult<RpcInvocation>;

    fn encode_result(&self, result: &RpcResult, buf: &mut BytesMut) -> AppResult<()>;

    fn decode_result(&self, buf: &mut BytesMut) -> AppResult<RpcResult>;
}

/// String name and wire id lookup for body serializations. Populated
/// once at startup and shared read-only afterwards, the compact binary
/// format is always registered.
#[derive(Debug)]
pub struct SerializationRegistry {
    by_name: HashMap<String, Arc<dyn Serialization>>,
    by_id: HashMap<u8, Arc<dyn Serialization>>,
}

impl SerializationRegistry {
    pub fn new() -> SerializationRegistry {
        let mut registry = SerializationRegistry {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        };
        registry
            .register(Arc::new(BinarySerialization))
            .expect("builtin serialization id is valid");
        registry
    }

    pub fn register(&mut self, serialization: Arc<dyn Serialization>) -> AppResult<()> {
        let id = serialization.content_type_id();
        if id > 0x1f {
            return Err(AppError::InvalidValue(format!(
                "serialization id {} of {} does not fit in 5 bits",
                id,
                serialization.name()
            )));
        }
        if self.by_id.contains_key(&id) {
            return Err(AppError::InvalidValue(format!(
                "serialization id {} is already registered",
                id
            )));
        }
        self.by_name
            .insert(serialization.name().to_string(), serialization.clone());
        self.by_id.insert(id, serialization);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> AppResult<Arc<dyn Serialization>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::InvalidValue(format!("unknown serialization name: {}", name)))
    }

    pub fn by_id(&self, id: u8) -> AppResult<Arc<dyn Serialization>> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::MalformedProtocol(format!("unknown serialization id: {}", id)))
    }
}

impl Default for SerializationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
