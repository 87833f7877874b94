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

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Serialization;
use crate::protocol::{RpcInvocation, RpcResult};
use crate::{AppError, AppResult};

/// Result body shape tags. Which of the six applies depends on whether
/// the result carries a value, a caught exception, and attachments.
const RESPONSE_WITH_EXCEPTION: u8 = 0;
const RESPONSE_VALUE: u8 = 1;
const RESPONSE_NULL_VALUE: u8 = 2;
const RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS: u8 = 3;
const RESPONSE_VALUE_WITH_ATTACHMENTS: u8 = 4;
const RESPONSE_NULL_VALUE_WITH_ATTACHMENTS: u8 = 5;

/// Compact length-prefixed binary body format, wire id 2. Strings are
/// u16-length UTF-8, byte blobs are u32-length.
#[derive(Debug, Default)]
pub struct BinarySerialization;

impl Serialization for BinarySerialization {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn content_type_id(&self) -> u8 {
        2
    }

    fn encode_invocation(&self, invocation: &RpcInvocation, buf: &mut BytesMut) -> AppResult<()> {
        put_string(&invocation.service, buf)?;
        put_string(&invocation.method, buf)?;
        put_string(&invocation.parameter_desc, buf)?;
        buf.put_u32(invocation.arguments.len() as u32);
        for argument in &invocation.arguments {
            put_bytes(argument, buf);
        }
        put_attachments(&invocation.attachments, buf)?;
        Ok(())
    }

    fn decode_invocation(&self, buf: &mut BytesMut) -> AppResult<RpcInvocation> {
        let service = get_string(buf)?;
        let method = get_string(buf)?;
        let parameter_desc = get_string(buf)?;
        let argument_count = get_u32(buf)? as usize;
        let mut arguments = Vec::with_capacity(argument_count.min(64));
        for _ in 0..argument_count {
            arguments.push(get_bytes(buf)?);
        }
        let attachments = get_attachments(buf)?;
        Ok(RpcInvocation {
            service,
            method,
            parameter_desc,
            arguments,
            attachments,
        })
    }

    fn encode_result(&self, result: &RpcResult, buf: &mut BytesMut) -> AppResult<()> {
        let with_attachments = !result.attachments.is_empty();
        match (&result.exception, &result.value) {
            (Some(exception), _) => {
                buf.put_u8(if with_attachments {
                    RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS
                } else {
                    RESPONSE_WITH_EXCEPTION
                });
                put_string(exception, buf)?;
            }
            (None, Some(value)) => {
                buf.put_u8(if with_attachments {
                    RESPONSE_VALUE_WITH_ATTACHMENTS
                } else {
                    RESPONSE_VALUE
                });
                put_bytes(value, buf);
            }
            (None, None) => {
                buf.put_u8(if with_attachments {
                    RESPONSE_NULL_VALUE_WITH_ATTACHMENTS
                } else {
                    RESPONSE_NULL_VALUE
                });
            }
        }
        if with_attachments {
            put_attachments(&result.attachments, buf)?;
        }
        Ok(())
    }

    fn decode_result(&self, buf: &mut BytesMut) -> AppResult<RpcResult> {
        let tag = get_u8(buf)?;
        let mut result = RpcResult::default();
        let with_attachments = match tag {
            RESPONSE_WITH_EXCEPTION | RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS => {
                result.exception = Some(get_string(buf)?);
                tag == RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS
            }
            RESPONSE_VALUE | RESPONSE_VALUE_WITH_ATTACHMENTS => {
                result.value = Some(get_bytes(buf)?);
                tag == RESPONSE_VALUE_WITH_ATTACHMENTS
            }
            RESPONSE_NULL_VALUE | RESPONSE_NULL_VALUE_WITH_ATTACHMENTS => {
                tag == RESPONSE_NULL_VALUE_WITH_ATTACHMENTS
            }
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown result shape tag {}",
                    other
                )))
            }
        };
        if with_attachments {
            result.attachments = get_attachments(buf)?;
        }
        Ok(result)
    }
}

fn put_string(value: &str, buf: &mut BytesMut) -> AppResult<()> {
    if value.len() > u16::MAX as usize {
        return Err(AppError::InvalidValue(format!(
            "string of {} bytes exceeds the u16 length prefix",
            value.len()
        )));
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut BytesMut) -> AppResult<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(AppError::MalformedProtocol(format!(
            "string of {} bytes declared but only {} available",
            len,
            buf.remaining()
        )));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("string is not valid UTF-8: {}", e)))
}

fn put_bytes(value: &Bytes, buf: &mut BytesMut) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn get_bytes(buf: &mut BytesMut) -> AppResult<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(AppError::MalformedProtocol(format!(
            "byte blob of {} bytes declared but only {} available",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len).freeze())
}

fn put_attachments(attachments: &HashMap<String, String>, buf: &mut BytesMut) -> AppResult<()> {
    buf.put_u32(attachments.len() as u32);
    for (key, value) in attachments {
        put_string(key, buf)?;
        put_string(value, buf)?;
    }
    Ok(())
}

fn get_attachments(buf: &mut BytesMut) -> AppResult<HashMap<String, String>> {
    let count = get_u32(buf)? as usize;
    let mut attachments = HashMap::with_capacity(count.min(64));
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_string(buf)?;
        attachments.insert(key, value);
    }
    Ok(attachments)
}

fn get_u8(buf: &mut BytesMut) -> AppResult<u8> {
    if buf.remaining() < 1 {
        return Err(AppError::MalformedProtocol("can not read a u8".to_string()));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut BytesMut) -> AppResult<u16> {
    if buf.remaining() < 2 {
        return Err(AppError::MalformedProtocol("can not read a u16".to_string()));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut BytesMut) -> AppResult<u32> {
    if buf.remaining() < 4 {
        return Err(AppError::MalformedProtocol("can not read a u32".to_string()));
    }
    Ok(buf.get_u32())
}
