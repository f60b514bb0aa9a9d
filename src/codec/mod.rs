//! Thrift-compatible serialization. [`Protocol`] is the abstract write/read interface that the
//!  two wire encodings ([`binary::BinaryProtocol`], [`compact::CompactProtocol`]) implement.
//!
//! A protocol binds to a caller-owned [`BytesMut`]: writes append at the end, reads consume
//!  from the front.

pub mod binary;
pub mod compact;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::CodecError;

/// Maximum struct / container nesting that `skip` follows before giving up
pub const MAX_SKIP_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

/// The serialization selected by the low byte of a packet's `protocol_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolKind {
    Binary = 0,
    Compact = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolLimits {
    /// maximum length of a string or binary, 0 for no limit
    pub string_limit: usize,
    /// maximum element count of a map, list or set, 0 for no limit
    pub container_limit: usize,
}

impl ProtocolLimits {
    pub fn unlimited() -> ProtocolLimits {
        ProtocolLimits {
            string_limit: 0,
            container_limit: 0,
        }
    }

    pub fn check_string(&self, size: i64) -> Result<usize, CodecError> {
        Self::check(size, self.string_limit)
    }

    pub fn check_container(&self, size: i64) -> Result<usize, CodecError> {
        Self::check(size, self.container_limit)
    }

    fn check(size: i64, limit: usize) -> Result<usize, CodecError> {
        if size < 0 {
            return Err(CodecError::NegativeSize(size));
        }
        let size = size as usize;
        if limit > 0 && size > limit {
            return Err(CodecError::SizeLimit { size, limit });
        }
        Ok(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub field_type: TType,
    pub id: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub key_type: TType,
    pub value_type: TType,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    pub elem_type: TType,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBegin {
    pub name: String,
    pub message_type: MessageType,
    pub seq_id: i32,
}

pub trait Protocol {
    fn write_message_begin(&mut self, name: &str, message_type: MessageType, seq_id: i32) -> Result<(), CodecError>;
    fn write_message_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn write_struct_begin(&mut self, name: &str) -> Result<(), CodecError>;
    fn write_struct_end(&mut self) -> Result<(), CodecError>;
    fn write_field_begin(&mut self, name: &str, field_type: TType, id: i16) -> Result<(), CodecError>;
    fn write_field_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn write_field_stop(&mut self) -> Result<(), CodecError>;
    fn write_map_begin(&mut self, key_type: TType, value_type: TType, size: usize) -> Result<(), CodecError>;
    fn write_map_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn write_list_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError>;
    fn write_list_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn write_set_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError>;
    fn write_set_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn write_bool(&mut self, v: bool) -> Result<(), CodecError>;
    fn write_byte(&mut self, v: i8) -> Result<(), CodecError>;
    fn write_i16(&mut self, v: i16) -> Result<(), CodecError>;
    fn write_i32(&mut self, v: i32) -> Result<(), CodecError>;
    fn write_i64(&mut self, v: i64) -> Result<(), CodecError>;
    fn write_double(&mut self, v: f64) -> Result<(), CodecError>;
    fn write_string(&mut self, v: &str) -> Result<(), CodecError> {
        self.write_binary(v.as_bytes())
    }
    fn write_binary(&mut self, v: &[u8]) -> Result<(), CodecError>;

    fn read_message_begin(&mut self) -> Result<MessageBegin, CodecError>;
    fn read_message_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn read_struct_begin(&mut self) -> Result<(), CodecError>;
    fn read_struct_end(&mut self) -> Result<(), CodecError>;
    fn read_field_begin(&mut self) -> Result<FieldHeader, CodecError>;
    fn read_field_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn read_map_begin(&mut self) -> Result<MapHeader, CodecError>;
    fn read_map_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn read_list_begin(&mut self) -> Result<ListHeader, CodecError>;
    fn read_list_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn read_set_begin(&mut self) -> Result<ListHeader, CodecError>;
    fn read_set_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn read_bool(&mut self) -> Result<bool, CodecError>;
    fn read_byte(&mut self) -> Result<i8, CodecError>;
    fn read_i16(&mut self) -> Result<i16, CodecError>;
    fn read_i32(&mut self) -> Result<i32, CodecError>;
    fn read_i64(&mut self) -> Result<i64, CodecError>;
    fn read_double(&mut self) -> Result<f64, CodecError>;
    fn read_string(&mut self) -> Result<String, CodecError> {
        let raw = self.read_binary()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| CodecError::InvalidData(format!("string is not utf-8: {}", e)))
    }
    fn read_binary(&mut self) -> Result<Bytes, CodecError>;

    /// number of unread bytes in the bound buffer
    fn remaining(&self) -> usize;
    /// copies pre-encoded bytes to the end of the bound buffer
    fn append_raw(&mut self, raw: &[u8]);
    /// consumes and returns all unread bytes of the bound buffer
    fn take_remaining(&mut self) -> Bytes;

    /// Reads and discards a value of the given type, e.g. a field this build does not know
    fn skip(&mut self, field_type: TType) -> Result<(), CodecError> {
        skip_value(self, field_type, MAX_SKIP_DEPTH)
    }
}

fn skip_value<P: Protocol + ?Sized>(proto: &mut P, field_type: TType, depth: usize) -> Result<(), CodecError> {
    if depth == 0 {
        return Err(CodecError::DepthLimit(MAX_SKIP_DEPTH));
    }

    match field_type {
        TType::Stop => Err(CodecError::InvalidData("cannot skip a STOP value".to_string())),
        TType::Bool => proto.read_bool().map(|_| ()),
        TType::Byte => proto.read_byte().map(|_| ()),
        TType::Double => proto.read_double().map(|_| ()),
        TType::I16 => proto.read_i16().map(|_| ()),
        TType::I32 => proto.read_i32().map(|_| ()),
        TType::I64 => proto.read_i64().map(|_| ()),
        TType::String => proto.read_binary().map(|_| ()),
        TType::Struct => {
            proto.read_struct_begin()?;
            loop {
                let field = proto.read_field_begin()?;
                if field.field_type == TType::Stop {
                    break;
                }
                skip_value(proto, field.field_type, depth - 1)?;
                proto.read_field_end()?;
            }
            proto.read_struct_end()
        }
        TType::Map => {
            let header = proto.read_map_begin()?;
            for _ in 0..header.size {
                skip_value(proto, header.key_type, depth - 1)?;
                skip_value(proto, header.value_type, depth - 1)?;
            }
            proto.read_map_end()
        }
        TType::Set => {
            let header = proto.read_set_begin()?;
            for _ in 0..header.size {
                skip_value(proto, header.elem_type, depth - 1)?;
            }
            proto.read_set_end()
        }
        TType::List => {
            let header = proto.read_list_begin()?;
            for _ in 0..header.size {
                skip_value(proto, header.elem_type, depth - 1)?;
            }
            proto.read_list_end()
        }
    }
}

/// A Thrift struct with a fixed schema, (de)serialized field by field
pub trait ThriftStruct: Sized {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError>;
    fn read(proto: &mut dyn Protocol) -> Result<Self, CodecError>;
}

/// Reads a `list<string>` field value
pub fn read_string_list(proto: &mut dyn Protocol) -> Result<Vec<String>, CodecError> {
    let header = proto.read_list_begin()?;
    let mut result = Vec::with_capacity(header.size.min(proto.remaining()));
    for _ in 0..header.size {
        result.push(proto.read_string()?);
    }
    proto.read_list_end()?;
    Ok(result)
}

pub fn write_string_list(proto: &mut dyn Protocol, values: &[String]) -> Result<(), CodecError> {
    proto.write_list_begin(TType::String, values.len())?;
    for v in values {
        proto.write_string(v)?;
    }
    proto.write_list_end()
}

/// the value of a required field, or an error naming the missing field
pub fn required<T>(value: Option<T>, struct_name: &str, field_name: &str) -> Result<T, CodecError> {
    value.ok_or_else(|| CodecError::InvalidData(format!("required field {}.{} is missing", struct_name, field_name)))
}
