use crate::codec::{required, Protocol, TType, ThriftStruct};
use crate::error::CodecError;

pub const VER_REQ: &str = "ver_req";
pub const VER_RESP: &str = "ver_resp";
pub const SHAKE_HAND_REQ: &str = "shake_hand_req";
pub const SHAKE_HAND_RESP: &str = "shake_hand_resp";

pub const CORE_VERSION: i32 = 0x0001_0000;
pub const PROTOCOL_VERSION: i32 = 0x0001_0000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAddress {
    pub ip: String,
    pub port: i32,
}

impl ThriftStruct for NetworkAddress {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        proto.write_struct_begin("network_address")?;
        proto.write_field_begin("ip", TType::String, 1)?;
        proto.write_string(&self.ip)?;
        proto.write_field_end()?;
        proto.write_field_begin("port", TType::I32, 2)?;
        proto.write_i32(self.port)?;
        proto.write_field_end()?;
        proto.write_field_stop()?;
        proto.write_struct_end()
    }

    fn read(proto: &mut dyn Protocol) -> Result<NetworkAddress, CodecError> {
        let mut result = NetworkAddress::default();
        proto.read_struct_begin()?;
        loop {
            let field = proto.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (1, TType::String) => result.ip = proto.read_string()?,
                (2, TType::I32) => result.port = proto.read_i32()?,
                (_, t) => proto.skip(t)?,
            }
            proto.read_field_end()?;
        }
        proto.read_struct_end()?;
        Ok(result)
    }
}

/// Login request, sent by the connecting side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerReq {
    pub node_id: String,
    pub core_version: i32,
    pub protocol_version: i32,
    pub time_stamp: i64,
    pub addr_me: NetworkAddress,
    pub addr_you: NetworkAddress,
    pub start_height: i64,
}

impl ThriftStruct for VerReq {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        proto.write_struct_begin("ver_req_body")?;
        proto.write_field_begin("node_id", TType::String, 1)?;
        proto.write_string(&self.node_id)?;
        proto.write_field_end()?;
        proto.write_field_begin("core_version", TType::I32, 2)?;
        proto.write_i32(self.core_version)?;
        proto.write_field_end()?;
        proto.write_field_begin("protocol_version", TType::I32, 3)?;
        proto.write_i32(self.protocol_version)?;
        proto.write_field_end()?;
        proto.write_field_begin("time_stamp", TType::I64, 4)?;
        proto.write_i64(self.time_stamp)?;
        proto.write_field_end()?;
        proto.write_field_begin("addr_me", TType::Struct, 5)?;
        self.addr_me.write(proto)?;
        proto.write_field_end()?;
        proto.write_field_begin("addr_you", TType::Struct, 6)?;
        self.addr_you.write(proto)?;
        proto.write_field_end()?;
        proto.write_field_begin("start_height", TType::I64, 7)?;
        proto.write_i64(self.start_height)?;
        proto.write_field_end()?;
        proto.write_field_stop()?;
        proto.write_struct_end()
    }

    fn read(proto: &mut dyn Protocol) -> Result<VerReq, CodecError> {
        let mut node_id = None;
        let mut result = VerReq::default();
        proto.read_struct_begin()?;
        loop {
            let field = proto.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (1, TType::String) => node_id = Some(proto.read_string()?),
                (2, TType::I32) => result.core_version = proto.read_i32()?,
                (3, TType::I32) => result.protocol_version = proto.read_i32()?,
                (4, TType::I64) => result.time_stamp = proto.read_i64()?,
                (5, TType::Struct) => result.addr_me = NetworkAddress::read(proto)?,
                (6, TType::Struct) => result.addr_you = NetworkAddress::read(proto)?,
                (7, TType::I64) => result.start_height = proto.read_i64()?,
                (_, t) => proto.skip(t)?,
            }
            proto.read_field_end()?;
        }
        proto.read_struct_end()?;
        result.node_id = required(node_id, "ver_req_body", "node_id")?;
        Ok(result)
    }
}

/// Login response, sent by the accepting side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerResp {
    pub node_id: String,
    pub core_version: i32,
    pub protocol_version: i32,
}

impl ThriftStruct for VerResp {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        proto.write_struct_begin("ver_resp_body")?;
        proto.write_field_begin("node_id", TType::String, 1)?;
        proto.write_string(&self.node_id)?;
        proto.write_field_end()?;
        proto.write_field_begin("core_version", TType::I32, 2)?;
        proto.write_i32(self.core_version)?;
        proto.write_field_end()?;
        proto.write_field_begin("protocol_version", TType::I32, 3)?;
        proto.write_i32(self.protocol_version)?;
        proto.write_field_end()?;
        proto.write_field_stop()?;
        proto.write_struct_end()
    }

    fn read(proto: &mut dyn Protocol) -> Result<VerResp, CodecError> {
        let mut node_id = None;
        let mut result = VerResp::default();
        proto.read_struct_begin()?;
        loop {
            let field = proto.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (1, TType::String) => node_id = Some(proto.read_string()?),
                (2, TType::I32) => result.core_version = proto.read_i32()?,
                (3, TType::I32) => result.protocol_version = proto.read_i32()?,
                (_, t) => proto.skip(t)?,
            }
            proto.read_field_end()?;
        }
        proto.read_struct_end()?;
        result.node_id = required(node_id, "ver_resp_body", "node_id")?;
        Ok(result)
    }
}

/// The connection-level messages every node understands. They never reach the invoker table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    VerReq(VerReq),
    VerResp(VerResp),
    ShakeHandReq,
    ShakeHandResp,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::VerReq(_) => VER_REQ,
            ControlMessage::VerResp(_) => VER_RESP,
            ControlMessage::ShakeHandReq => SHAKE_HAND_REQ,
            ControlMessage::ShakeHandResp => SHAKE_HAND_RESP,
        }
    }

    pub fn is_control_name(name: &str) -> bool {
        matches!(name, VER_REQ | VER_RESP | SHAKE_HAND_REQ | SHAKE_HAND_RESP)
    }

    pub fn write_body(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        match self {
            ControlMessage::VerReq(body) => body.write(proto),
            ControlMessage::VerResp(body) => body.write(proto),
            ControlMessage::ShakeHandReq | ControlMessage::ShakeHandResp => write_empty_body(proto),
        }
    }

    /// returns `None` for names that are not control messages
    pub fn read_body(name: &str, proto: &mut dyn Protocol) -> Result<Option<ControlMessage>, CodecError> {
        let msg = match name {
            VER_REQ => ControlMessage::VerReq(VerReq::read(proto)?),
            VER_RESP => ControlMessage::VerResp(VerResp::read(proto)?),
            SHAKE_HAND_REQ => {
                proto.skip(TType::Struct)?;
                ControlMessage::ShakeHandReq
            }
            SHAKE_HAND_RESP => {
                proto.skip(TType::Struct)?;
                ControlMessage::ShakeHandResp
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

fn write_empty_body(proto: &mut dyn Protocol) -> Result<(), CodecError> {
    proto.write_struct_begin("empty")?;
    proto.write_field_stop()?;
    proto.write_struct_end()
}
