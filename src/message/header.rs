use std::collections::BTreeMap;

use crate::codec::{read_string_list, required, write_string_list, Protocol, TType, ThriftStruct};
use crate::error::CodecError;

pub const EXTEN_DEST_ID: &str = "dest_id";
pub const EXTEN_CAPACITY: &str = "capacity";
pub const EXTEN_ORIGIN_ID: &str = "origin_id";

/// The wire-serialized sub-header that precedes every message body. Optional fields are
///  written only when set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseHeader {
    pub magic: i32,
    pub msg_name: String,
    pub nonce: Option<String>,
    pub session_id: Option<String>,
    /// hop node ids for source-routed unicast, the tail is closest to the destination
    pub path: Option<Vec<String>>,
    pub exten_info: Option<BTreeMap<String, String>>,
}

impl BaseHeader {
    pub fn new(magic: i32, msg_name: impl Into<String>) -> BaseHeader {
        BaseHeader {
            magic,
            msg_name: msg_name.into(),
            ..Default::default()
        }
    }

    /// the nonce, or an empty string if none is set
    pub fn nonce(&self) -> &str {
        self.nonce.as_deref().unwrap_or("")
    }

    pub fn path(&self) -> &[String] {
        self.path.as_deref().unwrap_or(&[])
    }

    pub fn exten(&self, key: &str) -> Option<&str> {
        self.exten_info.as_ref()
            .and_then(|m| m.get(key))
            .map(|s| s.as_str())
    }

    pub fn set_exten(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.exten_info.get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
    }

    pub fn dest_id(&self) -> Option<&str> {
        self.exten(EXTEN_DEST_ID)
    }
}

impl ThriftStruct for BaseHeader {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        proto.write_struct_begin("base_header")?;

        proto.write_field_begin("magic", TType::I32, 1)?;
        proto.write_i32(self.magic)?;
        proto.write_field_end()?;

        proto.write_field_begin("msg_name", TType::String, 2)?;
        proto.write_string(&self.msg_name)?;
        proto.write_field_end()?;

        if let Some(nonce) = &self.nonce {
            proto.write_field_begin("nonce", TType::String, 3)?;
            proto.write_string(nonce)?;
            proto.write_field_end()?;
        }
        if let Some(session_id) = &self.session_id {
            proto.write_field_begin("session_id", TType::String, 4)?;
            proto.write_string(session_id)?;
            proto.write_field_end()?;
        }
        if let Some(path) = &self.path {
            proto.write_field_begin("path", TType::List, 5)?;
            write_string_list(proto, path)?;
            proto.write_field_end()?;
        }
        if let Some(exten_info) = &self.exten_info {
            proto.write_field_begin("exten_info", TType::Map, 255)?;
            proto.write_map_begin(TType::String, TType::String, exten_info.len())?;
            for (k, v) in exten_info {
                proto.write_string(k)?;
                proto.write_string(v)?;
            }
            proto.write_map_end()?;
            proto.write_field_end()?;
        }

        proto.write_field_stop()?;
        proto.write_struct_end()
    }

    fn read(proto: &mut dyn Protocol) -> Result<BaseHeader, CodecError> {
        let mut magic = None;
        let mut msg_name = None;
        let mut result = BaseHeader::default();

        proto.read_struct_begin()?;
        loop {
            let field = proto.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (1, TType::I32) => magic = Some(proto.read_i32()?),
                (2, TType::String) => msg_name = Some(proto.read_string()?),
                (3, TType::String) => result.nonce = Some(proto.read_string()?),
                (4, TType::String) => result.session_id = Some(proto.read_string()?),
                (5, TType::List) => result.path = Some(read_string_list(proto)?),
                (255, TType::Map) => {
                    let header = proto.read_map_begin()?;
                    let mut exten_info = BTreeMap::new();
                    for _ in 0..header.size {
                        let k = proto.read_string()?;
                        let v = proto.read_string()?;
                        exten_info.insert(k, v);
                    }
                    proto.read_map_end()?;
                    result.exten_info = Some(exten_info);
                }
                (_, t) => proto.skip(t)?,
            }
            proto.read_field_end()?;
        }
        proto.read_struct_end()?;

        result.magic = required(magic, "base_header", "magic")?;
        result.msg_name = required(msg_name, "base_header", "msg_name")?;
        Ok(result)
    }
}
