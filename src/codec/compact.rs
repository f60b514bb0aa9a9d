use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::{FieldHeader, ListHeader, MapHeader, MessageBegin, MessageType, Protocol, ProtocolLimits, TType};
use crate::error::CodecError;
use crate::util::buf_ext::BufExt;

pub const PROTOCOL_ID: u8 = 0x82;
pub const VERSION_N: u8 = 1;
pub const VERSION_MASK: u8 = 0x1f;
pub const TYPE_MASK: u8 = 0xe0;
pub const TYPE_SHIFT_AMOUNT: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum CompactType {
    Stop = 0,
    BooleanTrue = 1,
    BooleanFalse = 2,
    Byte = 3,
    I16 = 4,
    I32 = 5,
    I64 = 6,
    Double = 7,
    Binary = 8,
    List = 9,
    Set = 10,
    Map = 11,
    Struct = 12,
}

impl CompactType {
    fn of(t: TType) -> CompactType {
        match t {
            TType::Stop => CompactType::Stop,
            TType::Bool => CompactType::BooleanTrue,
            TType::Byte => CompactType::Byte,
            TType::Double => CompactType::Double,
            TType::I16 => CompactType::I16,
            TType::I32 => CompactType::I32,
            TType::I64 => CompactType::I64,
            TType::String => CompactType::Binary,
            TType::Struct => CompactType::Struct,
            TType::Map => CompactType::Map,
            TType::Set => CompactType::Set,
            TType::List => CompactType::List,
        }
    }

    fn ttype(self) -> TType {
        match self {
            CompactType::Stop => TType::Stop,
            CompactType::BooleanTrue | CompactType::BooleanFalse => TType::Bool,
            CompactType::Byte => TType::Byte,
            CompactType::I16 => TType::I16,
            CompactType::I32 => TType::I32,
            CompactType::I64 => TType::I64,
            CompactType::Double => TType::Double,
            CompactType::Binary => TType::String,
            CompactType::List => TType::List,
            CompactType::Set => TType::Set,
            CompactType::Map => TType::Map,
            CompactType::Struct => TType::Struct,
        }
    }

    fn parse(raw: u8) -> Result<CompactType, CodecError> {
        CompactType::try_from(raw)
            .map_err(|_| CodecError::InvalidData(format!("unknown compact type {}", raw)))
    }

    fn code(self) -> u8 {
        self.into()
    }
}

fn i32_to_zigzag(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

fn zigzag_to_i32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

fn i64_to_zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn zigzag_to_i64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Thrift compact encoding: zigzag varints, field ids delta-encoded against the previous field
///  of the same struct, bool field values folded into the field header.
pub struct CompactProtocol<'a> {
    buf: &'a mut BytesMut,
    limits: ProtocolLimits,
    last_field_id: i16,
    last_field_id_stack: Vec<i16>,
    /// id of a bool field whose header is written together with its value
    pending_bool_field: Option<i16>,
    /// value of a bool field read from its field header
    pending_bool_value: Option<bool>,
}

impl <'a> CompactProtocol<'a> {
    pub fn new(buf: &'a mut BytesMut, limits: ProtocolLimits) -> CompactProtocol<'a> {
        CompactProtocol {
            buf,
            limits,
            last_field_id: 0,
            last_field_id_stack: Vec::new(),
            pending_bool_field: None,
            pending_bool_value: None,
        }
    }

    fn write_field_header(&mut self, compact_type: CompactType, id: i16) -> Result<(), CodecError> {
        let delta = id as i32 - self.last_field_id as i32;
        if delta > 0 && delta <= 15 {
            self.buf.put_u8(((delta as u8) << 4) | compact_type.code());
        }
        else {
            self.buf.put_u8(compact_type.code());
            self.write_i16(id)?;
        }
        self.last_field_id = id;
        Ok(())
    }

    fn write_collection_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError> {
        let elem = CompactType::of(elem_type).code();
        if size <= 14 {
            self.buf.put_u8(((size as u8) << 4) | elem);
        }
        else {
            self.buf.put_u8(0xf0 | elem);
            self.write_size(size)?;
        }
        Ok(())
    }

    fn write_size(&mut self, size: usize) -> Result<(), CodecError> {
        let size = i32::try_from(size)
            .map_err(|_| CodecError::SizeLimit { size, limit: i32::MAX as usize })?;
        self.buf.put_u32_varint(size as u32);
        Ok(())
    }

    fn read_size(&mut self) -> Result<i64, CodecError> {
        Ok(self.buf.checked_get_u32_varint()? as i32 as i64)
    }

    fn read_collection_begin(&mut self) -> Result<ListHeader, CodecError> {
        let size_and_type = self.buf.checked_get_u8()?;
        let mut size = ((size_and_type >> 4) & 0x0f) as i64;
        if size == 15 {
            size = self.read_size()?;
        }
        let size = self.limits.check_container(size)?;
        let elem_type = CompactType::parse(size_and_type & 0x0f)?.ttype();
        Ok(ListHeader { elem_type, size })
    }

    fn read_raw(&mut self, len: usize) -> Result<Bytes, CodecError> {
        self.buf.ensure_remaining(len)?;
        Ok(self.buf.split_to(len).freeze())
    }
}

impl Protocol for CompactProtocol<'_> {
    fn write_message_begin(&mut self, name: &str, message_type: MessageType, seq_id: i32) -> Result<(), CodecError> {
        self.buf.put_u8(PROTOCOL_ID);
        self.buf.put_u8((VERSION_N & VERSION_MASK) | ((u8::from(message_type) << TYPE_SHIFT_AMOUNT) & TYPE_MASK));
        self.buf.put_u32_varint(seq_id as u32);
        self.write_string(name)
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<(), CodecError> {
        self.last_field_id_stack.push(self.last_field_id);
        self.last_field_id = 0;
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<(), CodecError> {
        self.last_field_id = self.last_field_id_stack.pop()
            .ok_or_else(|| CodecError::InvalidData("struct end without struct begin".to_string()))?;
        Ok(())
    }

    fn write_field_begin(&mut self, _name: &str, field_type: TType, id: i16) -> Result<(), CodecError> {
        if field_type == TType::Bool {
            self.pending_bool_field = Some(id);
            return Ok(());
        }
        self.write_field_header(CompactType::of(field_type), id)
    }

    fn write_field_stop(&mut self) -> Result<(), CodecError> {
        self.buf.put_u8(CompactType::Stop.code());
        Ok(())
    }

    fn write_map_begin(&mut self, key_type: TType, value_type: TType, size: usize) -> Result<(), CodecError> {
        if size == 0 {
            self.buf.put_u8(0);
        }
        else {
            self.write_size(size)?;
            self.buf.put_u8((CompactType::of(key_type).code() << 4) | CompactType::of(value_type).code());
        }
        Ok(())
    }

    fn write_list_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError> {
        self.write_collection_begin(elem_type, size)
    }

    fn write_set_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError> {
        self.write_collection_begin(elem_type, size)
    }

    fn write_bool(&mut self, v: bool) -> Result<(), CodecError> {
        let compact_type = if v { CompactType::BooleanTrue } else { CompactType::BooleanFalse };
        match self.pending_bool_field.take() {
            Some(id) => self.write_field_header(compact_type, id),
            None => {
                self.buf.put_u8(compact_type.code());
                Ok(())
            }
        }
    }

    fn write_byte(&mut self, v: i8) -> Result<(), CodecError> {
        self.buf.put_i8(v);
        Ok(())
    }

    fn write_i16(&mut self, v: i16) -> Result<(), CodecError> {
        self.buf.put_u32_varint(i32_to_zigzag(v as i32));
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.buf.put_u32_varint(i32_to_zigzag(v));
        Ok(())
    }

    fn write_i64(&mut self, v: i64) -> Result<(), CodecError> {
        self.buf.put_u64_varint(i64_to_zigzag(v));
        Ok(())
    }

    fn write_double(&mut self, v: f64) -> Result<(), CodecError> {
        self.buf.put_f64_le(v);
        Ok(())
    }

    fn write_binary(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.write_size(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    fn read_message_begin(&mut self) -> Result<MessageBegin, CodecError> {
        let protocol_id = self.buf.checked_get_u8()?;
        if protocol_id != PROTOCOL_ID {
            return Err(CodecError::InvalidData(format!("expected compact protocol id {:#x}, got {:#x}", PROTOCOL_ID, protocol_id)));
        }

        let version_and_type = self.buf.checked_get_u8()?;
        let version = version_and_type & VERSION_MASK;
        if version != VERSION_N {
            return Err(CodecError::BadVersion(version as u32));
        }

        let raw_type = (version_and_type >> TYPE_SHIFT_AMOUNT) & 0x07;
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| CodecError::InvalidData(format!("unknown message type {}", raw_type)))?;
        let seq_id = self.buf.checked_get_u32_varint()? as i32;
        let name = self.read_string()?;
        Ok(MessageBegin { name, message_type, seq_id })
    }

    fn read_struct_begin(&mut self) -> Result<(), CodecError> {
        self.last_field_id_stack.push(self.last_field_id);
        self.last_field_id = 0;
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<(), CodecError> {
        self.last_field_id = self.last_field_id_stack.pop()
            .ok_or_else(|| CodecError::InvalidData("struct end without struct begin".to_string()))?;
        Ok(())
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader, CodecError> {
        let raw = self.buf.checked_get_u8()?;
        let compact_type = CompactType::parse(raw & 0x0f)?;
        if compact_type == CompactType::Stop {
            return Ok(FieldHeader { field_type: TType::Stop, id: 0 });
        }

        let modifier = (raw >> 4) as i16;
        let id = if modifier == 0 {
            self.read_i16()?
        }
        else {
            self.last_field_id.checked_add(modifier)
                .ok_or_else(|| CodecError::InvalidData("field id overflow".to_string()))?
        };

        match compact_type {
            CompactType::BooleanTrue => self.pending_bool_value = Some(true),
            CompactType::BooleanFalse => self.pending_bool_value = Some(false),
            _ => {}
        }

        self.last_field_id = id;
        Ok(FieldHeader { field_type: compact_type.ttype(), id })
    }

    fn read_map_begin(&mut self) -> Result<MapHeader, CodecError> {
        let size = self.read_size()?;
        let size = self.limits.check_container(size)?;
        let key_and_value = if size == 0 { 0 } else { self.buf.checked_get_u8()? };
        Ok(MapHeader {
            key_type: CompactType::parse(key_and_value >> 4)?.ttype(),
            value_type: CompactType::parse(key_and_value & 0x0f)?.ttype(),
            size,
        })
    }

    fn read_list_begin(&mut self) -> Result<ListHeader, CodecError> {
        self.read_collection_begin()
    }

    fn read_set_begin(&mut self) -> Result<ListHeader, CodecError> {
        self.read_collection_begin()
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        if let Some(v) = self.pending_bool_value.take() {
            return Ok(v);
        }
        Ok(self.buf.checked_get_u8()? == CompactType::BooleanTrue.code())
    }

    fn read_byte(&mut self) -> Result<i8, CodecError> {
        self.buf.checked_get_i8()
    }

    fn read_i16(&mut self) -> Result<i16, CodecError> {
        let v = zigzag_to_i32(self.buf.checked_get_u32_varint()?);
        i16::try_from(v)
            .map_err(|_| CodecError::InvalidData(format!("{} is out of i16 range", v)))
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(zigzag_to_i32(self.buf.checked_get_u32_varint()?))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(zigzag_to_i64(self.buf.checked_get_u64_varint()?))
    }

    fn read_double(&mut self) -> Result<f64, CodecError> {
        self.buf.checked_get_f64_le()
    }

    fn read_binary(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_size()?;
        let len = self.limits.check_string(len)?;
        self.read_raw(len)
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn append_raw(&mut self, raw: &[u8]) {
        self.buf.put_slice(raw);
    }

    fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn proto(buf: &mut BytesMut) -> CompactProtocol {
        CompactProtocol::new(buf, ProtocolLimits { string_limit: 16, container_limit: 20 })
    }

    #[rstest]
    #[case::zero(0, 0)]
    #[case::minus_one(-1, 1)]
    #[case::one(1, 2)]
    #[case::minus_two(-2, 3)]
    #[case::max(i32::MAX, u32::MAX - 1)]
    #[case::min(i32::MIN, u32::MAX)]
    fn test_zigzag32(#[case] n: i32, #[case] encoded: u32) {
        assert_eq!(i32_to_zigzag(n), encoded);
        assert_eq!(zigzag_to_i32(encoded), n);
    }

    #[test]
    fn test_zigzag64_extremes() {
        assert_eq!(i64_to_zigzag(i64::MIN), u64::MAX);
        assert_eq!(zigzag_to_i64(u64::MAX), i64::MIN);
        assert_eq!(zigzag_to_i64(i64_to_zigzag(-123456789012)), -123456789012);
    }

    #[test]
    fn test_field_ids_are_delta_encoded() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_struct_begin("s").unwrap();
            p.write_field_begin("a", TType::I32, 1).unwrap();
            p.write_i32(-1).unwrap();
            p.write_field_begin("b", TType::I32, 5).unwrap();
            p.write_i32(1).unwrap();
            p.write_field_begin("c", TType::String, 255).unwrap();
            p.write_string("").unwrap();
            p.write_field_stop().unwrap();
            p.write_struct_end().unwrap();
        }
        // delta 1 | I32, zigzag(-1); delta 4 | I32, zigzag(1); long form: BINARY, zigzag varint 255, len 0; stop
        assert_eq!(&buf[..], &[0x15, 0x01, 0x45, 0x02, 0x08, 0xfe, 0x03, 0x00, 0x00]);

        let mut p = proto(&mut buf);
        p.read_struct_begin().unwrap();
        assert_eq!(p.read_field_begin().unwrap(), FieldHeader { field_type: TType::I32, id: 1 });
        assert_eq!(p.read_i32().unwrap(), -1);
        assert_eq!(p.read_field_begin().unwrap(), FieldHeader { field_type: TType::I32, id: 5 });
        assert_eq!(p.read_i32().unwrap(), 1);
        assert_eq!(p.read_field_begin().unwrap(), FieldHeader { field_type: TType::String, id: 255 });
        assert_eq!(p.read_string().unwrap(), "");
        assert_eq!(p.read_field_begin().unwrap().field_type, TType::Stop);
        p.read_struct_end().unwrap();
    }

    #[test]
    fn test_nested_structs_restore_last_field_id() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_struct_begin("outer").unwrap();
            p.write_field_begin("inner", TType::Struct, 3).unwrap();
            p.write_struct_begin("inner").unwrap();
            p.write_field_begin("x", TType::Byte, 10).unwrap();
            p.write_byte(9).unwrap();
            p.write_field_stop().unwrap();
            p.write_struct_end().unwrap();
            p.write_field_begin("y", TType::Byte, 4).unwrap();
            p.write_byte(8).unwrap();
            p.write_field_stop().unwrap();
            p.write_struct_end().unwrap();
        }
        // field 4 follows field 3 of the outer struct, so it is a one-byte delta header
        assert_eq!(&buf[..], &[0x3c, 0xa3, 9, 0x00, 0x13, 8, 0x00]);

        let mut p = proto(&mut buf);
        p.read_struct_begin().unwrap();
        assert_eq!(p.read_field_begin().unwrap().id, 3);
        p.read_struct_begin().unwrap();
        assert_eq!(p.read_field_begin().unwrap().id, 10);
        assert_eq!(p.read_byte().unwrap(), 9);
        assert_eq!(p.read_field_begin().unwrap().field_type, TType::Stop);
        p.read_struct_end().unwrap();
        assert_eq!(p.read_field_begin().unwrap(), FieldHeader { field_type: TType::Byte, id: 4 });
        assert_eq!(p.read_byte().unwrap(), 8);
    }

    #[test]
    fn test_bool_fields_are_folded_into_header() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_struct_begin("s").unwrap();
            p.write_field_begin("t", TType::Bool, 1).unwrap();
            p.write_bool(true).unwrap();
            p.write_field_begin("f", TType::Bool, 2).unwrap();
            p.write_bool(false).unwrap();
            p.write_field_stop().unwrap();
            p.write_struct_end().unwrap();
            // outside of a field header a bool is a byte of its own
            p.write_bool(true).unwrap();
        }
        assert_eq!(&buf[..], &[0x11, 0x12, 0x00, 0x01]);

        let mut p = proto(&mut buf);
        p.read_struct_begin().unwrap();
        assert_eq!(p.read_field_begin().unwrap().field_type, TType::Bool);
        assert!(p.read_bool().unwrap());
        p.read_field_begin().unwrap();
        assert!(!p.read_bool().unwrap());
        p.read_field_begin().unwrap();
        p.read_struct_end().unwrap();
        assert!(p.read_bool().unwrap());
    }

    #[rstest]
    #[case::short_list(3, &[0x35])]
    #[case::empty_list(0, &[0x05])]
    #[case::long_list(15, &[0xf5, 15])]
    fn test_list_header(#[case] size: usize, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        proto(&mut buf).write_list_begin(TType::I32, size).unwrap();
        assert_eq!(&buf[..], expected);
        assert_eq!(proto(&mut buf).read_list_begin().unwrap(), ListHeader { elem_type: TType::I32, size });
    }

    #[test]
    fn test_map_header() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_map_begin(TType::String, TType::I64, 2).unwrap();
            p.write_map_begin(TType::String, TType::I64, 0).unwrap();
        }
        assert_eq!(&buf[..], &[0x02, 0x86, 0x00]);

        let mut p = proto(&mut buf);
        assert_eq!(p.read_map_begin().unwrap(), MapHeader { key_type: TType::String, value_type: TType::I64, size: 2 });
        assert_eq!(p.read_map_begin().unwrap().size, 0);
    }

    #[test]
    fn test_primitive_values() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_i16(i16::MIN).unwrap();
            p.write_i64(i64::MAX).unwrap();
            p.write_double(1.5).unwrap();
            p.write_byte(-1).unwrap();
            p.write_binary(&[1, 2, 3]).unwrap();
        }

        let mut p = proto(&mut buf);
        assert_eq!(p.read_i16().unwrap(), i16::MIN);
        assert_eq!(p.read_i64().unwrap(), i64::MAX);
        assert_eq!(p.read_double().unwrap(), 1.5);
        assert_eq!(p.read_byte().unwrap(), -1);
        assert_eq!(&p.read_binary().unwrap()[..], &[1, 2, 3]);
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn test_i16_out_of_range() {
        let mut buf = BytesMut::new();
        proto(&mut buf).write_i32(70000).unwrap();
        assert!(matches!(proto(&mut buf).read_i16(), Err(CodecError::InvalidData(_))));
    }

    #[rstest]
    #[case::string(TType::String)]
    #[case::list(TType::List)]
    #[case::map(TType::Map)]
    fn test_size_guards(#[case] kind: TType) {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            match kind {
                TType::String => p.write_string(&"z".repeat(17)).unwrap(),
                TType::List => p.write_list_begin(TType::Byte, 21).unwrap(),
                _ => p.write_map_begin(TType::Byte, TType::Byte, 21).unwrap(),
            }
        }

        let mut p = proto(&mut buf);
        let result = match kind {
            TType::String => p.read_string().map(|_| ()),
            TType::List => p.read_list_begin().map(|_| ()),
            _ => p.read_map_begin().map(|_| ()),
        };
        assert!(matches!(result, Err(CodecError::SizeLimit { .. })));
    }

    #[test]
    fn test_message_begin() {
        let mut buf = BytesMut::new();
        proto(&mut buf).write_message_begin("ping", MessageType::Reply, 300).unwrap();
        assert_eq!(&buf[..2], &[0x82, 0x41]);

        let begin = proto(&mut buf).read_message_begin().unwrap();
        assert_eq!(begin, MessageBegin { name: "ping".to_string(), message_type: MessageType::Reply, seq_id: 300 });
    }

    #[test]
    fn test_message_begin_rejects_foreign_protocol() {
        let mut buf = BytesMut::from(&[0x80u8, 0x01, 0, 1][..]);
        assert!(matches!(proto(&mut buf).read_message_begin(), Err(CodecError::InvalidData(_))));
    }
}
