use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{FieldHeader, ListHeader, MapHeader, MessageBegin, MessageType, Protocol, ProtocolLimits, TType};
use crate::error::CodecError;
use crate::util::buf_ext::BufExt;

pub const VERSION_1: u32 = 0x8001_0000;
pub const VERSION_MASK: u32 = 0xffff_0000;

/// Thrift binary encoding: fixed-width big-endian integers, `i32` length prefixes.
pub struct BinaryProtocol<'a> {
    buf: &'a mut BytesMut,
    limits: ProtocolLimits,
}

impl <'a> BinaryProtocol<'a> {
    pub fn new(buf: &'a mut BytesMut, limits: ProtocolLimits) -> BinaryProtocol<'a> {
        BinaryProtocol { buf, limits }
    }

    fn read_type(&mut self) -> Result<TType, CodecError> {
        let raw = self.buf.checked_get_u8()?;
        TType::try_from(raw)
            .map_err(|_| CodecError::InvalidData(format!("unknown field type {}", raw)))
    }

    fn write_size(&mut self, size: usize) -> Result<(), CodecError> {
        let size = i32::try_from(size)
            .map_err(|_| CodecError::SizeLimit { size, limit: i32::MAX as usize })?;
        self.buf.put_i32(size);
        Ok(())
    }

    fn read_raw(&mut self, len: usize) -> Result<Bytes, CodecError> {
        self.buf.ensure_remaining(len)?;
        Ok(self.buf.split_to(len).freeze())
    }
}

impl Protocol for BinaryProtocol<'_> {
    fn write_message_begin(&mut self, name: &str, message_type: MessageType, seq_id: i32) -> Result<(), CodecError> {
        self.buf.put_u32(VERSION_1 | u8::from(message_type) as u32);
        self.write_string(name)?;
        self.buf.put_i32(seq_id);
        Ok(())
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<(), CodecError> {
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn write_field_begin(&mut self, _name: &str, field_type: TType, id: i16) -> Result<(), CodecError> {
        self.buf.put_u8(field_type.into());
        self.buf.put_i16(id);
        Ok(())
    }

    fn write_field_stop(&mut self) -> Result<(), CodecError> {
        self.buf.put_u8(TType::Stop.into());
        Ok(())
    }

    fn write_map_begin(&mut self, key_type: TType, value_type: TType, size: usize) -> Result<(), CodecError> {
        self.buf.put_u8(key_type.into());
        self.buf.put_u8(value_type.into());
        self.write_size(size)
    }

    fn write_list_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError> {
        self.buf.put_u8(elem_type.into());
        self.write_size(size)
    }

    fn write_set_begin(&mut self, elem_type: TType, size: usize) -> Result<(), CodecError> {
        self.write_list_begin(elem_type, size)
    }

    fn write_bool(&mut self, v: bool) -> Result<(), CodecError> {
        self.buf.put_u8(v as u8);
        Ok(())
    }

    fn write_byte(&mut self, v: i8) -> Result<(), CodecError> {
        self.buf.put_i8(v);
        Ok(())
    }

    fn write_i16(&mut self, v: i16) -> Result<(), CodecError> {
        self.buf.put_i16(v);
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.buf.put_i32(v);
        Ok(())
    }

    fn write_i64(&mut self, v: i64) -> Result<(), CodecError> {
        self.buf.put_i64(v);
        Ok(())
    }

    fn write_double(&mut self, v: f64) -> Result<(), CodecError> {
        self.buf.put_f64(v);
        Ok(())
    }

    fn write_binary(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.write_size(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    /// Versioned envelopes start with a negative word (`0x8001_0000 | type`). A non-negative
    ///  first word is the name length of a legacy, un-versioned envelope: name, type byte,
    ///  sequence id.
    fn read_message_begin(&mut self) -> Result<MessageBegin, CodecError> {
        let first = self.buf.checked_get_i32()?;

        if first < 0 {
            let version = first as u32 & VERSION_MASK;
            if version != VERSION_1 {
                return Err(CodecError::BadVersion(version));
            }
            let message_type = message_type(first as u32 & 0xff)?;
            let name = self.read_string()?;
            let seq_id = self.buf.checked_get_i32()?;
            Ok(MessageBegin { name, message_type, seq_id })
        }
        else {
            let len = self.limits.check_string(first as i64)?;
            let raw = self.read_raw(len)?;
            let name = String::from_utf8(raw.to_vec())
                .map_err(|e| CodecError::InvalidData(format!("message name is not utf-8: {}", e)))?;
            let message_type = message_type(self.buf.checked_get_u8()? as u32)?;
            let seq_id = self.buf.checked_get_i32()?;
            Ok(MessageBegin { name, message_type, seq_id })
        }
    }

    fn read_struct_begin(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader, CodecError> {
        let field_type = self.read_type()?;
        if field_type == TType::Stop {
            return Ok(FieldHeader { field_type, id: 0 });
        }
        let id = self.buf.checked_get_i16()?;
        Ok(FieldHeader { field_type, id })
    }

    fn read_map_begin(&mut self) -> Result<MapHeader, CodecError> {
        let key_type = self.read_type()?;
        let value_type = self.read_type()?;
        let size = self.limits.check_container(self.buf.checked_get_i32()? as i64)?;
        Ok(MapHeader { key_type, value_type, size })
    }

    fn read_list_begin(&mut self) -> Result<ListHeader, CodecError> {
        let elem_type = self.read_type()?;
        let size = self.limits.check_container(self.buf.checked_get_i32()? as i64)?;
        Ok(ListHeader { elem_type, size })
    }

    fn read_set_begin(&mut self) -> Result<ListHeader, CodecError> {
        self.read_list_begin()
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.buf.checked_get_u8()? != 0)
    }

    fn read_byte(&mut self) -> Result<i8, CodecError> {
        self.buf.checked_get_i8()
    }

    fn read_i16(&mut self) -> Result<i16, CodecError> {
        self.buf.checked_get_i16()
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.buf.checked_get_i32()
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        self.buf.checked_get_i64()
    }

    fn read_double(&mut self) -> Result<f64, CodecError> {
        self.buf.checked_get_f64()
    }

    fn read_binary(&mut self) -> Result<Bytes, CodecError> {
        let len = self.limits.check_string(self.buf.checked_get_i32()? as i64)?;
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

fn message_type(raw: u32) -> Result<MessageType, CodecError> {
    MessageType::try_from(raw as u8)
        .map_err(|_| CodecError::InvalidData(format!("unknown message type {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn proto(buf: &mut BytesMut) -> BinaryProtocol {
        BinaryProtocol::new(buf, ProtocolLimits { string_limit: 16, container_limit: 4 })
    }

    #[test]
    fn test_primitives_are_big_endian() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_i16(0x0102).unwrap();
            p.write_i32(0x03040506).unwrap();
            p.write_bool(true).unwrap();
            p.write_string("ab").unwrap();
        }
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6, 1, 0, 0, 0, 2, b'a', b'b']);

        let mut p = proto(&mut buf);
        assert_eq!(p.read_i16().unwrap(), 0x0102);
        assert_eq!(p.read_i32().unwrap(), 0x03040506);
        assert!(p.read_bool().unwrap());
        assert_eq!(p.read_string().unwrap(), "ab");
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn test_primitive_values() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_byte(-128).unwrap();
            p.write_i64(i64::MIN).unwrap();
            p.write_double(-0.125).unwrap();
            p.write_binary(&[0, 255]).unwrap();
        }

        let mut p = proto(&mut buf);
        assert_eq!(p.read_byte().unwrap(), -128);
        assert_eq!(p.read_i64().unwrap(), i64::MIN);
        assert_eq!(p.read_double().unwrap(), -0.125);
        assert_eq!(&p.read_binary().unwrap()[..], &[0, 255]);
    }

    #[test]
    fn test_field_and_container_headers() {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            p.write_field_begin("x", TType::Map, 255).unwrap();
            p.write_map_begin(TType::String, TType::String, 3).unwrap();
            p.write_set_begin(TType::I32, 2).unwrap();
            p.write_field_stop().unwrap();
        }
        assert_eq!(&buf[..3], &[13, 0, 255]);
        assert_eq!(&buf[3..9], &[11, 11, 0, 0, 0, 3]);

        let mut p = proto(&mut buf);
        assert_eq!(p.read_field_begin().unwrap(), FieldHeader { field_type: TType::Map, id: 255 });
        assert_eq!(p.read_map_begin().unwrap(), MapHeader { key_type: TType::String, value_type: TType::String, size: 3 });
        assert_eq!(p.read_set_begin().unwrap(), ListHeader { elem_type: TType::I32, size: 2 });
        assert_eq!(p.read_field_begin().unwrap().field_type, TType::Stop);
    }

    #[rstest]
    #[case::string(&[0, 0, 0, 17], true)]
    #[case::negative_string(&[0xff, 0xff, 0xff, 0xfe], false)]
    fn test_string_size_guard(#[case] raw: &[u8], #[case] is_size_limit: bool) {
        let mut buf = BytesMut::from(raw);
        buf.extend_from_slice(&[b'x'; 17]);

        match proto(&mut buf).read_string() {
            Err(CodecError::SizeLimit { size: 17, limit: 16 }) => assert!(is_size_limit),
            Err(CodecError::NegativeSize(-2)) => assert!(!is_size_limit),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oversized_string_write_then_read_is_size_limit() {
        let mut buf = BytesMut::new();
        proto(&mut buf).write_string(&"y".repeat(17)).unwrap();
        assert!(matches!(proto(&mut buf).read_string(), Err(CodecError::SizeLimit { .. })));
    }

    #[rstest]
    #[case::map(TType::Map)]
    #[case::list(TType::List)]
    #[case::set(TType::Set)]
    fn test_container_size_guard(#[case] container: TType) {
        let mut buf = BytesMut::new();
        {
            let mut p = proto(&mut buf);
            match container {
                TType::Map => p.write_map_begin(TType::I32, TType::I32, 5).unwrap(),
                TType::List => p.write_list_begin(TType::I32, 5).unwrap(),
                _ => p.write_set_begin(TType::I32, 5).unwrap(),
            }
        }

        let mut p = proto(&mut buf);
        let result = match container {
            TType::Map => p.read_map_begin().map(|_| ()),
            TType::List => p.read_list_begin().map(|_| ()),
            _ => p.read_set_begin().map(|_| ()),
        };
        assert!(matches!(result, Err(CodecError::SizeLimit { size: 5, limit: 4 })));
    }

    #[test]
    fn test_truncated_string_is_underflow() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, b'a'][..]);
        assert!(matches!(proto(&mut buf).read_string(), Err(CodecError::Underflow { needed: 5, remaining: 1 })));
    }

    #[test]
    fn test_versioned_message_begin() {
        let mut buf = BytesMut::new();
        proto(&mut buf).write_message_begin("ping", MessageType::Oneway, 42).unwrap();
        assert_eq!(&buf[..4], &[0x80, 0x01, 0x00, 0x04]);

        let begin = proto(&mut buf).read_message_begin().unwrap();
        assert_eq!(begin, MessageBegin { name: "ping".to_string(), message_type: MessageType::Oneway, seq_id: 42 });
    }

    /// Peers predating the version word send `i32 name length, name, type byte, i32 seqid`.
    ///  This path is kept for wire compatibility only.
    #[test]
    fn test_legacy_unversioned_message_begin() {
        let mut buf = BytesMut::new();
        buf.put_i32(4);
        buf.put_slice(b"ping");
        buf.put_u8(1);
        buf.put_i32(7);

        let begin = proto(&mut buf).read_message_begin().unwrap();
        assert_eq!(begin, MessageBegin { name: "ping".to_string(), message_type: MessageType::Call, seq_id: 7 });
    }

    #[test]
    fn test_legacy_message_begin_honors_string_limit() {
        let mut buf = BytesMut::new();
        buf.put_i32(1000);
        assert!(matches!(proto(&mut buf).read_message_begin(), Err(CodecError::SizeLimit { .. })));
    }

    #[test]
    fn test_bad_version() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8002_0001);
        assert!(matches!(proto(&mut buf).read_message_begin(), Err(CodecError::BadVersion(0x8002_0000))));
    }

    #[test]
    fn test_unknown_field_type() {
        let mut buf = BytesMut::from(&[99u8, 0, 1][..]);
        assert!(matches!(proto(&mut buf).read_field_begin(), Err(CodecError::InvalidData(_))));
    }
}
