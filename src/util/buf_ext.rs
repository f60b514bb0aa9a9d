use bytes_varint::VarIntSupport;

use crate::error::CodecError;

macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, CodecError> {
            self.ensure_remaining(std::mem::size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads: a truncated frame is reported instead of panicking inside `bytes`.
pub trait BufExt: bytes::Buf + VarIntSupport {
    fn ensure_remaining(&self, needed: usize) -> Result<(), CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::Underflow { needed, remaining: self.remaining() });
        }
        Ok(())
    }

    checked_get_impl!(checked_get_u8, u8, get_u8);
    checked_get_impl!(checked_get_i8, i8, get_i8);
    checked_get_impl!(checked_get_i16, i16, get_i16);
    checked_get_impl!(checked_get_i32, i32, get_i32);
    checked_get_impl!(checked_get_i64, i64, get_i64);
    checked_get_impl!(checked_get_f64, f64, get_f64);
    checked_get_impl!(checked_get_f64_le, f64, get_f64_le);

    #[allow(deprecated)]
    fn checked_get_u32_varint(&mut self) -> Result<u32, CodecError> {
        self.get_u32_varint().varint()
    }

    #[allow(deprecated)]
    fn checked_get_u64_varint(&mut self) -> Result<u64, CodecError> {
        self.get_u64_varint().varint()
    }
}

trait VarIntAdapter<T> {
    fn varint(self) -> Result<T, CodecError>;
}
impl <T, E: std::fmt::Debug> VarIntAdapter<T> for Result<T, E> {
    fn varint(self) -> Result<T, CodecError> {
        self.map_err(|e| CodecError::Varint(format!("{:?}", e)))
    }
}

impl <T: bytes::Buf> BufExt for T {
}
