use bytes::{Buf, BufMut, Bytes};

use crate::postgres::ProtocolError;

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// length is usize in rust, while sometime postgres want i32,
    /// this will panic when overflow instead of wrapping
    fn to_i32(self) -> i32;
    /// length is usize in rust, while sometime postgres want i16,
    /// this will panic when overflow instead of wrapping
    fn to_i16(self) -> i16;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_i16(self) -> i16 {
        self.try_into().expect("message size too large for protocol")
    }
}

pub trait StrExt {
    /// postgres String must be nul terminated
    fn nul_string_len(&self) -> i32;
}

impl StrExt for str {
    fn nul_string_len(&self) -> i32 {
        self.len().to_i32() + 1/* nul */
    }
}

pub trait BufMutExt {
    /// postgres String must be nul terminated
    fn put_nul_string(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

pub trait BytesExt {
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError>;

    fn get_nul_string(&mut self) -> Result<String, ProtocolError>;
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(end) = self.iter().position(|e| matches!(e, b'\0')) else {
            return Err(ProtocolError::missing_nul());
        };
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        Ok(me)
    }

    fn get_nul_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.get_nul_bytes()?;
        String::from_utf8(bytes.into()).map_err(|e| ProtocolError::non_utf8(e.utf8_error()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nul_string() {
        let mut buf = bytes::BytesMut::new();
        buf.put_nul_string("foo");
        buf.put_nul_string("");
        let mut bytes = buf.freeze();
        assert_eq!(bytes.get_nul_string().unwrap(), "foo");
        assert_eq!(bytes.get_nul_string().unwrap(), "");
        assert!(bytes.get_nul_string().is_err());
    }
}
