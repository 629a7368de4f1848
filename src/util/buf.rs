use bytes::Buf;
use thiserror::Error;


#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufError {
    #[error("buffer underflow")]
    Underflow,
    #[error("malformed field: {0}")]
    Malformed(&'static str),
}

macro_rules! try_get_impl {
    ($try_getter:ident, $ty:ty, $getter:ident) => {
        fn $try_getter(&mut self) -> Result<$ty, BufError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(BufError::Underflow);
            }
            Ok(self.$getter())
        }
    };
}

/// Checked accessors over [bytes::Buf] in network byte order. The plain
///  getters panic on underflow, which is no way to treat bytes off the wire.
pub trait BufExt: Buf {
    try_get_impl!(try_get_u8, u8, get_u8);
    try_get_impl!(try_get_u16, u16, get_u16);
    try_get_impl!(try_get_u32, u32, get_u32);

    /// a string as it appears on the wire: u8 length followed by that many bytes
    fn try_get_lp_string(&mut self) -> Result<String, BufError> {
        let len = self.try_get_u8()? as usize;
        if self.remaining() < len {
            return Err(BufError::Underflow);
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|_| BufError::Malformed("string is not valid utf-8"))
    }
}

impl<T: Buf> BufExt for T {}
