use glam::Vec3;

use super::error::WireError;
use super::reader::WireReader;

/// Encoding half of the wire format. Integers and floats are written in
/// network byte order, strings are null-terminated.
pub trait WireEncode {
    fn encoded_len(&self) -> usize;
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError>;
}

pub trait WireDecode: Sized {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Anything that can travel both ways. Replicated variables require this.
pub trait WireValue: WireEncode + WireDecode {}

impl<T: WireEncode + WireDecode> WireValue for T {}

macro_rules! impl_wire_number {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireEncode for $ty {
                #[inline]
                fn encoded_len(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                #[inline]
                fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
                    out.extend_from_slice(&self.to_be_bytes());
                    Ok(())
                }
            }

            impl WireDecode for $ty {
                #[inline]
                fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
                    let bytes = reader.take_array::<{ std::mem::size_of::<$ty>() }>()?;
                    Ok(<$ty>::from_be_bytes(bytes))
                }
            }
        )*
    };
}

impl_wire_number!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl WireEncode for bool {
    fn encoded_len(&self) -> usize {
        1
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        out.push(u8::from(*self));
        Ok(())
    }
}

impl WireDecode for bool {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(u8::decode(reader)? != 0)
    }
}

impl WireEncode for str {
    fn encoded_len(&self) -> usize {
        self.len() + 1
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        if self.as_bytes().contains(&0) {
            return Err(WireError::InteriorNul);
        }
        out.extend_from_slice(self.as_bytes());
        out.push(0);
        Ok(())
    }
}

impl WireEncode for String {
    fn encoded_len(&self) -> usize {
        self.as_str().encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        self.as_str().encode(out)
    }
}

impl WireDecode for String {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let bytes = reader.take_until_nul()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }
}

impl WireEncode for Vec3 {
    fn encoded_len(&self) -> usize {
        12
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        self.x.encode(out)?;
        self.y.encode(out)?;
        self.z.encode(out)
    }
}

impl WireDecode for Vec3 {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let x = f32::decode(reader)?;
        let y = f32::decode(reader)?;
        let z = f32::decode(reader)?;
        Ok(Vec3::new(x, y, z))
    }
}
