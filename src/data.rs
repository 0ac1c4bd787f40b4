//! Traits and impls used to read/write data to/from the wire.

use bilge::prelude::*;
use thiserror::Error;

/**
	trait for data types than can be packed/unpacked to/from a mailbox frame
*/
pub trait PduData: Sized {
    const ID: TypeId;
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
    fn packed_bitsize() -> usize {Self::Packed::LEN*8}
}

/** Enum to identify and raise adapted error raised by this package
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum PackingError {
    #[error("bad size ({0} bytes): {1}")]
    BadSize(usize, &'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// this trait is an equivalent to `packed_struct::ByteArray` but since rust doesn't actually support using generic consts in const expressions, we do not have choice
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

/** dtype identifiers associated to dtypes allowing to dynamically check the type of a [PduData] implementor

	The values are the CiA 301 data type indices, so a dictionary entry can report its declared type directly on the wire.
	It is only convering the common useful types and not all the possible implementors of [PduData]
*/
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum TypeId {
	Bool = 0x0001,
	I8 = 0x0002,
	I16 = 0x0003,
	I32 = 0x0004,
	U8 = 0x0005,
	U16 = 0x0006,
	U32 = 0x0007,
	F32 = 0x0008,
	/// visible string
	String = 0x0009,
	/// CiA `DOMAIN`, used in case the data does not fit in any of these integers
	Custom = 0x000f,
	F64 = 0x0011,
	I64 = 0x0015,
	U64 = 0x001b,
}

impl<const N: usize> PduData for [u8; N] {
	const ID: TypeId = TypeId::Custom;
	type Packed = Self;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for desired slice"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < N
            {return Err(PackingError::BadSize(src.len(), "not enough bytes for desired slice"))}
        let mut dst = [0; N];
        dst.copy_from_slice(&src[.. N]);
		Ok(dst)
	}
}

impl PduData for bool {
	const ID: TypeId = TypeId::Bool;
	type Packed = [u8; 1];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(dst.len(), ""))}
        dst[0] = if *self {0b1} else {0b0};
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(src.len(), ""))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

/**
    macro implementing [PduData] for a given struct or enum generated with `bilge`

    `$id` is the byte-exact integer the bitfield is stored in, it is always serialized little endian as everything in ethercat.
    Enums that do not cover all the bit values are converted with `TryFrom`, and report [PackingError::InvalidValue] on unknown values.
*/
macro_rules! bilge_pdudata {
    ($t: ty, $id: ident) => { impl crate::data::PduData for $t {
        const ID: crate::data::TypeId = crate::data::TypeId::Custom;
        type Packed = [u8; core::mem::size_of::<$id>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            const LEN: usize = core::mem::size_of::<$id>();
            if dst.len() < LEN
                {return Err(crate::data::PackingError::BadSize(dst.len(), "bilge struct needs exact size"))}
            dst[.. LEN].copy_from_slice(&$id::from(*self).to_le_bytes());
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            const LEN: usize = core::mem::size_of::<$id>();
            if src.len() < LEN
                {return Err(crate::data::PackingError::BadSize(src.len(), "bilge struct needs exact size"))}
            let mut raw = [0; LEN];
            raw.copy_from_slice(&src[.. LEN]);
            <$t>::try_from($id::from_le_bytes(raw))
                .map_err(|_| crate::data::PackingError::InvalidValue(stringify!($t)))
        }
    }};
}
pub(crate) use bilge_pdudata;

bilge_pdudata!(TypeId, u16);

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty, $id: ident) => { impl crate::data::PduData for $t {
			const ID: crate::data::TypeId = crate::data::TypeId::$id;
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                const LEN: usize = core::mem::size_of::<$t>();
                if dst.len() < LEN
                    {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for integer"))}
				dst[.. LEN].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                const LEN: usize = core::mem::size_of::<$t>();
                if src.len() < LEN
                    {return Err(crate::data::PackingError::BadSize(src.len(), "not enough bytes for integer"))}
                let mut raw = [0; LEN];
                raw.copy_from_slice(&src[.. LEN]);
				Ok(Self::from_le_bytes(raw))
			}
		}};
}

num_pdudata!(u8, U8);
num_pdudata!(u16, U16);
num_pdudata!(u32, U32);
num_pdudata!(u64, U64);
num_pdudata!(i8, I8);
num_pdudata!(i16, I16);
num_pdudata!(i32, I32);
num_pdudata!(i64, I64);
num_pdudata!(f32, F32);
num_pdudata!(f64, F64);



/** helper to read/write sequencial data from/to a byte slice

    It is close to what [std::io::Cursor] is doing, but this struct allows reading forward without consuming the stream, and returns slices without copying the data. It is also meant to work with [PduData]

    Depending on the mutability of the slice this struct is built on, different capabilities are provided.
    Every access out of the slice bounds is reported as [PackingError::BadSize] and leaves the position unchanged.
*/
pub struct Cursor<T> {
    position: usize,
    data: T,
}
impl<T> Cursor<T> {
    /// create a new cursor starting at position zero in the given slice
    pub fn new(data: T) -> Self   {Self{position: 0, data}}
    /** current position in the read/write slice

    bytes before this position are considered read or written, and bytes after are coming for use in next read/write calls
    */
    pub fn position(&self) -> usize   {self.position}
}
impl<T: AsRef<[u8]>> Cursor<T> {
    fn span(&self, size: usize) -> PackingResult<core::ops::Range<usize>> {
        let end = self.position + size;
        if end > self.data.as_ref().len()
            {return Err(PackingError::BadSize(self.data.as_ref().len() - self.position, "cursor reached the end of data"))}
        Ok(self.position .. end)
    }
    /// read the next coming bytes with a [PduData] value, and increment the position
    pub fn unpack<V: PduData>(&mut self) -> PackingResult<V> {
        let span = self.span(V::Packed::LEN)?;
        let value = V::unpack(&self.data.as_ref()[span.clone()])?;
        self.position = span.end;
        Ok(value)
    }
}
impl<'a> Cursor<&'a [u8]> {
    /// read the next coming `size` bytes and increment the position
    pub fn read(&mut self, size: usize) -> PackingResult<&'a [u8]> {
        let span = self.span(size)?;
        let data: &'a [u8] = self.data;
        self.position = span.end;
        Ok(&data[span])
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[self.position ..]
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[.. self.position]
    }
}
impl<'a> Cursor<&'a mut [u8]> {
    /// write the next coming bytes with a [PduData] value, and increment the position
    pub fn pack<V: PduData>(&mut self, value: &V) -> PackingResult<()> {
        let span = self.span(V::Packed::LEN)?;
        value.pack(&mut self.data[span.clone()])?;
        self.position = span.end;
        Ok(())
    }
    /// write the next coming bytes with the given slice, and increment the position
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        let span = self.span(value.len())?;
        self.data[span.clone()].copy_from_slice(value);
        self.position = span.end;
        Ok(())
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&mut self) -> &'_ mut [u8] {
        &mut self.data[self.position ..]
    }
    /// advance the position over bytes written directly in [Self::remain]
    pub fn skip(&mut self, size: usize) -> PackingResult<()> {
        self.position = self.span(size)?.end;
        Ok(())
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a mut [u8] {
        let Self {position, data} = self;
        &mut data[.. position]
    }
}
