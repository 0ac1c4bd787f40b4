/*!
    implementation of the CoE (Canopen Over Ethercat) command protocol, slave side.

    The master addresses entries of the slave's dictionary of objects by `index` and `subindex`, and can:

    - read the value of an entry ([CanCommand::GetObject])
    - write the value of an entry ([CanCommand::SetObject])
    - read the declared type of an entry ([CanCommand::ObjectType])
    - read the highest subindex of an index ([CanCommand::MaxSubindex])

    This module does not store the dictionary, it only translates the requests to a [Dictionary] provided by the application. It holds no state between requests.

    Request layout: [CoeCommandHeader] followed by the value to write (for [CanCommand::SetObject] only)

    Reply layout: [CoeCommandHeader] echoing the request, a `u16` status (`0` or a [CanError] code), then on success

    | command | data |
    |---------|------|
    | [CanCommand::GetObject] | value bytes |
    | [CanCommand::SetObject] | none |
    | [CanCommand::ObjectType] | [TypeId] as `u16` |
    | [CanCommand::MaxSubindex] | max subindex as `u8` |
*/

use crate::{
	data::{self, PduData, TypeId, Cursor},
	error::{EthercatError, EthercatResult},
	};
use bilge::prelude::*;
use core::fmt;
use log::{trace, warn};


/// status of a successful reply
pub const CAN_SUCCESS: u16 = 0x0000;

/**
    combined address of a dictionary entry, the canonical key of an entry

    it packs `index` and `subindex` as `(index << 8) | subindex`
*/
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectAddress(u32);

impl ObjectAddress {
    pub const fn new(index: u16, sub: u8) -> Self {
        Self(((index as u32) << 8) | sub as u32)
    }
    /// address of subindex 0 of the given index
    pub const fn index_only(index: u16) -> Self {Self::new(index, 0)}
    pub const fn index(self) -> u16  {(self.0 >> 8) as u16}
    pub const fn sub(self) -> u8  {(self.0 & 0xff) as u8}
    /// the combined integer value
    pub const fn value(self) -> u32  {self.0}
}
impl From<ObjectAddress> for u32 {
    fn from(address: ObjectAddress) -> u32 {address.0}
}
impl fmt::Debug for ObjectAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ObjectAddress {{index: {:#x}, sub: {}}}", self.index(), self.sub())
	}
}

/**
    dictionary of objects of the slave application

    Implementors are expected to answer immediately: a value that needs slow storage should be cached, writes should be queued and report [CanError::Generic] if the queue is full. The mailbox service is never waiting on the dictionary.
*/
pub trait Dictionary {
    /// copy the value of the entry into `dst` and return its byte size
    fn get(&mut self, address: ObjectAddress, dst: &mut [u8]) -> Result<usize, CanError>;
    /// replace the value of the entry, the value must not be changed if an error is returned
    fn set(&mut self, address: ObjectAddress, value: &[u8]) -> Result<(), CanError>;
    /// declared type of the entry
    fn object_type(&mut self, address: ObjectAddress) -> Result<TypeId, CanError>;
    /// highest subindex existing for the given index
    fn max_subindex(&mut self, index: u16) -> Result<u8, CanError>;
}

impl<D: Dictionary + ?Sized> Dictionary for &mut D {
    fn get(&mut self, address: ObjectAddress, dst: &mut [u8]) -> Result<usize, CanError>  {(**self).get(address, dst)}
    fn set(&mut self, address: ObjectAddress, value: &[u8]) -> Result<(), CanError>  {(**self).set(address, value)}
    fn object_type(&mut self, address: ObjectAddress) -> Result<TypeId, CanError>  {(**self).object_type(address)}
    fn max_subindex(&mut self, index: u16) -> Result<u8, CanError>  {(**self).max_subindex(index)}
}


/// commands of the CoE command protocol
#[bitsize(8)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanCommand {
    GetObject = 0x1,
    SetObject = 0x2,
    ObjectType = 0x3,
    MaxSubindex = 0x4,
}
data::bilge_pdudata!(CanCommand, u8);

/// error codes of the CoE command protocol
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CanError {
    /// the request is valid but failed, for instance the value to write is out of range or of wrong size
    #[error("object access failed")]
    Generic = 0xff01,
    /// the request addresses an entry or uses a command that does not exist
    #[error("unknown object or command")]
    Unknown = 0xff02,
}
data::bilge_pdudata!(CanError, u16);

/// header of CoE commands and replies
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct CoeCommandHeader {
    /// raw [CanCommand]
    pub command: u8,
    pub sub: u8,
    pub index: u16,
}
data::bilge_pdudata!(CoeCommandHeader, u32);

impl CoeCommandHeader {
    pub fn address(&self) -> ObjectAddress  {ObjectAddress::new(self.index(), self.sub())}
}

/// a decoded CoE request
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoeRequest<'a> {
    GetObject(ObjectAddress),
    SetObject(ObjectAddress, &'a [u8]),
    ObjectType(ObjectAddress),
    /// the subindex is ignored
    MaxSubindex(u16),
}

impl<'a> CoeRequest<'a> {
    /// decode a request, an unknown command is reported as [CanError::Unknown]
    pub fn unpack(src: &'a [u8]) -> EthercatResult<Self, CanError> {
        let mut frame = Cursor::new(src);
        let header = frame.unpack::<CoeCommandHeader>()?;
        let command = CanCommand::try_from(header.command())
            .map_err(|_| EthercatError::Service(CanError::Unknown))?;
        Ok(match command {
            CanCommand::GetObject => Self::GetObject(header.address()),
            CanCommand::SetObject => Self::SetObject(header.address(), frame.remain()),
            CanCommand::ObjectType => Self::ObjectType(header.address()),
            CanCommand::MaxSubindex => Self::MaxSubindex(header.index()),
        })
    }
    /// write the request in `dst`, return the number of bytes written
    pub fn pack(&self, dst: &mut [u8]) -> EthercatResult<usize> {
        let mut frame = Cursor::new(dst);
        frame.pack(&self.header())?;
        if let Self::SetObject(_, value) = self
            {frame.write(value)?;}
        Ok(frame.position())
    }
    pub fn command(&self) -> CanCommand {
        match self {
            Self::GetObject(_) => CanCommand::GetObject,
            Self::SetObject(..) => CanCommand::SetObject,
            Self::ObjectType(_) => CanCommand::ObjectType,
            Self::MaxSubindex(_) => CanCommand::MaxSubindex,
        }
    }
    pub fn address(&self) -> ObjectAddress {
        match *self {
            Self::GetObject(address)
            | Self::SetObject(address, _)
            | Self::ObjectType(address) => address,
            Self::MaxSubindex(index) => ObjectAddress::index_only(index),
        }
    }
    fn header(&self) -> CoeCommandHeader {
        let address = self.address();
        CoeCommandHeader::new(u8::from(self.command()), address.sub(), address.index())
    }
}

/**
    stateless processor of CoE commands

    The only thing it holds is the dictionary provider, which can as well be a `&mut` reference to the application's dictionary.
*/
pub struct Can<D: Dictionary> {
    dictionary: D,
}
impl<D: Dictionary> Can<D> {
    pub fn new(dictionary: D) -> Self {
        Self {dictionary}
    }
    pub fn dictionary(&mut self) -> &mut D  {&mut self.dictionary}

    /// execute one decoded request against the dictionary, and write the reply data (without header nor status) in `dst`
    pub fn handle(&mut self, request: &CoeRequest, dst: &mut [u8]) -> Result<usize, CanError> {
        match *request {
            CoeRequest::GetObject(address) => self.dictionary.get(address, dst),
            CoeRequest::SetObject(address, value) => self.dictionary.set(address, value).map(|_| 0),
            CoeRequest::ObjectType(address) => {
                let ty = self.dictionary.object_type(address)?;
                ty.pack(dst).map_err(|_| CanError::Generic)?;
                Ok(TypeId::packed_size())
            },
            CoeRequest::MaxSubindex(index) => {
                let max = self.dictionary.max_subindex(index)?;
                max.pack(dst).map_err(|_| CanError::Generic)?;
                Ok(u8::packed_size())
            },
        }
    }

    /**
        process a raw CoE mailbox body and write the raw reply body in `reply`, returning its size.

        Errors of the dictionary are answered with their [CanError] code. Only a request too short to contain a header, or a reply buffer too small, fail this function.
    */
    pub fn receive(&mut self, request: &[u8], reply: &mut [u8]) -> EthercatResult<usize> {
        let header = CoeCommandHeader::unpack(request)?;
        if reply.len() < COE_REPLY_PREFIX
            {return Err(EthercatError::Capacity("reply buffer cannot hold a CoE reply"))}
        let (prefix, data) = reply.split_at_mut(COE_REPLY_PREFIX);

        let result = CoeRequest::unpack(request)
            .map_err(|e| match e {
                EthercatError::Service(code) => code,
                _ => CanError::Unknown,
            })
            .and_then(|request| {
                trace!("coe {:?}", request);
                self.handle(&request, data)
            });
        let (status, size) = match result {
            Ok(size) => (CAN_SUCCESS, size),
            Err(code) => {
                warn!("coe request {:?} failed: {}", header, code);
                (u16::from(code), 0)
            },
        };
        let mut frame = Cursor::new(prefix);
        frame.pack(&header)?;
        frame.pack(&status)?;
        Ok(COE_REPLY_PREFIX + size)
    }
}

/// bytes preceding the data in a CoE reply: header and status
pub const COE_REPLY_PREFIX: usize = 6;

/// a decoded CoE reply, as the master sees it
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CoeReply<'a> {
    pub header: CoeCommandHeader,
    /// reply data, or the error reported by the slave
    pub result: Result<&'a [u8], CanError>,
}
impl<'a> CoeReply<'a> {
    pub fn unpack(src: &'a [u8]) -> EthercatResult<Self> {
        let mut frame = Cursor::new(src);
        let header = frame.unpack::<CoeCommandHeader>()?;
        let status = frame.unpack::<u16>()?;
        let result = if status == CAN_SUCCESS
            {Ok(frame.remain())}
        else {
            Err(CanError::try_from(status)
                .map_err(|_| EthercatError::Protocol("unknown CoE status"))?)
        };
        Ok(Self {header, result})
    }
}
