/*!
    framing of mailbox messages, common to every mailbox protocol.

    A mailbox message is a [MailboxHeader] followed by `length` bytes of service data, the [MailboxType] in the header tells which protocol the service data belongs to.
*/

use crate::data::{self, PduData, PackingError, PackingResult, Cursor};
use bilge::prelude::*;


/// byte size of [MailboxHeader] on the wire
pub const MAILBOX_HEADER_SIZE: usize = 6;
/// biggest mailbox message fitting one ethercat datagram in a standard ethernet frame
pub const MAX_MAILBOX_SIZE: usize = 1486;

/// ETG 1000.4 5.6
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MailboxFrame<'a> {
    pub header: MailboxHeader,
    pub data: &'a [u8],
}
impl<'a> MailboxFrame<'a> {
    pub fn packed_size(&self) -> usize {
        MailboxHeader::packed_size()
        + self.header.length() as usize
    }
    /// write the frame at the start of `dst` and return the number of bytes written
    pub fn pack(&self, dst: &mut [u8]) -> PackingResult<usize> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&self.header)?;
        cursor.write(self.data)?;
        Ok(cursor.position())
    }
    /**
        read a frame from a received buffer

        if `strict` is set, the buffer must contain exactly the service data announced by the header, otherwise trailing bytes are ignored.
    */
    pub fn unpack(src: &'a [u8], strict: bool) -> Result<Self, MailboxError> {
        let mut cursor = Cursor::new(src);
        let header = cursor.unpack::<MailboxHeader>()
            .map_err(|_| MailboxError::SizeTooShort)?;
        let length = header.length() as usize;
        let remain = cursor.remain();
        if remain.len() < length
            {return Err(MailboxError::SizeTooShort)}
        if strict && remain.len() != length
            {return Err(MailboxError::InvalidSize)}
        Ok(Self {
            header,
            data: &remain[.. length],
        })
    }
}

/// ETG 1000.4 table 29
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    /// reserved for future
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    /// raw [MailboxType], kept raw so that unknown protocols can still be answered
    pub ty: u4,
    /// Counter of the mailbox services (0 reserved, this should roll from 1 to 7 and overflow to 1 after 7)
    pub count: u3,
    unused: u1,
}

// the header is 48 bits wide, there is no native integer for it so it cannot use `bilge_pdudata`
impl PduData for MailboxHeader {
    const ID: data::TypeId = data::TypeId::Custom;
    type Packed = [u8; MAILBOX_HEADER_SIZE];

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < MAILBOX_HEADER_SIZE
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for mailbox header"))}
        let raw = u48::from(*self).value().to_le_bytes();
        dst[.. MAILBOX_HEADER_SIZE].copy_from_slice(&raw[.. MAILBOX_HEADER_SIZE]);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < MAILBOX_HEADER_SIZE
            {return Err(PackingError::BadSize(src.len(), "not enough bytes for mailbox header"))}
        let mut raw = [0; 8];
        raw[.. MAILBOX_HEADER_SIZE].copy_from_slice(&src[.. MAILBOX_HEADER_SIZE]);
        Ok(Self::from(u48::new(u64::from_le_bytes(raw))))
    }
}

impl MailboxHeader {
    /// header of a message of the given protocol
    pub fn message(ty: MailboxType, length: u16, address: u16, priority: u2, count: u3) -> Self {
        Self::new(length, address, u6::new(0), priority, u4::from(ty), count, u1::new(0))
    }
    /// header answering the message this header belongs to
    pub fn reply(&self, ty: MailboxType, length: u16, count: u3) -> Self {
        Self::message(ty, length, self.address(), self.priority(), count)
    }
    /// protocol of the message, if known
    pub fn protocol(&self) -> Result<MailboxType, MailboxError> {
        MailboxType::try_from(self.ty())
            .map_err(|_| MailboxError::UnsupportedProtocol)
    }
}

/// ETG 1000.4 table 29
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    /// error reply, see [MailboxErrorFrame]
    Exception = 0x0,
    /// ADS over EtherCAT, vendor Beckhoff
    Ads = 0x1,
    /// Ethernet over EtherCAT
    Ethernet = 0x2,
    /// CAN application protocol over EtherCAT
    Can = 0x3,
    /// File over EtherCAT
    File = 0x4,
    /// Servo drive profile over EtherCAT
    Servo = 0x5,
    /// Vendor specific
    Specific = 0xf,
}

/// ETG 1000.4 table 30
#[bitsize(32)]
#[derive(TryFromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct MailboxErrorFrame {
    /// always [MAILBOX_ERROR_SERVICE]
    pub ty: u16,
    pub detail: MailboxError,
}
data::bilge_pdudata!(MailboxErrorFrame, u32);

/// service code of a [MailboxErrorFrame]
pub const MAILBOX_ERROR_SERVICE: u16 = 0x1;

impl MailboxErrorFrame {
    pub fn error(detail: MailboxError) -> Self {
        Self::new(MAILBOX_ERROR_SERVICE, detail)
    }
}

// ETG 1000.4 table 30
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxError {
    Syntax = 0x1,
    UnsupportedProtocol = 0x2,
    InvalidChannel = 0x3,
    ServiceNotSupported = 0x4,
    InvalidHeader = 0x5,
    SizeTooShort = 0x6,
    NoMoreMemory = 0x7,
    InvalidSize = 0x8,
    ServiceInWork = 0x9,
}
data::bilge_pdudata!(MailboxError, u16);

impl<T> From<crate::EthercatError<T>> for MailboxError {
    fn from(src: crate::EthercatError<T>) -> Self {
        use crate::EthercatError::*;
        match src {
            Service(_) => MailboxError::ServiceNotSupported,
            Protocol(_) => MailboxError::Syntax,
            Sequence(_) => MailboxError::InvalidHeader,
            Capacity(_) => MailboxError::NoMoreMemory,
            Timeout(_) => MailboxError::ServiceInWork,
        }
    }
}

/**
    counter of the messages emitted by this slave, rolling from 1 to 7
*/
#[derive(Copy, Clone, Debug, Default)]
pub struct MailboxCounter(u8);

impl MailboxCounter {
    pub fn new() -> Self {Self(0)}
    /// the counter of the next message
    pub fn next(&mut self) -> u3 {
        self.0 = (self.0 % 7) + 1;
        u3::new(self.0)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = MailboxHeader::message(MailboxType::Can, 10, 0x1234, u2::new(3), u3::new(5));
        let mut buffer = [0; MAILBOX_HEADER_SIZE];
        header.pack(&mut buffer).unwrap();
        assert_eq!(buffer, [10, 0, 0x34, 0x12, 0b1100_0000, 0x53]);
        let back = MailboxHeader::unpack(&buffer).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.protocol(), Ok(MailboxType::Can));
    }

    #[test]
    fn frame_length() {
        let mut buffer = [0; 16];
        let header = MailboxHeader::message(MailboxType::File, 4, 0, u2::new(0), u3::new(1));
        let size = MailboxFrame {header, data: &[1, 2, 3, 4]}.pack(&mut buffer).unwrap();
        assert_eq!(size, 10);

        assert_eq!(MailboxFrame::unpack(&buffer[.. size], true).unwrap().data, &[1, 2, 3, 4]);
        assert_eq!(MailboxFrame::unpack(&buffer, true), Err(MailboxError::InvalidSize));
        assert_eq!(MailboxFrame::unpack(&buffer, false).unwrap().data, &[1, 2, 3, 4]);
        assert_eq!(MailboxFrame::unpack(&buffer[.. 8], false), Err(MailboxError::SizeTooShort));
        assert_eq!(MailboxFrame::unpack(&buffer[.. 3], false), Err(MailboxError::SizeTooShort));
    }

    #[test]
    fn counter_rolls() {
        let mut counter = MailboxCounter::new();
        let values: Vec<u8> = (0 .. 9).map(|_| counter.next().value()).collect();
        assert_eq!(values, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }
}
