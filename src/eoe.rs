/*!
    implementation of EoE (Ethernet over Ethercat), slave side.

    Ethernet frames (up to [MAX_ETHERNET_FRAME] bytes) are much bigger than a mailbox, so they are tunneled as a sequence of fragments. This module reassembles the fragments sent by the master into complete frames for the application's [EthernetStack], and splits the frames of the application into fragments for the master.

    Each direction has its own state machine and its own frame buffer, they never share data:

    - reception ([EoeReceiver]): `Idle` → `RxFragment` (first fragment) → `RxLastFragment` (frame complete, waiting for the application to take it) → `Idle`
    - transmission ([EoeTransmitter]): `Idle` → `TxFragment` (frame being sent) → `Idle`

    No reordering is supported: a fragment arriving out of sequence abandons the frame being received, it is never delivered partially.

    Only one virtual port is supported, the port field of received messages is ignored.
*/

use crate::{
	data::{self, PduData, PackingResult, Cursor},
	error::{EthercatError, EthercatResult},
	config::MailboxConfig,
	};
use bilge::prelude::*;
use std::net::Ipv4Addr;
use log::{debug, trace, warn};


/// Max number of bytes within an ethernet frame (without VLAN tag)
pub const MAX_ETHERNET_FRAME: usize = 1518;
/// byte size of the EoE header
pub const EOE_HEADER_SIZE: usize = 4;
/// maximum byte size of an EoE message
pub const EOE_MAX_MSG_SIZE: usize = 122;
/// maximum byte size of the data following the EoE header
pub const EOE_MAX_DATA_SIZE: usize = EOE_MAX_MSG_SIZE - EOE_HEADER_SIZE;
/// byte size of the optional timestamp appended to a fragment
pub const EOE_TIMESTAMP_SIZE: usize = 4;
/// fragment offsets and frame sizes are expressed in blocks of this size
pub const EOE_BLOCK_SIZE: usize = 32;
/// maximum number of MAC addresses in an address filter, bounded by its 4 bits counter
pub const MAX_FILTER_ADDRESSES: usize = 15;
/// maximum number of masks in an address filter, bounded by its 2 bits counter
pub const MAX_FILTER_MASKS: usize = 3;
/// byte size of a DNS name in ip parameters
pub const DNS_NAME_LENGTH: usize = 32;

pub type MacAddress = [u8; 6];
/// buffer able to hold any ethernet frame
pub type EthernetFrame = heapless::Vec<u8, MAX_ETHERNET_FRAME>;


/**
    ethernet application of the slave, receiving and emitting the frames tunneled through EoE

    All methods must return immediately, a method waiting for an other mailbox exchange would block the mailbox service.
*/
pub trait EthernetStack {
    /**
        a complete frame has been received from the master

        return `false` if the frame cannot be taken now, it is then kept and proposed again at next poll of the mailbox. Only one frame is kept: a frame still not taken when the next one starts is dropped.
    */
    fn receive(&mut self, frame: &[u8], timestamp: Option<u32>) -> bool;
    /// write the next frame to send to the master in `dst` and return its size, or `None` if there is nothing to send
    fn transmit(&mut self, dst: &mut [u8]) -> Option<usize>;
    /// the frame being received has been abandonned, because of the given error
    fn abandoned(&mut self, _error: &EthercatError) {}
    /// the master sets the ip parameters of the slave, only the included parameters are set
    fn set_ip(&mut self, _parameters: &IpParameters) -> Result<(), EoeResult> {
        Err(EoeResult::NoIpSupport)
    }
    /// the master sets the address filter of the slave
    fn set_filter(&mut self, _filter: &AddressFilter) -> Result<(), EoeResult> {
        Err(EoeResult::NoFilterSupport)
    }
}

impl<S: EthernetStack + ?Sized> EthernetStack for &mut S {
    fn receive(&mut self, frame: &[u8], timestamp: Option<u32>) -> bool  {(**self).receive(frame, timestamp)}
    fn transmit(&mut self, dst: &mut [u8]) -> Option<usize>  {(**self).transmit(dst)}
    fn abandoned(&mut self, error: &EthercatError)  {(**self).abandoned(error)}
    fn set_ip(&mut self, parameters: &IpParameters) -> Result<(), EoeResult>  {(**self).set_ip(parameters)}
    fn set_filter(&mut self, filter: &AddressFilter) -> Result<(), EoeResult>  {(**self).set_filter(filter)}
}

/// ethernet stack dropping every frame, for slaves without ethernet application
#[derive(Copy, Clone, Debug, Default)]
pub struct NoEthernet;
impl EthernetStack for NoEthernet {
    fn receive(&mut self, _frame: &[u8], _timestamp: Option<u32>) -> bool  {true}
    fn transmit(&mut self, _dst: &mut [u8]) -> Option<usize>  {None}
}



/// ETG.1000.6 table 5.7.1, first word of the EoE header
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct EoeFrameInfo {
    /// raw [EoeFrameType]
    pub ty: u4,
    /// virtual port, 0 means no specific port
    pub port: u4,
    /// false if at least one fragment follows
    pub last_fragment: bool,
    /// a timestamp is appended after the data
    pub time_appended: bool,
    /// the master requests a timestamp
    pub time_request: bool,
    unused: u5,
}
data::bilge_pdudata!(EoeFrameInfo, u16);

impl EoeFrameInfo {
    pub fn message(ty: EoeFrameType, last_fragment: bool, time_appended: bool) -> Self {
        Self::new(u4::from(ty), u4::new(0), last_fragment, time_appended, false, u5::new(0))
    }
}

/// ETG.1000.6 table 5.7.1, second word of the EoE header for fragments
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct EoeFragmentInfo {
    /// number of the fragment in the frame, starting from 0
    pub fragment: u6,
    /**
        - first fragment: complete size of the frame, in blocks of [EOE_BLOCK_SIZE] rounded up
        - other fragments: byte offset of the fragment in the frame, in blocks of [EOE_BLOCK_SIZE]
    */
    pub size_offset: u6,
    /// number of the ethernet frame the fragment belongs to
    pub frame: u4,
}
data::bilge_pdudata!(EoeFragmentInfo, u16);

/// ETG.1000.6 table 5.7.1
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EoeFrameType {
    Fragment = 0x0,
    InitTimestamp = 0x1,
    /// set ip parameters request, also used as initialization request
    SetIpRequest = 0x2,
    /// set ip parameters response, also used as initialization response
    SetIpResponse = 0x3,
    SetFilterRequest = 0x4,
    SetFilterResponse = 0x5,
    GetIpRequest = 0x6,
    GetIpResponse = 0x7,
    GetFilterRequest = 0x8,
    GetFilterResponse = 0x9,
}

/// ETG.1000.6 table 5.7.3, result of EoE requests
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum EoeResult {
    #[error("success")]
    Success = 0x0000,
    #[error("unspecified error")]
    Unspecified = 0x0001,
    #[error("unsupported frame type")]
    UnsupportedFrameType = 0x0002,
    #[error("ip not supported")]
    NoIpSupport = 0x0201,
    #[error("dhcp not supported")]
    NoDhcpSupport = 0x0202,
    #[error("address filter not supported")]
    NoFilterSupport = 0x0401,
}
data::bilge_pdudata!(EoeResult, u16);

/// a decoded EoE message
#[derive(Clone, Debug, PartialEq)]
pub struct EoeMessage<'a> {
    pub info: EoeFrameInfo,
    pub body: EoeBody<'a>,
}

/// content of an EoE message, depending on its [EoeFrameType]
#[derive(Clone, Debug, PartialEq)]
pub enum EoeBody<'a> {
    Fragment(EoeFragment<'a>),
    InitTimestamp(u32),
    SetIpRequest(IpParameters),
    SetIpResponse(EoeResult),
    SetFilterRequest(AddressFilter),
    SetFilterResponse(EoeResult),
    GetIpRequest,
    GetIpResponse(EoeResult, IpParameters),
    GetFilterRequest,
    GetFilterResponse(EoeResult, AddressFilter),
}

/// fragment of an ethernet frame
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EoeFragment<'a> {
    pub info: EoeFragmentInfo,
    pub data: &'a [u8],
    /// present if [EoeFrameInfo::time_appended] is set
    pub timestamp: Option<u32>,
}

impl<'a> EoeMessage<'a> {
    /// build a single-fragment message with the given body
    pub fn new(body: EoeBody<'a>) -> Self {
        let time_appended = match &body {
            EoeBody::Fragment(fragment) => fragment.timestamp.is_some(),
            _ => false,
        };
        Self {
            info: EoeFrameInfo::message(body.frame_type(), true, time_appended),
            body,
        }
    }
    /// build a fragment message
    pub fn fragment(fragment: EoeFragment<'a>, last: bool) -> Self {
        Self {
            info: EoeFrameInfo::message(EoeFrameType::Fragment, last, fragment.timestamp.is_some()),
            body: EoeBody::Fragment(fragment),
        }
    }

    pub fn unpack(src: &'a [u8]) -> EthercatResult<Self, EoeResult> {
        let mut frame = Cursor::new(src);
        let info = frame.unpack::<EoeFrameInfo>()?;
        let ty = EoeFrameType::try_from(info.ty())
            .map_err(|_| EthercatError::Service(EoeResult::UnsupportedFrameType))?;
        let result = |value: u16| -> EthercatResult<EoeResult, EoeResult> {
            EoeResult::try_from(value)
                .map_err(|_| EthercatError::Protocol("unknown EoE result code"))
        };
        let body = match ty {
            EoeFrameType::Fragment => {
                let fragment = frame.unpack::<EoeFragmentInfo>()?;
                let mut data = frame.remain();
                let timestamp = if info.time_appended() {
                    if data.len() < EOE_TIMESTAMP_SIZE
                        {return Err(EthercatError::Protocol("EoE fragment too short for its timestamp"))}
                    let (content, stamp) = data.split_at(data.len() - EOE_TIMESTAMP_SIZE);
                    data = content;
                    Some(u32::unpack(stamp)?)
                }
                else {None};
                EoeBody::Fragment(EoeFragment {info: fragment, data, timestamp})
            },
            EoeFrameType::InitTimestamp => {
                frame.unpack::<u16>()?;
                EoeBody::InitTimestamp(frame.unpack::<u32>()?)
            },
            EoeFrameType::SetIpRequest => {
                frame.unpack::<u16>()?;
                EoeBody::SetIpRequest(IpParameters::unpack(&mut frame)?)
            },
            EoeFrameType::SetIpResponse => EoeBody::SetIpResponse(result(frame.unpack()?)?),
            EoeFrameType::SetFilterRequest => {
                frame.unpack::<u16>()?;
                EoeBody::SetFilterRequest(AddressFilter::unpack(&mut frame)?)
            },
            EoeFrameType::SetFilterResponse => EoeBody::SetFilterResponse(result(frame.unpack()?)?),
            EoeFrameType::GetIpRequest => {
                frame.unpack::<u16>()?;
                EoeBody::GetIpRequest
            },
            EoeFrameType::GetIpResponse => {
                let code = result(frame.unpack()?)?;
                EoeBody::GetIpResponse(code, IpParameters::unpack(&mut frame)?)
            },
            EoeFrameType::GetFilterRequest => {
                frame.unpack::<u16>()?;
                EoeBody::GetFilterRequest
            },
            EoeFrameType::GetFilterResponse => {
                let code = result(frame.unpack()?)?;
                EoeBody::GetFilterResponse(code, AddressFilter::unpack(&mut frame)?)
            },
        };
        Ok(Self {info, body})
    }

    /// write the message in `dst` and return the number of bytes written
    pub fn pack(&self, dst: &mut [u8]) -> PackingResult<usize> {
        let mut frame = Cursor::new(dst);
        frame.pack(&self.info)?;
        match &self.body {
            EoeBody::Fragment(fragment) => {
                frame.pack(&fragment.info)?;
                frame.write(fragment.data)?;
                if let Some(timestamp) = fragment.timestamp
                    {frame.pack(&timestamp)?;}
            },
            EoeBody::InitTimestamp(timestamp) => {
                frame.pack(&0u16)?;
                frame.pack(timestamp)?;
            },
            EoeBody::SetIpRequest(parameters) => {
                frame.pack(&0u16)?;
                parameters.pack(&mut frame)?;
            },
            EoeBody::SetFilterRequest(filter) => {
                frame.pack(&0u16)?;
                filter.pack(&mut frame)?;
            },
            EoeBody::SetIpResponse(code)
            | EoeBody::SetFilterResponse(code) => frame.pack(code)?,
            EoeBody::GetIpRequest
            | EoeBody::GetFilterRequest => frame.pack(&0u16)?,
            EoeBody::GetIpResponse(code, parameters) => {
                frame.pack(code)?;
                parameters.pack(&mut frame)?;
            },
            EoeBody::GetFilterResponse(code, filter) => {
                frame.pack(code)?;
                filter.pack(&mut frame)?;
            },
        }
        Ok(frame.position())
    }
}

impl EoeBody<'_> {
    pub fn frame_type(&self) -> EoeFrameType {
        match self {
            Self::Fragment(_) => EoeFrameType::Fragment,
            Self::InitTimestamp(_) => EoeFrameType::InitTimestamp,
            Self::SetIpRequest(_) => EoeFrameType::SetIpRequest,
            Self::SetIpResponse(_) => EoeFrameType::SetIpResponse,
            Self::SetFilterRequest(_) => EoeFrameType::SetFilterRequest,
            Self::SetFilterResponse(_) => EoeFrameType::SetFilterResponse,
            Self::GetIpRequest => EoeFrameType::GetIpRequest,
            Self::GetIpResponse(..) => EoeFrameType::GetIpResponse,
            Self::GetFilterRequest => EoeFrameType::GetFilterRequest,
            Self::GetFilterResponse(..) => EoeFrameType::GetFilterResponse,
        }
    }
}


/// ETG.1000.6 table 5.7.4, tells which ip parameters are included in a request
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
struct IpFlags {
    mac: bool,
    ip: bool,
    subnet: bool,
    gateway: bool,
    dns: bool,
    dns_name: bool,
    unused: u26,
}
data::bilge_pdudata!(IpFlags, u32);

/**
    ip parameters of the slave's virtual ethernet port

    fields set to `None` are not included in the message. On the wire every parameter has a fixed position, whether it is included or not. Ip addresses are transmitted as little endian integers.
*/
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IpParameters {
    pub mac: Option<MacAddress>,
    pub ip: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub dns_name: Option<heapless::String<DNS_NAME_LENGTH>>,
}

impl IpParameters {
    /// replace the parameters included in `other`, keep the others
    pub fn merge(&mut self, other: &IpParameters) {
        if other.mac.is_some()      {self.mac = other.mac}
        if other.ip.is_some()       {self.ip = other.ip}
        if other.subnet.is_some()   {self.subnet = other.subnet}
        if other.gateway.is_some()  {self.gateway = other.gateway}
        if other.dns.is_some()      {self.dns = other.dns}
        if other.dns_name.is_some() {self.dns_name = other.dns_name.clone()}
    }

    fn unpack(frame: &mut Cursor<&[u8]>) -> PackingResult<Self> {
        let flags = frame.unpack::<IpFlags>()?;
        let mut parameters = Self::default();
        // trailing parameters that are not included may be omitted
        let mac = frame.read(6).ok();
        if flags.mac() {
            parameters.mac = Some(MacAddress::unpack(mac.ok_or(data::PackingError::BadSize(0, "missing mac address"))?)?);
        }
        for (included, field) in [
                (flags.ip(), &mut parameters.ip),
                (flags.subnet(), &mut parameters.subnet),
                (flags.gateway(), &mut parameters.gateway),
                (flags.dns(), &mut parameters.dns),
                ] {
            let value = frame.unpack::<u32>().ok();
            if included {
                *field = Some(Ipv4Addr::from(value.ok_or(data::PackingError::BadSize(0, "missing ip address"))?));
            }
        }
        let name = frame.read(DNS_NAME_LENGTH).ok();
        if flags.dns_name() {
            let name = name.ok_or(data::PackingError::BadSize(0, "missing dns name"))?;
            let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            let text = core::str::from_utf8(&name[.. end])
                .map_err(|_| data::PackingError::InvalidValue("dns name is not utf8"))?;
            let mut string = heapless::String::new();
            string.push_str(text)
                .map_err(|_| data::PackingError::InvalidValue("dns name too long"))?;
            parameters.dns_name = Some(string);
        }
        Ok(parameters)
    }

    fn pack(&self, frame: &mut Cursor<&mut [u8]>) -> PackingResult<()> {
        frame.pack(&IpFlags::new(
            self.mac.is_some(),
            self.ip.is_some(),
            self.subnet.is_some(),
            self.gateway.is_some(),
            self.dns.is_some(),
            self.dns_name.is_some(),
            u26::new(0),
            ))?;
        frame.write(&self.mac.unwrap_or_default())?;
        for field in [self.ip, self.subnet, self.gateway, self.dns] {
            frame.pack(&field.map(u32::from).unwrap_or(0))?;
        }
        let mut name = [0; DNS_NAME_LENGTH];
        if let Some(text) = &self.dns_name {
            name[.. text.len()].copy_from_slice(text.as_bytes());
        }
        frame.write(&name)
    }
}


/// ETG.1000.6 table 5.7.5
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
struct FilterInfo {
    addresses: u4,
    masks: u2,
    unused: u1,
    inhibit_broadcast: bool,
    unused_high: u8,
}
data::bilge_pdudata!(FilterInfo, u16);

/// address filter of the slave's virtual ethernet port
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressFilter {
    /// do not forward broadcast frames
    pub inhibit_broadcast: bool,
    /// destination addresses accepted
    pub addresses: heapless::Vec<MacAddress, MAX_FILTER_ADDRESSES>,
    /// masks applied on the addresses before comparison
    pub masks: heapless::Vec<MacAddress, MAX_FILTER_MASKS>,
}

impl AddressFilter {
    fn unpack(frame: &mut Cursor<&[u8]>) -> PackingResult<Self> {
        let info = frame.unpack::<FilterInfo>()?;
        let mut filter = Self {
            inhibit_broadcast: info.inhibit_broadcast(),
            .. Default::default()
        };
        for _ in 0 .. info.addresses().value() {
            filter.addresses.push(frame.unpack()?)
                .map_err(|_| data::PackingError::InvalidValue("too many filter addresses"))?;
        }
        for _ in 0 .. info.masks().value() {
            filter.masks.push(frame.unpack()?)
                .map_err(|_| data::PackingError::InvalidValue("too many filter masks"))?;
        }
        Ok(filter)
    }

    fn pack(&self, frame: &mut Cursor<&mut [u8]>) -> PackingResult<()> {
        // the vector capacities already bound the counts to their bit width
        frame.pack(&FilterInfo::new(
            u4::new(self.addresses.len() as u8),
            u2::new(self.masks.len() as u8),
            u1::new(0),
            self.inhibit_broadcast,
            0,
            ))?;
        for address in self.addresses.iter().chain(self.masks.iter()) {
            frame.write(address)?;
        }
        Ok(())
    }
}



/// states of the EoE fragment state machines
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EoeState {
    Idle,
    /// receiving the fragments of a frame
    RxFragment,
    /// a complete frame is received but not yet taken by the application
    RxLastFragment,
    /// sending the fragments of a frame
    TxFragment,
}

/**
    reassembly of the ethernet frames received from the master
*/
pub struct EoeReceiver {
    state: EoeState,
    buffer: EthernetFrame,
    /// fragment number expected next
    expected: u8,
    /// number of the frame being received
    frame: u8,
    /// announced frame size in blocks, 0 if not announced
    blocks: u8,
    timestamp: Option<u32>,
    max_fragment: usize,
}

impl EoeReceiver {
    /// `max_fragment` is the maximum number of data bytes accepted in one fragment
    pub fn new(max_fragment: usize) -> Self {
        Self {
            state: EoeState::Idle,
            buffer: EthernetFrame::new(),
            expected: 0,
            frame: 0,
            blocks: 0,
            timestamp: None,
            max_fragment,
        }
    }
    pub fn state(&self) -> EoeState  {self.state}
    /// the complete frame waiting for the application, if any
    pub fn frame(&self) -> Option<&[u8]> {
        match self.state {
            EoeState::RxLastFragment => Some(&self.buffer),
            _ => None,
        }
    }
    /// drop any frame in progress or waiting, and go back to idle
    pub fn reset(&mut self) {
        self.state = EoeState::Idle;
        self.buffer.clear();
        self.expected = 0;
        self.blocks = 0;
        self.timestamp = None;
    }

    /**
        process one fragment received from the master

        A completed frame is immediately proposed to `stack`. On any error, the frame in progress is abandonned, `stack` is notified and the receiver returns to idle.
    */
    pub fn receive<S: EthernetStack>(&mut self, info: &EoeFrameInfo, fragment: &EoeFragment, stack: &mut S) -> EthercatResult {
        if self.state == EoeState::RxLastFragment && ! self.deliver(stack) {
            warn!("eoe frame not taken by the application, dropped");
            let error = EthercatError::Capacity("previous frame not taken by the application");
            stack.abandoned(&error);
            self.reset();
        }
        if info.time_request()
            {debug!("eoe timestamp requested, not supported");}

        let number = fragment.info.fragment().value();
        if fragment.data.len() > self.max_fragment
            {return self.abandon(stack, EthercatError::Capacity("fragment bigger than allowed"))}

        if number == 0 {
            if self.state == EoeState::RxFragment {
                let error = EthercatError::Sequence("frame interrupted by a new frame");
                warn!("eoe frame {} abandonned: {}", self.frame, error);
                stack.abandoned(&error);
            }
            self.reset();
            self.state = EoeState::RxFragment;
            self.frame = fragment.info.frame().value();
            self.blocks = fragment.info.size_offset().value();
            debug!("eoe receiving frame {}", self.frame);
        }
        else {
            if self.state != EoeState::RxFragment
                {return self.abandon(stack, EthercatError::Sequence("fragment received without first fragment"))}
            if number != self.expected
                {return self.abandon(stack, EthercatError::Sequence("unexpected fragment number"))}
            if fragment.info.frame().value() != self.frame
                {return self.abandon(stack, EthercatError::Sequence("fragment belongs to an other frame"))}
            if usize::from(fragment.info.size_offset().value()) * EOE_BLOCK_SIZE != self.buffer.len()
                {return self.abandon(stack, EthercatError::Sequence("fragment offset does not match received data"))}
        }
        if self.buffer.extend_from_slice(fragment.data).is_err()
            {return self.abandon(stack, EthercatError::Capacity("ethernet frame too big"))}
        self.expected = number + 1;
        trace!("eoe fragment {} of frame {}, {} bytes", number, self.frame, self.buffer.len());

        if info.last_fragment() {
            if self.buffer.is_empty()
                {return self.abandon(stack, EthercatError::Protocol("empty ethernet frame"))}
            if self.blocks != 0 && self.buffer.len().div_ceil(EOE_BLOCK_SIZE) != usize::from(self.blocks)
                {return self.abandon(stack, EthercatError::Sequence("frame size differs from announced size"))}
            self.timestamp = fragment.timestamp;
            self.state = EoeState::RxLastFragment;
            self.deliver(stack);
        }
        Ok(())
    }

    /// propose the completed frame to `stack`, return true if it was taken
    pub fn deliver<S: EthernetStack>(&mut self, stack: &mut S) -> bool {
        if self.state != EoeState::RxLastFragment
            {return false}
        if stack.receive(&self.buffer, self.timestamp) {
            debug!("eoe frame {} delivered, {} bytes", self.frame, self.buffer.len());
            self.reset();
            true
        }
        else {
            trace!("eoe frame {} kept for later delivery", self.frame);
            false
        }
    }

    fn abandon<S: EthernetStack>(&mut self, stack: &mut S, error: EthercatError) -> EthercatResult {
        warn!("eoe frame {} abandonned: {}", self.frame, error);
        self.reset();
        stack.abandoned(&error);
        Err(error)
    }
}

/**
    fragmentation of the ethernet frames sent to the master

    Every fragment but the last carries a multiple of [EOE_BLOCK_SIZE] bytes, since the offset of the following fragment is expressed in blocks.
*/
pub struct EoeTransmitter {
    state: EoeState,
    buffer: EthernetFrame,
    /// bytes of the buffer already sent
    sent: usize,
    /// next fragment number
    fragment: u8,
    /// number of the current frame, rolling over 4 bits
    frame: u8,
    max_fragment: usize,
}

impl EoeTransmitter {
    /// `max_fragment` is the maximum number of data bytes emitted in one fragment
    pub fn new(max_fragment: usize) -> Self {
        Self {
            state: EoeState::Idle,
            buffer: EthernetFrame::new(),
            sent: 0,
            fragment: 0,
            frame: 0,
            max_fragment,
        }
    }
    pub fn state(&self) -> EoeState  {self.state}
    /// true if fragments are waiting to be sent
    pub fn pending(&self) -> bool  {self.state == EoeState::TxFragment}
    /// abandon the frame being sent
    pub fn reset(&mut self) {
        self.state = EoeState::Idle;
        self.buffer.clear();
        self.sent = 0;
        self.fragment = 0;
    }

    /// start sending a frame, fails if a frame is already being sent
    pub fn send(&mut self, frame: &[u8]) -> EthercatResult {
        if self.pending()
            {return Err(EthercatError::Capacity("a frame is already being sent"))}
        if frame.is_empty()
            {return Err(EthercatError::Protocol("cannot send an empty frame"))}
        self.buffer.clear();
        self.buffer.extend_from_slice(frame)
            .map_err(|_| EthercatError::Capacity("ethernet frame too big"))?;
        self.start();
        Ok(())
    }

    /// start sending the frame the application writes in the buffer, return false if there was nothing to send
    fn pull<S: EthernetStack>(&mut self, stack: &mut S) -> bool {
        if self.pending()
            {return false}
        self.buffer.clear();
        // the buffer is fully initialized before the application writes into it
        if self.buffer.resize_default(MAX_ETHERNET_FRAME).is_err()
            {return false}
        match stack.transmit(&mut self.buffer) {
            Some(size) if size > 0 && size <= MAX_ETHERNET_FRAME => {
                self.buffer.truncate(size);
                self.start();
                true
            },
            Some(size) => {
                if size > MAX_ETHERNET_FRAME
                    {warn!("eoe frame from application is too big ({} bytes), dropped", size);}
                self.buffer.clear();
                false
            },
            None => {
                self.buffer.clear();
                false
            },
        }
    }

    fn start(&mut self) {
        self.state = EoeState::TxFragment;
        self.sent = 0;
        self.fragment = 0;
        self.frame = (self.frame + 1) & 0xf;
        debug!("eoe sending frame {}, {} bytes", self.frame, self.buffer.len());
    }

    /**
        write the next fragment as an EoE message in `dst`, return its size or `None` if no fragment is pending
    */
    pub fn next_fragment(&mut self, dst: &mut [u8]) -> EthercatResult<Option<usize>> {
        if ! self.pending()
            {return Ok(None)}
        let remaining = self.buffer.len() - self.sent;
        let capacity = self.max_fragment.min(dst.len().saturating_sub(EOE_HEADER_SIZE));
        let (size, last) = if remaining <= capacity
            {(remaining, true)}
        else
            {((capacity / EOE_BLOCK_SIZE) * EOE_BLOCK_SIZE, false)};
        if size == 0
            {return Err(EthercatError::Capacity("mailbox too small for an EoE fragment"))}

        let size_offset = if self.fragment == 0
            {self.buffer.len().div_ceil(EOE_BLOCK_SIZE)}
        else
            {self.sent / EOE_BLOCK_SIZE};
        let message = EoeMessage::fragment(EoeFragment {
                info: EoeFragmentInfo::new(
                    u6::new(self.fragment),
                    u6::new(size_offset as u8),
                    u4::new(self.frame),
                    ),
                data: &self.buffer[self.sent ..][.. size],
                timestamp: None,
            }, last);
        let written = message.pack(dst)?;
        trace!("eoe fragment {} of frame {} sent, {} bytes", self.fragment, self.frame, size);

        self.sent += size;
        self.fragment += 1;
        if last {
            debug!("eoe frame {} sent", self.frame);
            self.reset();
        }
        Ok(Some(written))
    }
}


/**
    EoE service of the slave

    It owns one state machine per direction, and the ip parameters and address filter last set by the master.
*/
pub struct Eoe {
    rx: EoeReceiver,
    tx: EoeTransmitter,
    parameters: IpParameters,
    filter: AddressFilter,
}

impl Eoe {
    pub fn new(config: &MailboxConfig) -> Self {
        Self {
            rx: EoeReceiver::new(config.eoe_fragment_size),
            tx: EoeTransmitter::new(config.eoe_fragment_size),
            parameters: IpParameters::default(),
            filter: AddressFilter::default(),
        }
    }
    pub fn rx_state(&self) -> EoeState  {self.rx.state()}
    pub fn tx_state(&self) -> EoeState  {self.tx.state()}
    /// ip parameters accepted so far
    pub fn parameters(&self) -> &IpParameters  {&self.parameters}
    /// address filter last accepted
    pub fn filter(&self) -> &AddressFilter  {&self.filter}
    /// true if more fragments are waiting to be sent
    pub fn pending(&self) -> bool  {self.tx.pending()}

    /// abandon the frame being received, as a watchdog would do
    pub fn reset_rx<S: EthernetStack>(&mut self, stack: &mut S) {
        if self.rx.state() == EoeState::RxFragment {
            let error = EthercatError::Timeout("no fragment received in time");
            warn!("eoe reception abandonned: {}", error);
            stack.abandoned(&error);
        }
        self.rx.reset();
    }
    /// start sending a frame to the master
    pub fn send(&mut self, frame: &[u8]) -> EthercatResult  {self.tx.send(frame)}

    /**
        process an EoE message received from the master, and write the EoE reply in `reply` if any.

        Errors are reported for messages that cannot be answered with an EoE response.
    */
    pub fn receive<S: EthernetStack>(&mut self, request: &[u8], stack: &mut S, reply: &mut [u8]) -> EthercatResult<Option<usize>> {
        // an unsupported frame type comes out as a service error
        let message = EoeMessage::unpack(request)
            .map_err(|e| e.map(|_| ()))?;
        trace!("eoe {:?}", message.body.frame_type());

        let answer = match message.body {
            EoeBody::Fragment(fragment) => {
                self.rx.receive(&message.info, &fragment, stack)?;
                return Ok(None)
            },
            EoeBody::SetIpRequest(parameters) => {
                // this request also (re)initializes the virtual port
                self.reset_rx(stack);
                let result = match stack.set_ip(&parameters) {
                    Ok(()) => {
                        self.parameters.merge(&parameters);
                        EoeResult::Success
                    },
                    Err(code) => code,
                };
                EoeBody::SetIpResponse(result)
            },
            EoeBody::GetIpRequest => EoeBody::GetIpResponse(EoeResult::Success, self.parameters.clone()),
            EoeBody::SetFilterRequest(filter) => {
                let result = match stack.set_filter(&filter) {
                    Ok(()) => {
                        self.filter = filter;
                        EoeResult::Success
                    },
                    Err(code) => code,
                };
                EoeBody::SetFilterResponse(result)
            },
            EoeBody::GetFilterRequest => EoeBody::GetFilterResponse(EoeResult::Success, self.filter.clone()),
            _ => return Err(EthercatError::Protocol("EoE response or timestamp received from master")),
        };
        if let EoeBody::SetIpResponse(code) | EoeBody::SetFilterResponse(code) = answer {
            if code != EoeResult::Success
                {warn!("eoe request refused: {}", code);}
        }
        Ok(Some(EoeMessage::new(answer).pack(reply)?))
    }

    /**
        give the pending frame to the application if any, and write the next fragment to send in `dst` if any.

        When no frame is being sent, a new one is requested to the application.
        This should be called once per mailbox cycle.
    */
    pub fn poll<S: EthernetStack>(&mut self, stack: &mut S, dst: &mut [u8]) -> EthercatResult<Option<usize>> {
        self.rx.deliver(stack);
        if ! self.tx.pending()
            {self.tx.pull(stack);}
        self.tx.next_fragment(dst)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let message = EoeMessage::fragment(EoeFragment {
                info: EoeFragmentInfo::new(u6::new(1), u6::new(3), u4::new(5)),
                data: &[0xaa, 0xbb],
                timestamp: None,
            }, true);
        let mut buffer = [0; 16];
        let size = message.pack(&mut buffer).unwrap();
        assert_eq!(&buffer[.. size], &[0x00, 0x01, 0xc1, 0x50, 0xaa, 0xbb]);
        assert_eq!(EoeMessage::unpack(&buffer[.. size]).unwrap(), message);
    }

    #[test]
    fn ip_parameters_layout() {
        let parameters = IpParameters {
            ip: Some(Ipv4Addr::new(192, 168, 0, 10)),
            .. Default::default()
        };
        let mut buffer = [0xff; 80];
        let size = EoeMessage::new(EoeBody::SetIpRequest(parameters.clone())).pack(&mut buffer).unwrap();
        assert_eq!(size, EOE_HEADER_SIZE + 4 + 6 + 4*4 + DNS_NAME_LENGTH);
        assert_eq!(&buffer[4 .. 8], &[0x02, 0, 0, 0]);
        assert_eq!(&buffer[8 .. 14], &[0; 6]);
        assert_eq!(&buffer[14 .. 18], &[0x0a, 0x00, 0xa8, 0xc0]);

        match EoeMessage::unpack(&buffer[.. size]).unwrap().body {
            EoeBody::SetIpRequest(back) => assert_eq!(back, parameters),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn unknown_frame_type() {
        assert_eq!(
            EoeMessage::unpack(&[0x0c, 0x01, 0, 0]),
            Err(EthercatError::Service(EoeResult::UnsupportedFrameType)),
            );
    }
}
