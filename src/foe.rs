/*!
    implementation of FoE (File over Ethercat), slave side.

    Files are stored in a [FileSystem], which is shared by two users:

    - the master, through the mailbox ([Foe::receive]). It can write a file to the slave (firmware, configuration) or read a file the slave has committed.
    - the slave application, through the control channel ([Foe::command]). It reads the files written by the master and writes the files to commit.

    A master write is a sequence of data packets, each acknowledged by the slave. The transfer ends with a packet shorter than the maximum packet size. A master read is symmetric, the master acknowledging every data packet of the slave.

    ```text
    master                   slave
    write(name) ------------->
                <------------- ack(0)
    data(1) ----------------->
                <------------- ack(1)
    data(2, short) ---------->
                <------------- ack(2)       file ready
    ```
*/

use crate::{
	data::{self, Cursor},
	error::{EthercatError, EthercatResult},
	config::MailboxConfig,
	mailbox::MAILBOX_HEADER_SIZE,
	foefs::{FileSystem, FileHandle, FileError, FileName, FileBlock, FileDirection, OpenMode, Whence, FOE_BLOCK_SIZE, file_name},
	};
use bilge::prelude::*;
use log::{debug, trace, warn};


/// byte size of the header preceding every FoE packet: opcode, reserved byte and a 4 bytes field
pub const FOE_HEADER_SIZE: usize = 6;

/// ETG.1000.6 table 92
#[bitsize(8)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum FoeOpCode {
    Read = 0x1,
    Write = 0x2,
    Data = 0x3,
    Ack = 0x4,
    Abort = 0x5,
    Busy = 0x6,
}
data::bilge_pdudata!(FoeOpCode, u8);

/// ETG.1000.6 table 97
#[bitsize(32)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FoeError {
    #[error("not defined")]
    NotDefined = 0x8000,
    #[error("not found")]
    NotFound = 0x8001,
    #[error("access denied")]
    AccessDenied = 0x8002,
    #[error("disk full")]
    DiskFull = 0x8003,
    #[error("illegal")]
    Illegal = 0x8004,
    #[error("packet number wrong")]
    PacketNumberWrong = 0x8005,
    #[error("already exists")]
    AlreadyExists = 0x8006,
    #[error("no user")]
    NoUser = 0x8007,
    #[error("bootstrap only")]
    BootstrapOnly = 0x8008,
    #[error("not bootstrap")]
    NotBootstrap = 0x8009,
    #[error("no rights")]
    NoRights = 0x800a,
    #[error("program error")]
    ProgramError = 0x800b,
}
data::bilge_pdudata!(FoeError, u32);

impl From<FileError> for FoeError {
    fn from(src: FileError) -> Self {
        match src {
            FileError::NotFound => FoeError::NotFound,
            FileError::AccessDenied => FoeError::AccessDenied,
            FileError::Busy => FoeError::AccessDenied,
            FileError::TableFull => FoeError::DiskFull,
            FileError::Capacity => FoeError::DiskFull,
            FileError::NameTooLong => FoeError::Illegal,
            FileError::InvalidOffset => FoeError::Illegal,
            FileError::InvalidHandle => FoeError::ProgramError,
        }
    }
}

/// a decoded FoE packet
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FoePacket<'a> {
    /// the master requests to read a file
    Read {password: u32, name: &'a str},
    /// the master requests to write a file
    Write {password: u32, name: &'a str},
    Data {packet: u32, data: &'a [u8]},
    Ack {packet: u32},
    Error {code: FoeError, text: &'a str},
    Busy {done: u16, entire: u16},
}

impl<'a> FoePacket<'a> {
    pub fn unpack(src: &'a [u8]) -> EthercatResult<Self> {
        let mut frame = Cursor::new(src);
        let opcode = FoeOpCode::try_from(frame.unpack::<u8>()?)
            .map_err(|_| EthercatError::Protocol("unknown FoE opcode"))?;
        frame.unpack::<u8>()?;
        let text = |bytes: &'a [u8]| core::str::from_utf8(bytes)
            .map_err(|_| EthercatError::<()>::Protocol("FoE text is not utf8"));
        Ok(match opcode {
            FoeOpCode::Read => Self::Read {
                password: frame.unpack()?,
                name: text(frame.remain())?,
            },
            FoeOpCode::Write => Self::Write {
                password: frame.unpack()?,
                name: text(frame.remain())?,
            },
            FoeOpCode::Data => Self::Data {
                packet: frame.unpack()?,
                data: frame.remain(),
            },
            FoeOpCode::Ack => Self::Ack {
                packet: frame.unpack()?,
            },
            FoeOpCode::Abort => Self::Error {
                code: FoeError::try_from(frame.unpack::<u32>()?)
                    .unwrap_or(FoeError::NotDefined),
                text: text(frame.remain()).unwrap_or_default(),
            },
            FoeOpCode::Busy => Self::Busy {
                done: frame.unpack()?,
                entire: frame.unpack()?,
            },
        })
    }

    /// write the packet in `dst`, return the number of bytes written
    pub fn pack(&self, dst: &mut [u8]) -> EthercatResult<usize> {
        let mut frame = Cursor::new(dst);
        frame.pack(&self.opcode())?;
        frame.pack(&0u8)?;
        match *self {
            Self::Read {password, name}
            | Self::Write {password, name} => {
                frame.pack(&password)?;
                frame.write(name.as_bytes())?;
            },
            Self::Data {packet, data} => {
                frame.pack(&packet)?;
                frame.write(data)?;
            },
            Self::Ack {packet} => frame.pack(&packet)?,
            Self::Error {code, text} => {
                frame.pack(&code)?;
                frame.write(text.as_bytes())?;
            },
            Self::Busy {done, entire} => {
                frame.pack(&done)?;
                frame.pack(&entire)?;
            },
        }
        Ok(frame.position())
    }

    pub fn opcode(&self) -> FoeOpCode {
        match self {
            Self::Read {..} => FoeOpCode::Read,
            Self::Write {..} => FoeOpCode::Write,
            Self::Data {..} => FoeOpCode::Data,
            Self::Ack {..} => FoeOpCode::Ack,
            Self::Error {..} => FoeOpCode::Abort,
            Self::Busy {..} => FoeOpCode::Busy,
        }
    }
}


/// commands of the control channel, sent by the slave application
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FoeCommand {
    /// open a file, it becomes the current file of the channel
    Open(FileName, OpenMode),
    /// read up to the given number of bytes from the current file
    Read(usize),
    /// write bytes to the current file
    Write(FileBlock),
    /// close the current file
    Close,
    /// set the absolute position in the current file
    Seek(usize),
    /// erase all files
    Free,
}

/// replies of the control channel
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FoeReply {
    Ack,
    Error(FileError),
    Data(FileBlock),
    /// a file has been completely written by the master
    Ready(FileName),
}

impl FoeCommand {
    /// numeric code of the command
    pub fn code(&self) -> u8 {
        match self {
            Self::Open(..) => 10,
            Self::Read(_) => 11,
            Self::Write(_) => 12,
            Self::Close => 13,
            Self::Seek(_) => 14,
            Self::Free => 15,
        }
    }
}
impl FoeReply {
    /// numeric code of the reply
    pub fn code(&self) -> u8 {
        match self {
            Self::Ack => 20,
            Self::Error(_) => 21,
            Self::Data(_) => 22,
            Self::Ready(_) => 30,
        }
    }
}


/// transfer in progress with the master
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Transfer {
    Idle,
    /// the master is writing a file, `packet` is the last packet acknowledged
    Receiving {file: FileHandle, packet: u32},
    /// the master is reading a file, `packet` is the last packet sent
    Sending {file: FileHandle, packet: u32, last: bool},
}

/**
    FoE service of the slave, owning the file system

    `N` is the number of entries of the file system
*/
pub struct Foe<const N: usize = 1> {
    fs: FileSystem<N>,
    transfer: Transfer,
    /// current file of the control channel
    channel: Option<FileHandle>,
    /// files completely written by the master, not yet reported to the application
    ready: heapless::Deque<FileName, N>,
    /// maximum data bytes in one packet
    packet_size: usize,
}

impl<const N: usize> Foe<N> {
    pub fn new(config: &MailboxConfig) -> Self {
        Self {
            fs: FileSystem::new(),
            transfer: Transfer::Idle,
            channel: None,
            ready: heapless::Deque::new(),
            packet_size: config.mailbox_size
                .saturating_sub(MAILBOX_HEADER_SIZE + FOE_HEADER_SIZE)
                .min(FOE_BLOCK_SIZE),
        }
    }
    pub fn filesystem(&self) -> &FileSystem<N>  {&self.fs}
    pub fn filesystem_mut(&mut self) -> &mut FileSystem<N>  {&mut self.fs}
    /// true if a transfer with the master is in progress
    pub fn busy(&self) -> bool  {self.transfer != Transfer::Idle}

    /// name of a file the master finished writing, each file is reported once
    pub fn take_ready(&mut self) -> Option<FileName> {
        self.ready.pop_front()
    }

    /**
        process a FoE packet from the master and write the answer packet in `reply`, returning its size.

        Failures of the file system are answered with FoE error packets, only undecodable packets fail this function.
    */
    pub fn receive(&mut self, request: &[u8], reply: &mut [u8]) -> EthercatResult<Option<usize>> {
        let packet = FoePacket::unpack(request)?;
        trace!("foe {:?}", packet.opcode());
        let answer = match packet {
            FoePacket::Write {password, name} => self.start_write(password, name, reply),
            FoePacket::Read {password, name} => self.start_read(password, name, reply),
            FoePacket::Data {packet, data} => self.receive_data(packet, data, reply),
            FoePacket::Ack {packet} => self.receive_ack(packet, reply),
            FoePacket::Error {code, text} => {
                warn!("foe transfer aborted by master: {} {:?}", code, text);
                self.abort();
                return Ok(None)
            },
            FoePacket::Busy {..} => Err(FoeError::Illegal),
        };
        match answer {
            Ok(size) => Ok(size),
            Err(code) => {
                warn!("foe error answered: {}", code);
                self.abort();
                let mut text = heapless::String::<32>::new();
                // error text is informative, a truncated text is not an error
                let _ = core::fmt::write(&mut text, format_args!("{}", code));
                FoePacket::Error {code, text: text.as_str()}.pack(reply).map(Some)
            },
        }
    }

    fn start_write(&mut self, password: u32, name: &str, reply: &mut [u8]) -> Result<Option<usize>, FoeError> {
        if self.busy() {
            warn!("foe new transfer interrupts the current one");
            self.abort();
        }
        trace!("foe write password {:#x}", password);
        let file = self.fs.open(name, OpenMode::ReadWrite)?;
        let prepared = self.fs.truncate(file)
            .and_then(|_| self.fs.set_direction(file, FileDirection::Request));
        if let Err(error) = prepared {
            let _ = self.fs.close(file);
            return Err(error.into())
        }
        debug!("foe master writing {:?}", name);
        self.transfer = Transfer::Receiving {file, packet: 0};
        ack(0, reply)
    }

    fn start_read(&mut self, password: u32, name: &str, reply: &mut [u8]) -> Result<Option<usize>, FoeError> {
        if self.busy() {
            warn!("foe new transfer interrupts the current one");
            self.abort();
        }
        trace!("foe read password {:#x}", password);
        let file = self.fs.open(name, OpenMode::ReadOnly)?;
        debug!("foe master reading {:?}", name);
        self.transfer = Transfer::Sending {file, packet: 0, last: false};
        self.send_data(reply)
    }

    fn receive_data(&mut self, packet: u32, data: &[u8], reply: &mut [u8]) -> Result<Option<usize>, FoeError> {
        let Transfer::Receiving {file, packet: acknowledged} = self.transfer
            else {return Err(FoeError::Illegal)};
        if packet != acknowledged.wrapping_add(1)
            {return Err(FoeError::PacketNumberWrong)}
        if data.len() > self.packet_size
            {return Err(FoeError::Illegal)}
        self.fs.write(file, data)?;
        self.transfer = Transfer::Receiving {file, packet};

        if data.len() < self.packet_size {
            let name = file_name(self.fs.file(file)?.name())?;
            self.fs.close(file)?;
            self.transfer = Transfer::Idle;
            debug!("foe file {:?} received", name);
            if self.ready.push_back(name).is_err()
                {warn!("foe ready notification lost, too many files pending");}
        }
        ack(packet, reply)
    }

    fn receive_ack(&mut self, packet: u32, reply: &mut [u8]) -> Result<Option<usize>, FoeError> {
        let Transfer::Sending {file, packet: sent, last} = self.transfer
            else {return Err(FoeError::Illegal)};
        if packet != sent
            {return Err(FoeError::PacketNumberWrong)}
        if last {
            self.fs.close(file)?;
            self.transfer = Transfer::Idle;
            debug!("foe file sent");
            return Ok(None)
        }
        self.send_data(reply)
    }

    fn send_data(&mut self, reply: &mut [u8]) -> Result<Option<usize>, FoeError> {
        let Transfer::Sending {file, packet, ..} = self.transfer
            else {return Err(FoeError::ProgramError)};
        // a packet shorter than the packet size ends the file for the master, so every packet must have room for a full one
        if reply.len() < FOE_HEADER_SIZE + self.packet_size {
            warn!("foe reply buffer of {} bytes cannot hold a data packet", reply.len());
            return Err(FoeError::ProgramError)
        }
        let (header, data) = reply.split_at_mut(FOE_HEADER_SIZE);
        let size = self.fs.read(file, &mut data[.. self.packet_size])?;
        let packet = packet.wrapping_add(1);
        self.transfer = Transfer::Sending {file, packet, last: size < self.packet_size};

        let mut frame = Cursor::new(header);
        frame.pack(&FoeOpCode::Data)
            .and_then(|_| frame.pack(&0u8))
            .and_then(|_| frame.pack(&packet))
            .map_err(|_| FoeError::ProgramError)?;
        trace!("foe data packet {}, {} bytes", packet, size);
        Ok(Some(FOE_HEADER_SIZE + size))
    }

    fn abort(&mut self) {
        match self.transfer {
            Transfer::Receiving {file, ..} => {
                // a partially received file is not kept
                let _ = self.fs.truncate(file);
                let _ = self.fs.close(file);
            },
            Transfer::Sending {file, ..} => {
                let _ = self.fs.close(file);
            },
            Transfer::Idle => {},
        }
        self.transfer = Transfer::Idle;
    }

    /// execute a command of the control channel
    pub fn command(&mut self, command: FoeCommand) -> FoeReply {
        trace!("foe command {}", command.code());
        let result = match command {
            FoeCommand::Open(name, mode) => {
                if let Some(file) = self.channel.take()
                    {let _ = self.fs.close(file);}
                self.fs.open(&name, mode).map(|file| {
                    self.channel = Some(file);
                    FoeReply::Ack
                })
            },
            FoeCommand::Read(size) => self.channel_file().and_then(|file| {
                let mut data = FileBlock::new();
                data.resize(size.min(FOE_BLOCK_SIZE), 0).map_err(|_| FileError::Capacity)?;
                let read = self.fs.read(file, &mut data)?;
                data.truncate(read);
                Ok(FoeReply::Data(data))
            }),
            FoeCommand::Write(data) => self.channel_file()
                .and_then(|file| self.fs.write(file, &data))
                .map(|_| FoeReply::Ack),
            FoeCommand::Close => self.channel_file()
                .and_then(|file| self.fs.close(file))
                .map(|_| {
                    self.channel = None;
                    FoeReply::Ack
                }),
            FoeCommand::Seek(position) => self.channel_file()
                .and_then(|file| self.fs.seek(
                    file,
                    isize::try_from(position).map_err(|_| FileError::InvalidOffset)?,
                    Whence::Set,
                    ))
                .map(|_| FoeReply::Ack),
            FoeCommand::Free => {
                self.abort();
                self.channel = None;
                self.ready.clear();
                self.fs.format();
                Ok(FoeReply::Ack)
            },
        };
        result.unwrap_or_else(|error| {
            warn!("foe command failed: {}", error);
            FoeReply::Error(error)
        })
    }

    fn channel_file(&self) -> Result<FileHandle, FileError> {
        self.channel.ok_or(FileError::InvalidHandle)
    }
}

fn ack(packet: u32, reply: &mut [u8]) -> Result<Option<usize>, FoeError> {
    FoePacket::Ack {packet}.pack(reply)
        .map(Some)
        .map_err(|_| FoeError::ProgramError)
}
