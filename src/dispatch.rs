/*!
    routing of the mailbox messages to the protocols implemented by this slave.

    The [Dispatcher] is the only entry point of the mailbox layer: every message written by the master in the receive mailbox is passed to [Dispatcher::dispatch], and the transport copies the reply (if any) to the send mailbox. Between messages, [Dispatcher::poll] gives the transport the outbound EoE fragments.

    Nothing received can make the dispatcher fail: malformed or unsupported messages are answered with a mailbox error frame, and errors of the protocols are answered with their own error codes.
*/

use crate::{
	config::MailboxConfig,
	mailbox::{MailboxFrame, MailboxHeader, MailboxType, MailboxError, MailboxErrorFrame, MailboxCounter, MAILBOX_HEADER_SIZE, MAX_MAILBOX_SIZE},
	coe::{Can, Dictionary},
	eoe::{Eoe, EthernetStack},
	foe::{Foe, FoeCommand, FoeReply},
	foefs::FileName,
	data::{PduData, Cursor},
	error::EthercatResult,
	};
use bilge::prelude::*;
use log::{debug, trace, warn};


/// smallest mailbox able to carry an error frame
const MIN_MAILBOX_SIZE: usize = MAILBOX_HEADER_SIZE + 4;

/**
    mailbox dispatcher of a slave

    It owns the protocol processors and the application collaborators they talk to:

    - `D` answers CoE requests, see [Dictionary]
    - `E` exchanges ethernet frames, see [EthernetStack]
    - `N` is the number of files in the FoE file system

    Duplicated messages (a message with the same nonzero counter as the previous one, as sent by a master repeating a message whose reply was lost) are not executed again, the previous reply is sent again instead.
*/
pub struct Dispatcher<D: Dictionary, E: EthernetStack, const N: usize = 1> {
    config: MailboxConfig,
    can: Can<D>,
    eoe: Eoe,
    ethernet: E,
    foe: Foe<N>,
    /// counter of the messages sent by this slave
    counter: MailboxCounter,
    /// counter of the last message received, none if it had no counter
    last: Option<u8>,
    /// reply sent to the last message received, empty if there was none
    cache: heapless::Vec<u8, MAX_MAILBOX_SIZE>,
}

impl<D: Dictionary, E: EthernetStack, const N: usize> Dispatcher<D, E, N> {
    pub fn new(config: MailboxConfig, dictionary: D, ethernet: E) -> Self {
        Self {
            can: Can::new(dictionary),
            eoe: Eoe::new(&config),
            ethernet,
            foe: Foe::new(&config),
            counter: MailboxCounter::new(),
            last: None,
            cache: heapless::Vec::new(),
            config,
        }
    }
    pub fn config(&self) -> &MailboxConfig  {&self.config}
    pub fn dictionary(&mut self) -> &mut D  {self.can.dictionary()}
    pub fn ethernet(&mut self) -> &mut E  {&mut self.ethernet}
    pub fn eoe(&self) -> &Eoe  {&self.eoe}
    pub fn foe(&mut self) -> &mut Foe<N>  {&mut self.foe}

    /**
        process a message received from the master, and write the reply to send in `reply`

        return the size of the reply, or `None` if there is nothing to answer. The reply never exceeds [MailboxConfig::mailbox_size].
    */
    pub fn dispatch(&mut self, frame: &[u8], reply: &mut [u8]) -> Option<usize> {
        let size = reply.len().min(self.config.mailbox_size);
        let reply = &mut reply[.. size];
        if reply.len() < MIN_MAILBOX_SIZE {
            warn!("mailbox reply buffer too small ({} bytes), message ignored", reply.len());
            return None
        }

        let message = match MailboxFrame::unpack(frame, self.config.strict_length) {
            Ok(message) => message,
            Err(error) => {
                warn!("mailbox message rejected: {:?}", error);
                let header = MailboxHeader::unpack(frame).ok();
                return self.error(header.as_ref(), error, reply)
            },
        };
        trace!("mailbox received {:?}", message.header);

        let count = message.header.count().value();
        if count != 0 && self.last == Some(count) {
            let cached = self.cache.len();
            if cached != 0 && cached <= reply.len() {
                warn!("mailbox message {} repeated, previous reply sent again", count);
                reply[.. cached].copy_from_slice(&self.cache);
                return Some(cached)
            }
            warn!("mailbox message {} repeated, ignored", count);
            return None
        }
        self.last = if count != 0 {Some(count)} else {None};

        let answer = self.route(&message, reply);
        self.cache.clear();
        if let Some(size) = answer {
            if self.cache.extend_from_slice(&reply[.. size]).is_err() {
                self.cache.clear();
                debug!("mailbox reply of {} bytes too big to be sent again", size);
            }
        }
        answer
    }

    fn route(&mut self, message: &MailboxFrame, reply: &mut [u8]) -> Option<usize> {
        let protocol = match message.header.protocol() {
            Ok(protocol) => protocol,
            Err(error) => {
                warn!("mailbox protocol {} not supported", message.header.ty());
                return self.error(Some(&message.header), error, reply)
            },
        };
        let (_, body) = reply.split_at_mut(MAILBOX_HEADER_SIZE);
        let answer: EthercatResult<Option<usize>> = match protocol {
            MailboxType::Can => self.can.receive(message.data, body).map(Some),
            MailboxType::Ethernet => self.eoe.receive(message.data, &mut self.ethernet, body),
            MailboxType::File => self.foe.receive(message.data, body),
            MailboxType::Exception => {
                match MailboxErrorFrame::unpack(message.data) {
                    Ok(frame) => warn!("mailbox error reported by master: {:?}", frame.detail()),
                    Err(_) => warn!("undecodable mailbox error reported by master"),
                }
                Ok(None)
            },
            MailboxType::Servo
            | MailboxType::Specific
            | MailboxType::Ads => {
                debug!("mailbox {:?} message accepted, protocol not implemented", protocol);
                Ok(None)
            },
        };
        match answer {
            Ok(Some(size)) => self.reply(Some(&message.header), protocol, size, reply),
            Ok(None) => None,
            Err(error) => {
                warn!("mailbox {:?} message failed: {}", protocol, error);
                self.error(Some(&message.header), MailboxError::from(error), reply)
            },
        }
    }

    /**
        write the next message the slave has to send on its own initiative, if any

        This should be called once per mailbox cycle, when the send mailbox is free. It is also the moment a received ethernet frame refused by the application is proposed again.
    */
    pub fn poll(&mut self, reply: &mut [u8]) -> Option<usize> {
        let size = reply.len().min(self.config.mailbox_size);
        let reply = &mut reply[.. size];
        if reply.len() < MIN_MAILBOX_SIZE
            {return None}
        let (_, body) = reply.split_at_mut(MAILBOX_HEADER_SIZE);
        match self.eoe.poll(&mut self.ethernet, body) {
            Ok(Some(size)) => self.reply(None, MailboxType::Ethernet, size, reply),
            Ok(None) => None,
            Err(error) => {
                warn!("eoe fragment not sent: {}", error);
                None
            },
        }
    }

    /// true if outbound fragments are waiting for [Self::poll]
    pub fn pending(&self) -> bool  {self.eoe.pending()}

    /// abandon the ethernet frame being received
    pub fn reset_eoe_rx(&mut self) {
        self.eoe.reset_rx(&mut self.ethernet);
    }

    /// execute a command of the FoE control channel
    pub fn foe_command(&mut self, command: FoeCommand) -> FoeReply {
        self.foe.command(command)
    }
    /// name of a file the master finished writing
    pub fn foe_ready(&mut self) -> Option<FileName> {
        self.foe.take_ready()
    }

    /// write the mailbox header in front of a body already written in `reply`
    fn reply(&mut self, request: Option<&MailboxHeader>, protocol: MailboxType, size: usize, reply: &mut [u8]) -> Option<usize> {
        let Ok(length) = u16::try_from(size)
            else {return self.error(request, MailboxError::NoMoreMemory, reply)};
        let count = self.counter.next();
        let header = match request {
            Some(request) => request.reply(protocol, length, count),
            None => MailboxHeader::message(protocol, length, 0, u2::new(0), count),
        };
        if header.pack(reply).is_err()
            {return None}
        trace!("mailbox reply {:?}", header);
        Some(MAILBOX_HEADER_SIZE + size)
    }

    /// write a mailbox error frame in `reply`
    fn error(&mut self, request: Option<&MailboxHeader>, detail: MailboxError, reply: &mut [u8]) -> Option<usize> {
        let body = MailboxErrorFrame::error(detail);
        let length = MailboxErrorFrame::packed_size() as u16;
        let count = self.counter.next();
        let header = match request {
            Some(request) => request.reply(MailboxType::Exception, length, count),
            None => MailboxHeader::message(MailboxType::Exception, length, 0, u2::new(0), count),
        };
        let mut frame = Cursor::new(reply);
        frame.pack(&header).ok()?;
        frame.pack(&body).ok()?;
        Some(frame.position())
    }
}
