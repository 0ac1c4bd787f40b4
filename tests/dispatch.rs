use std::collections::VecDeque;
use bilge::prelude::*;
use etherslave::{
    Dispatcher, MailboxConfig, PduData, TypeId,
    mailbox::*,
    coe::{CanError, CoeRequest, CoeReply, Dictionary, ObjectAddress},
    eoe::{EthernetStack, EoeMessage, EoeBody, EoeState},
    foe::FoePacket,
    };

/// dictionary with a single u16 entry at 0x6040, counting its accesses
#[derive(Default)]
struct Counting {
    value: [u8; 2],
    accesses: usize,
}
impl Dictionary for Counting {
    fn get(&mut self, address: ObjectAddress, dst: &mut [u8]) -> Result<usize, CanError> {
        self.accesses += 1;
        if address != ObjectAddress::new(0x6040, 0)
            {return Err(CanError::Unknown)}
        dst[.. 2].copy_from_slice(&self.value);
        Ok(2)
    }
    fn set(&mut self, address: ObjectAddress, value: &[u8]) -> Result<(), CanError> {
        self.accesses += 1;
        if address != ObjectAddress::new(0x6040, 0)
            {return Err(CanError::Unknown)}
        self.value = value.try_into().map_err(|_| CanError::Generic)?;
        Ok(())
    }
    fn object_type(&mut self, _address: ObjectAddress) -> Result<TypeId, CanError> {
        self.accesses += 1;
        Ok(TypeId::U16)
    }
    fn max_subindex(&mut self, _index: u16) -> Result<u8, CanError> {
        self.accesses += 1;
        Ok(0)
    }
}

#[derive(Default)]
struct Frames {
    received: Vec<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}
impl EthernetStack for Frames {
    fn receive(&mut self, frame: &[u8], _timestamp: Option<u32>) -> bool {
        self.received.push(frame.to_vec());
        true
    }
    fn transmit(&mut self, dst: &mut [u8]) -> Option<usize> {
        let frame = self.outgoing.pop_front()?;
        dst[.. frame.len()].copy_from_slice(&frame);
        Some(frame.len())
    }
}

type Slave = Dispatcher<Counting, Frames>;

fn slave() -> Slave {
    let _ = env_logger::builder().is_test(true).try_init();
    Dispatcher::new(MailboxConfig::default(), Counting::default(), Frames::default())
}

/// a complete mailbox message
fn message(ty: MailboxType, count: u8, body: &[u8]) -> Vec<u8> {
    let header = MailboxHeader::message(ty, body.len() as u16, 0x1001, u2::new(0), u3::new(count));
    let mut buffer = vec![0; MAILBOX_HEADER_SIZE + body.len()];
    MailboxFrame {header, data: body}.pack(&mut buffer).unwrap();
    buffer
}

fn coe(request: CoeRequest, count: u8) -> Vec<u8> {
    let mut body = [0; 32];
    let size = request.pack(&mut body).unwrap();
    message(MailboxType::Can, count, &body[.. size])
}

/// dispatch a message and return the reply header and body
fn exchange(slave: &mut Slave, message: &[u8]) -> Option<(MailboxHeader, Vec<u8>)> {
    let mut reply = [0; 128];
    let size = slave.dispatch(message, &mut reply)?;
    let frame = MailboxFrame::unpack(&reply[.. size], true).unwrap();
    Some((frame.header, frame.data.to_vec()))
}

fn error_detail(body: &[u8]) -> MailboxError {
    let frame = MailboxErrorFrame::unpack(body).unwrap();
    assert_eq!(frame.ty(), MAILBOX_ERROR_SERVICE);
    frame.detail()
}

#[test]
fn coe_routing() {
    let mut slave = slave();
    let control = ObjectAddress::new(0x6040, 0);

    let (header, body) = exchange(&mut slave, &coe(CoeRequest::SetObject(control, &[0x0f, 0]), 1)).unwrap();
    assert_eq!(header.protocol(), Ok(MailboxType::Can));
    assert_eq!(header.address(), 0x1001);
    assert_eq!(header.length() as usize, body.len());
    assert_eq!(CoeReply::unpack(&body).unwrap().result, Ok(&[][..]));

    let (_, body) = exchange(&mut slave, &coe(CoeRequest::GetObject(control), 2)).unwrap();
    assert_eq!(CoeReply::unpack(&body).unwrap().result, Ok(&[0x0f, 0][..]));

    // nothing else was touched
    assert_eq!(slave.eoe().rx_state(), EoeState::Idle);
    assert_eq!(slave.eoe().tx_state(), EoeState::Idle);
    assert!(! slave.foe().busy());
    assert!(slave.ethernet().received.is_empty());
}

#[test]
fn unknown_type() {
    let mut slave = slave();
    let mut raw = coe(CoeRequest::GetObject(ObjectAddress::new(0x6040, 0)), 1);
    raw[5] = (raw[5] & 0xf0) | 0x6;

    let (header, body) = exchange(&mut slave, &raw).unwrap();
    assert_eq!(header.protocol(), Ok(MailboxType::Exception));
    assert_eq!(error_detail(&body), MailboxError::UnsupportedProtocol);
    assert_eq!(slave.dictionary().accesses, 0);
    assert_eq!(slave.eoe().rx_state(), EoeState::Idle);
    assert!(! slave.foe().busy());
}

#[test]
fn length_mismatch() {
    let mut slave = slave();
    let mut raw = coe(CoeRequest::GetObject(ObjectAddress::new(0x6040, 0)), 1);

    let (_, body) = exchange(&mut slave, &raw[.. raw.len() - 1]).unwrap();
    assert_eq!(error_detail(&body), MailboxError::SizeTooShort);

    raw.push(0);
    let (_, body) = exchange(&mut slave, &raw).unwrap();
    assert_eq!(error_detail(&body), MailboxError::InvalidSize);

    let (_, body) = exchange(&mut slave, &raw[.. 3]).unwrap();
    assert_eq!(error_detail(&body), MailboxError::SizeTooShort);
    assert_eq!(slave.dictionary().accesses, 0);

    // padding is accepted when the length is not strict
    let mut slave = Dispatcher::<_, _, 1>::new(
        MailboxConfig::default().with_strict_length(false),
        Counting::default(),
        Frames::default(),
        );
    let (header, _) = exchange(&mut slave, &raw).unwrap();
    assert_eq!(header.protocol(), Ok(MailboxType::Can));
    assert_eq!(slave.dictionary().accesses, 1);
}

#[test]
fn duplicate() {
    let mut slave = slave();
    let set = coe(CoeRequest::SetObject(ObjectAddress::new(0x6040, 0), &[1, 0]), 3);

    let first = exchange(&mut slave, &set).unwrap();
    let second = exchange(&mut slave, &set).unwrap();
    assert_eq!(first, second);
    assert_eq!(slave.dictionary().accesses, 1);

    // a new counter is executed again
    let set = coe(CoeRequest::SetObject(ObjectAddress::new(0x6040, 0), &[1, 0]), 4);
    exchange(&mut slave, &set).unwrap();
    assert_eq!(slave.dictionary().accesses, 2);

    // messages without counter are never duplicates
    let set = coe(CoeRequest::SetObject(ObjectAddress::new(0x6040, 0), &[1, 0]), 0);
    exchange(&mut slave, &set).unwrap();
    exchange(&mut slave, &set).unwrap();
    assert_eq!(slave.dictionary().accesses, 4);

    // a repeated message that had no reply is not answered with an older reply
    let set = coe(CoeRequest::SetObject(ObjectAddress::new(0x6040, 0), &[2, 0]), 5);
    exchange(&mut slave, &set).unwrap();
    let servo = message(MailboxType::Servo, 6, &[1, 2]);
    assert_eq!(exchange(&mut slave, &servo), None);
    assert_eq!(exchange(&mut slave, &servo), None);
    assert_eq!(slave.dictionary().accesses, 5);

    // replies of any size up to the mailbox are sent again
    let mut slave = Dispatcher::<_, _, 1>::new(
        MailboxConfig::default().with_mailbox_size(1024),
        Counting::default(),
        Frames::default(),
        );
    let get = coe(CoeRequest::GetObject(ObjectAddress::new(0x6040, 0)), 1);
    let mut first = [0; 1024];
    let mut second = [0; 1024];
    let size = slave.dispatch(&get, &mut first).unwrap();
    assert_eq!(slave.dispatch(&get, &mut second), Some(size));
    assert_eq!(first[.. size], second[.. size]);
    assert_eq!(slave.dictionary().accesses, 1);
}

#[test]
fn reply_counter() {
    let mut slave = slave();
    let counts: Vec<u8> = (0 .. 9)
        .map(|i| {
            let get = coe(CoeRequest::GetObject(ObjectAddress::new(0x6040, 0)), i % 7 + 1);
            exchange(&mut slave, &get).unwrap().0.count().value()
        })
        .collect();
    assert_eq!(counts, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
}

#[test]
fn unimplemented_protocols() {
    let mut slave = slave();
    assert_eq!(exchange(&mut slave, &message(MailboxType::Servo, 1, &[1, 2, 3, 4])), None);
    assert_eq!(exchange(&mut slave, &message(MailboxType::Specific, 2, &[1, 2])), None);
    assert_eq!(exchange(&mut slave, &message(MailboxType::Ads, 3, &[])), None);
    assert_eq!(slave.dictionary().accesses, 0);
}

#[test]
fn coe_error() {
    let mut slave = slave();
    let (header, body) = exchange(&mut slave, &coe(CoeRequest::GetObject(ObjectAddress::new(0x1000, 0)), 1)).unwrap();
    assert_eq!(header.protocol(), Ok(MailboxType::Can));
    assert_eq!(CoeReply::unpack(&body).unwrap().result, Err(CanError::Unknown));

    // a truncated CoE body is a protocol error
    let (header, body) = exchange(&mut slave, &message(MailboxType::Can, 2, &[1, 0])).unwrap();
    assert_eq!(header.protocol(), Ok(MailboxType::Exception));
    assert_eq!(error_detail(&body), MailboxError::Syntax);
}

#[test]
fn ethernet() {
    let mut slave = slave();
    let frame: Vec<u8> = (0 .. 60).collect();
    slave.ethernet().outgoing.push_back(frame.clone());
    assert!(! slave.pending());

    let mut buffer = [0; 128];
    let size = slave.poll(&mut buffer).unwrap();
    let reply = MailboxFrame::unpack(&buffer[.. size], true).unwrap();
    assert_eq!(reply.header.protocol(), Ok(MailboxType::Ethernet));
    match EoeMessage::unpack(reply.data).unwrap().body {
        EoeBody::Fragment(fragment) => assert_eq!(fragment.data, &frame[..]),
        other => panic!("unexpected body {:?}", other),
    }
    // the same fragment sent back by the master reaches the stack
    let echo = message(MailboxType::Ethernet, 1, reply.data);
    assert_eq!(slave.poll(&mut buffer), None);

    assert_eq!(exchange(&mut slave, &echo), None);
    assert_eq!(slave.ethernet().received, vec![frame]);
}

#[test]
fn file() {
    let mut slave = slave();
    let mut body = [0; 32];
    let size = FoePacket::Write {password: 0, name: "fw"}.pack(&mut body).unwrap();
    let (header, body) = exchange(&mut slave, &message(MailboxType::File, 1, &body[.. size])).unwrap();
    assert_eq!(header.protocol(), Ok(MailboxType::File));
    assert_eq!(FoePacket::unpack(&body).unwrap(), FoePacket::Ack {packet: 0});

    let mut body = [0; 32];
    let size = FoePacket::Data {packet: 1, data: b"tiny"}.pack(&mut body).unwrap();
    exchange(&mut slave, &message(MailboxType::File, 2, &body[.. size])).unwrap();
    assert_eq!(slave.foe_ready().as_deref(), Some("fw"));
}
