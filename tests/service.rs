use std::time::Duration;
use bilge::prelude::*;
use tokio::sync::mpsc;
use etherslave::{
    Dispatcher, MailboxConfig, PduData, TypeId,
    mailbox::*,
    coe::{CanError, CoeRequest, CoeReply, Dictionary, ObjectAddress},
    eoe::{EoeMessage, EoeBody, EoeTransmitter, EOE_MAX_MSG_SIZE},
    foe::{FoeCommand, FoePacket, FoeReply},
    foefs::{OpenMode, file_name},
    service::{self, ChannelStack, FoeClient, ServiceChannels},
    };

/// dictionary with only a constant vendor id
struct Identity;
impl Dictionary for Identity {
    fn get(&mut self, address: ObjectAddress, dst: &mut [u8]) -> Result<usize, CanError> {
        if address != ObjectAddress::new(0x1018, 1)
            {return Err(CanError::Unknown)}
        dst[.. 4].copy_from_slice(&0x539u32.to_le_bytes());
        Ok(4)
    }
    fn set(&mut self, _address: ObjectAddress, _value: &[u8]) -> Result<(), CanError>  {Err(CanError::Generic)}
    fn object_type(&mut self, _address: ObjectAddress) -> Result<TypeId, CanError>  {Ok(TypeId::U32)}
    fn max_subindex(&mut self, _index: u16) -> Result<u8, CanError>  {Ok(1)}
}

fn message(ty: MailboxType, count: u8, body: &[u8]) -> Vec<u8> {
    let header = MailboxHeader::message(ty, body.len() as u16, 0, u2::new(0), u3::new(count));
    let mut buffer = vec![0; MAILBOX_HEADER_SIZE + body.len()];
    MailboxFrame {header, data: body}.pack(&mut buffer).unwrap();
    buffer
}

/// all the fragment messages of a frame
fn fragments(frame: &[u8]) -> Vec<Vec<u8>> {
    let mut tx = EoeTransmitter::new(104);
    tx.send(frame).unwrap();
    let mut fragments = Vec::new();
    let mut buffer = [0; EOE_MAX_MSG_SIZE];
    while let Some(size) = tx.next_fragment(&mut buffer).unwrap() {
        fragments.push(buffer[.. size].to_vec());
    }
    fragments
}

struct Master {
    incoming: mpsc::Sender<Vec<u8>>,
    outgoing: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Receiver<FoeReply>,
}

fn start(config: MailboxConfig, events: usize) -> (Master, service::EthernetHandle, FoeClient, tokio::task::JoinHandle<Dispatcher<Identity, ChannelStack>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (stack, ethernet) = ChannelStack::new(4);
    let waker = stack.waker();
    let dispatcher = Dispatcher::new(config, Identity, stack);
    let (client, commands) = FoeClient::new(4);
    let (incoming_tx, incoming_rx) = mpsc::channel(8);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::channel(events);
    let task = tokio::spawn(service::run(dispatcher, ServiceChannels {
        incoming: incoming_rx,
        outgoing: outgoing_tx,
        commands,
        events: events_tx,
        waker: Some(waker),
    }));
    let master = Master {incoming: incoming_tx, outgoing: outgoing_rx, events: events_rx};
    (master, ethernet, client, task)
}

async fn receive(master: &mut Master) -> (MailboxHeader, Vec<u8>) {
    let raw = tokio::time::timeout(Duration::from_secs(1), master.outgoing.recv()).await
        .expect("no message from slave")
        .expect("service stopped");
    let frame = MailboxFrame::unpack(&raw, true).unwrap();
    (frame.header, frame.data.to_vec())
}

#[tokio::test]
async fn coe() {
    let (mut master, _ethernet, _client, task) = start(MailboxConfig::default(), 4);
    let mut body = [0; 16];
    let size = CoeRequest::GetObject(ObjectAddress::new(0x1018, 1)).pack(&mut body).unwrap();
    master.incoming.send(message(MailboxType::Can, 1, &body[.. size])).await.unwrap();

    let (header, body) = receive(&mut master).await;
    assert_eq!(header.protocol(), Ok(MailboxType::Can));
    assert_eq!(CoeReply::unpack(&body).unwrap().result, Ok(&[0x39, 0x05, 0, 0][..]));

    drop(master.incoming);
    let dispatcher = task.await.unwrap();
    assert!(! dispatcher.pending());
}

#[tokio::test]
async fn ethernet() {
    let (mut master, mut ethernet, _client, _task) = start(MailboxConfig::default(), 4);

    // from the application to the master
    let sent: Vec<u8> = (0 .. 250).map(|i| i as u8).collect();
    ethernet.send(&sent).await.unwrap();
    let mut data = Vec::new();
    for _ in 0 .. 3 {
        let (header, body) = receive(&mut master).await;
        assert_eq!(header.protocol(), Ok(MailboxType::Ethernet));
        match EoeMessage::unpack(&body).unwrap().body {
            EoeBody::Fragment(fragment) => data.extend_from_slice(fragment.data),
            other => panic!("unexpected body {:?}", other),
        }
    }
    assert_eq!(data, sent);

    // from the master to the application
    let frame: Vec<u8> = (0 .. 150).map(|i| (i * 5) as u8).collect();
    for (count, fragment) in fragments(&frame).iter().enumerate() {
        master.incoming.send(message(MailboxType::Ethernet, count as u8 + 1, fragment)).await.unwrap();
    }
    let received = tokio::time::timeout(Duration::from_secs(1), ethernet.recv()).await
        .unwrap().unwrap();
    assert_eq!(&received.data[..], &frame[..]);
    assert_eq!(received.timestamp, None);
}

#[tokio::test]
async fn stalled_frame() {
    let config = MailboxConfig::default().with_eoe_timeout(Some(Duration::from_millis(50)));
    let (mut master, _ethernet, _client, _task) = start(config, 4);
    let frame: Vec<u8> = (0 .. 300).map(|i| i as u8).collect();
    let fragments = fragments(&frame);

    master.incoming.send(message(MailboxType::Ethernet, 1, &fragments[0])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    // the frame has been abandonned meanwhile, so the next fragment is out of sequence
    master.incoming.send(message(MailboxType::Ethernet, 2, &fragments[1])).await.unwrap();

    let (header, body) = receive(&mut master).await;
    assert_eq!(header.protocol(), Ok(MailboxType::Exception));
    assert_eq!(MailboxErrorFrame::unpack(&body).unwrap().detail(), MailboxError::InvalidHeader);
}

#[tokio::test]
async fn file() {
    let (mut master, _ethernet, client, _task) = start(MailboxConfig::default(), 4);
    let mut body = [0; 32];

    let size = FoePacket::Write {password: 0, name: "fw"}.pack(&mut body).unwrap();
    master.incoming.send(message(MailboxType::File, 1, &body[.. size])).await.unwrap();
    let (_, reply) = receive(&mut master).await;
    assert_eq!(FoePacket::unpack(&reply).unwrap(), FoePacket::Ack {packet: 0});

    let size = FoePacket::Data {packet: 1, data: b"content"}.pack(&mut body).unwrap();
    master.incoming.send(message(MailboxType::File, 2, &body[.. size])).await.unwrap();
    let (_, reply) = receive(&mut master).await;
    assert_eq!(FoePacket::unpack(&reply).unwrap(), FoePacket::Ack {packet: 1});

    let event = tokio::time::timeout(Duration::from_secs(1), master.events.recv()).await
        .unwrap().unwrap();
    assert_eq!(event, FoeReply::Ready(file_name("fw").unwrap()));

    assert_eq!(client.command(FoeCommand::Open(file_name("fw").unwrap(), OpenMode::ReadOnly)).await, Ok(FoeReply::Ack));
    match client.command(FoeCommand::Read(64)).await.unwrap() {
        FoeReply::Data(data) => assert_eq!(&data[..], b"content"),
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(client.command(FoeCommand::Close).await, Ok(FoeReply::Ack));
}

/// write a small file from the master
async fn write_file(master: &mut Master, name: &str, count: u8) {
    let mut body = [0; 32];
    let size = FoePacket::Write {password: 0, name}.pack(&mut body).unwrap();
    master.incoming.send(message(MailboxType::File, count, &body[.. size])).await.unwrap();
    let (_, reply) = receive(master).await;
    assert_eq!(FoePacket::unpack(&reply).unwrap(), FoePacket::Ack {packet: 0});

    let size = FoePacket::Data {packet: 1, data: b"small"}.pack(&mut body).unwrap();
    master.incoming.send(message(MailboxType::File, count + 1, &body[.. size])).await.unwrap();
    let (_, reply) = receive(master).await;
    assert_eq!(FoePacket::unpack(&reply).unwrap(), FoePacket::Ack {packet: 1});
}

#[tokio::test]
async fn undrained_events() {
    let (mut master, _ethernet, _client, _task) = start(MailboxConfig::default(), 1);

    // nobody reads the ready events, the second one cannot be queued
    write_file(&mut master, "fw", 1).await;
    write_file(&mut master, "fw", 3).await;

    // the mailbox keeps answering
    let mut body = [0; 16];
    let size = CoeRequest::GetObject(ObjectAddress::new(0x1018, 1)).pack(&mut body).unwrap();
    master.incoming.send(message(MailboxType::Can, 5, &body[.. size])).await.unwrap();
    let (header, body) = receive(&mut master).await;
    assert_eq!(header.protocol(), Ok(MailboxType::Can));
    assert_eq!(CoeReply::unpack(&body).unwrap().result, Ok(&[0x39, 0x05, 0, 0][..]));

    assert_eq!(master.events.recv().await, Some(FoeReply::Ready(file_name("fw").unwrap())));
    assert!(master.events.try_recv().is_err());
}
