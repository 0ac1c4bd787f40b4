/*!
    asynchronous mailbox service, wiring a [Dispatcher] to the transport and to the slave application through tokio channels.

    The service is a single task: every message is dispatched to completion before the next one is looked at, so the protocol processors never run concurrently. The application never touches the dispatcher's buffers, it exchanges owned values with the service:

    - ethernet frames through a [ChannelStack] and its [EthernetHandle]
    - FoE control commands through a [FoeClient]

    ```ignore
    let (stack, mut ethernet) = ChannelStack::new(4);
    let waker = stack.waker();
    let dispatcher = Dispatcher::<_, _, 1>::new(MailboxConfig::default(), dictionary, stack);
    let (client, commands) = FoeClient::new(4);
    tokio::spawn(service::run(dispatcher, ServiceChannels {
        incoming, outgoing, commands, events, waker: Some(waker),
    }));
    ```
*/

use crate::{
	dispatch::Dispatcher,
	coe::Dictionary,
	eoe::{EthernetStack, EthernetFrame, EoeState},
	foe::{FoeCommand, FoeReply},
	mailbox::{MailboxHeader, MailboxType},
	data::PduData,
	error::{EthercatError, EthercatResult},
	};
use std::sync::Arc;
use tokio::{
    sync::{mpsc::{self, error::TrySendError}, oneshot, Notify},
    time::{Instant, sleep_until},
    };
use log::{debug, trace, warn};


/// FoE control command with the channel to answer it
pub type FoeRequest = (FoeCommand, oneshot::Sender<FoeReply>);

/// channels connecting the service to the outside
pub struct ServiceChannels {
    /// raw mailbox messages written by the master
    pub incoming: mpsc::Receiver<Vec<u8>>,
    /// raw mailbox messages to send to the master
    pub outgoing: mpsc::Sender<Vec<u8>>,
    /// commands of the FoE control channel
    pub commands: mpsc::Receiver<FoeRequest>,
    /// notifications for the application, currently [FoeReply::Ready] when a file has been written by the master
    pub events: mpsc::Sender<FoeReply>,
    /// notified when the ethernet application has a frame to send, see [ChannelStack::waker]
    pub waker: Option<Arc<Notify>>,
}

/**
    run the mailbox service until the incoming channel is closed or the outgoing channel is dropped, then give back the dispatcher.

    Besides dispatching, the service applies the EoE watchdog of [crate::MailboxConfig::eoe_timeout]: a frame whose next fragment does not arrive in time is abandonned.
*/
pub async fn run<D, E, const N: usize>(mut dispatcher: Dispatcher<D, E, N>, channels: ServiceChannels) -> Dispatcher<D, E, N>
where
    D: Dictionary,
    E: EthernetStack,
{
    let ServiceChannels {mut incoming, outgoing, mut commands, events, waker} = channels;
    let waker = waker.unwrap_or_default();
    let timeout = dispatcher.config().eoe_timeout;
    let mut buffer = vec![0; dispatcher.config().mailbox_size];
    let mut deadline: Option<Instant> = None;
    let mut commands_open = true;
    debug!("mailbox service started");

    loop {
        // outbound fragments go first, they do not need any message from the master
        while let Some(size) = dispatcher.poll(&mut buffer) {
            if outgoing.send(buffer[.. size].to_vec()).await.is_err() {
                debug!("mailbox service stopped, transport closed");
                return dispatcher
            }
        }

        tokio::select! {
            message = incoming.recv() => {
                let Some(message) = message else {break};
                let ethernet = MailboxHeader::unpack(&message).ok()
                    .and_then(|header| header.protocol().ok())
                    == Some(MailboxType::Ethernet);
                if let Some(size) = dispatcher.dispatch(&message, &mut buffer) {
                    if outgoing.send(buffer[.. size].to_vec()).await.is_err() {
                        debug!("mailbox service stopped, transport closed");
                        return dispatcher
                    }
                }
                if ethernet {
                    deadline = match (timeout, dispatcher.eoe().rx_state()) {
                        (Some(timeout), EoeState::RxFragment) => Some(Instant::now() + timeout),
                        _ => None,
                    };
                }
                while let Some(name) = dispatcher.foe_ready() {
                    trace!("foe file {:?} ready", name);
                    // the application may be slow, the mailbox is never waiting for it
                    match events.try_send(FoeReply::Ready(name)) {
                        Ok(()) => {},
                        Err(TrySendError::Full(event)) => warn!("foe ready notification lost, events not drained: {:?}", event),
                        Err(TrySendError::Closed(_)) => warn!("foe ready notification lost, no listener"),
                    }
                }
            },
            request = commands.recv(), if commands_open => match request {
                Some((command, reply)) => {
                    if reply.send(dispatcher.foe_command(command)).is_err()
                        {debug!("foe command reply dropped");}
                },
                None => commands_open = false,
            },
            _ = waker.notified() => {},
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                dispatcher.reset_eoe_rx();
            },
        }
    }
    debug!("mailbox service stopped, no more incoming messages");
    dispatcher
}


/// ethernet frame received from the master
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedFrame {
    pub data: EthernetFrame,
    pub timestamp: Option<u32>,
}

/**
    [EthernetStack] handing frames over to an application task through bounded channels

    Frames are never waited for: a full channel makes the frame stay in the EoE receiver until the application catches up.
*/
pub struct ChannelStack {
    received: mpsc::Sender<ReceivedFrame>,
    transmit: mpsc::Receiver<EthernetFrame>,
    waker: Arc<Notify>,
}

/// application side of a [ChannelStack]
pub struct EthernetHandle {
    received: mpsc::Receiver<ReceivedFrame>,
    transmit: mpsc::Sender<EthernetFrame>,
    waker: Arc<Notify>,
}

impl ChannelStack {
    /// create a stack and its application handle, buffering up to `capacity` frames in each direction
    pub fn new(capacity: usize) -> (Self, EthernetHandle) {
        let (received_tx, received_rx) = mpsc::channel(capacity);
        let (transmit_tx, transmit_rx) = mpsc::channel(capacity);
        let waker = Arc::new(Notify::new());
        (
            Self {received: received_tx, transmit: transmit_rx, waker: waker.clone()},
            EthernetHandle {received: received_rx, transmit: transmit_tx, waker},
        )
    }
    /// notification to give to [ServiceChannels::waker]
    pub fn waker(&self) -> Arc<Notify>  {self.waker.clone()}
}

impl EthernetStack for ChannelStack {
    fn receive(&mut self, frame: &[u8], timestamp: Option<u32>) -> bool {
        let Ok(data) = EthernetFrame::from_slice(frame)
            else {return true};
        match self.received.try_send(ReceivedFrame {data, timestamp}) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                warn!("ethernet frame dropped, application closed");
                true
            },
        }
    }
    fn transmit(&mut self, dst: &mut [u8]) -> Option<usize> {
        let frame = self.transmit.try_recv().ok()?;
        if frame.len() > dst.len() {
            warn!("ethernet frame of {} bytes dropped, too big", frame.len());
            return None
        }
        dst[.. frame.len()].copy_from_slice(&frame);
        Some(frame.len())
    }
    fn abandoned(&mut self, error: &EthercatError) {
        debug!("ethernet frame abandonned: {}", error);
    }
}

impl EthernetHandle {
    /// queue a frame to send to the master
    pub async fn send(&self, frame: &[u8]) -> EthercatResult {
        let frame = EthernetFrame::from_slice(frame)
            .map_err(|_| EthercatError::Capacity("ethernet frame too big"))?;
        self.transmit.send(frame).await
            .map_err(|_| EthercatError::Protocol("mailbox service stopped"))?;
        self.waker.notify_one();
        Ok(())
    }
    /// wait for the next frame received from the master, `None` when the service is stopped
    pub async fn recv(&mut self) -> Option<ReceivedFrame> {
        let frame = self.received.recv().await;
        // a frame refused for lack of room can now be delivered
        self.waker.notify_one();
        frame
    }
}


/// application side of the FoE control channel
#[derive(Clone)]
pub struct FoeClient {
    commands: mpsc::Sender<FoeRequest>,
}

impl FoeClient {
    /// create a client and the receiver to give to [ServiceChannels::commands]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FoeRequest>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self {commands: sender}, receiver)
    }
    /// send a command and wait for its reply
    pub async fn command(&self, command: FoeCommand) -> EthercatResult<FoeReply> {
        let (sender, receiver) = oneshot::channel();
        self.commands.send((command, sender)).await
            .map_err(|_| EthercatError::Protocol("mailbox service stopped"))?;
        receiver.await
            .map_err(|_| EthercatError::Protocol("mailbox service stopped"))
    }
}
