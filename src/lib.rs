/*!
    Mailbox layer of an EtherCAT slave: the dispatcher routing the mailbox messages, and the CoE, EoE and FoE protocols behind it.

    The [Dispatcher] is fed with raw mailbox messages by the transport (the sync manager driver of the slave), and talks to the application through three collaborators:

    - a [coe::Dictionary] answering object reads and writes
    - an [eoe::EthernetStack] exchanging the tunneled ethernet frames
    - the FoE control channel ([foe::FoeCommand]) reading and writing the files exchanged with the master

    [service::run] is an optional tokio task doing this wiring with channels.
*/

pub mod data;
pub mod error;
pub mod config;
pub mod mailbox;
pub mod coe;
pub mod eoe;
pub mod foefs;
pub mod foe;
pub mod dispatch;
pub mod service;

pub use crate::data::{PduData, PackingError, TypeId};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::config::MailboxConfig;
pub use crate::dispatch::Dispatcher;
