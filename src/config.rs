//! runtime settings of the mailbox service

use core::time::Duration;

/// default size of the mailbox sync manager buffers, header included
pub const DEFAULT_MAILBOX_SIZE: usize = 128;
/// default maximum payload of an EoE fragment
pub const DEFAULT_EOE_FRAGMENT: usize = 104;

/**
    settings of a [crate::Dispatcher] and of the [crate::service] loop

    The defaults match the sync manager configuration of the slave this layer was first written for. Settings fixed by the protocols themselves (maximum ethernet frame, FoE block size, ...) are constants of their modules and not part of this struct.

    ```
    use etherslave::MailboxConfig;
    let config = MailboxConfig::default()
        .with_mailbox_size(256)
        .with_strict_length(false);
    assert_eq!(config.mailbox_size, 256);
    ```
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailboxConfig {
    /// byte size of the mailbox buffers (both directions), including the mailbox header. No reply can be bigger.
    pub mailbox_size: usize,
    /// maximum data bytes in one EoE fragment, it applies to received and emitted fragments
    pub eoe_fragment_size: usize,
    /**
        if `true`, a message is rejected when its header length is not exactly its body length

        if `false`, bytes following the announced length are ignored, as it happens when the transport hands the full sync manager buffer
    */
    pub strict_length: bool,
    /// maximum time between two fragments of the same ethernet frame before the service loop abandons the frame. `None` disables the watchdog
    pub eoe_timeout: Option<Duration>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            eoe_fragment_size: DEFAULT_EOE_FRAGMENT,
            strict_length: true,
            eoe_timeout: Some(Duration::from_secs(1)),
        }
    }
}

impl MailboxConfig {
    pub fn with_mailbox_size(mut self, size: usize) -> Self {
        self.mailbox_size = size;
        self
    }
    pub fn with_eoe_fragment_size(mut self, size: usize) -> Self {
        self.eoe_fragment_size = size;
        self
    }
    pub fn with_strict_length(mut self, strict: bool) -> Self {
        self.strict_length = strict;
        self
    }
    pub fn with_eoe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.eoe_timeout = timeout;
        self
    }
}
