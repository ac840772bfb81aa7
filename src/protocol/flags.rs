//! Integer flag constants and their named-boolean form
//!
//! Public operations accept a single `u32` of bitwise-ORed constants for
//! compatibility with the conventional AMQP client API. Internally the bits are
//! decoded once into [`Flags`] and code only ever reads named fields.

/// No flags set
pub const NOPARAM: u32 = 0;
/// Skip the subscribe step and only enter the consume wait loop
pub const JUST_CONSUME: u32 = 1;
/// Survive broker restarts
pub const DURABLE: u32 = 2;
/// Only check that the entity exists, never create it
pub const PASSIVE: u32 = 4;
/// Queue is private to the declaring connection
pub const EXCLUSIVE: u32 = 8;
/// Entity is removed once it is no longer used
pub const AUTODELETE: u32 = 16;
/// Exchange cannot be published to directly
pub const INTERNAL: u32 = 32;
/// Do not deliver messages published on this connection
pub const NOLOCAL: u32 = 64;
/// Deliveries are acknowledged on receipt
pub const AUTOACK: u32 = 128;
/// Only delete the queue when empty
pub const IFEMPTY: u32 = 256;
/// Only delete when there are no consumers / bindings
pub const IFUNUSED: u32 = 512;
/// Return the message if it cannot be routed
pub const MANDATORY: u32 = 1024;
/// Return the message if it cannot be delivered immediately
pub const IMMEDIATE: u32 = 2048;
/// Ack/nack every outstanding delivery up to the given tag
pub const MULTIPLE: u32 = 4096;
/// Do not wait for the broker reply
pub const NOWAIT: u32 = 8192;
/// Requeue nacked/rejected deliveries
pub const REQUEUE: u32 = 16384;

/// Delivery mode for non-persistent messages
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// Delivery mode for persistent messages
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Decoded option set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub just_consume: bool,
    pub durable: bool,
    pub passive: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_local: bool,
    pub auto_ack: bool,
    pub if_empty: bool,
    pub if_unused: bool,
    pub mandatory: bool,
    pub immediate: bool,
    pub multiple: bool,
    pub no_wait: bool,
    pub requeue: bool,
}

impl Flags {
    /// Decode an integer bitmask; unknown bits are ignored
    pub fn from_bits(bits: u32) -> Self {
        let has = |flag: u32| bits & flag == flag;
        Self {
            just_consume: has(JUST_CONSUME),
            durable: has(DURABLE),
            passive: has(PASSIVE),
            exclusive: has(EXCLUSIVE),
            auto_delete: has(AUTODELETE),
            internal: has(INTERNAL),
            no_local: has(NOLOCAL),
            auto_ack: has(AUTOACK),
            if_empty: has(IFEMPTY),
            if_unused: has(IFUNUSED),
            mandatory: has(MANDATORY),
            immediate: has(IMMEDIATE),
            multiple: has(MULTIPLE),
            no_wait: has(NOWAIT),
            requeue: has(REQUEUE),
        }
    }

    /// Encode back into the integer bitmask
    pub fn bits(&self) -> u32 {
        [
            (self.just_consume, JUST_CONSUME),
            (self.durable, DURABLE),
            (self.passive, PASSIVE),
            (self.exclusive, EXCLUSIVE),
            (self.auto_delete, AUTODELETE),
            (self.internal, INTERNAL),
            (self.no_local, NOLOCAL),
            (self.auto_ack, AUTOACK),
            (self.if_empty, IFEMPTY),
            (self.if_unused, IFUNUSED),
            (self.mandatory, MANDATORY),
            (self.immediate, IMMEDIATE),
            (self.multiple, MULTIPLE),
            (self.no_wait, NOWAIT),
            (self.requeue, REQUEUE),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(NOPARAM, |acc, (_, flag)| acc | flag)
    }

    /// Keep only the options that make sense for a queue descriptor
    pub fn for_queue(self) -> Self {
        Self {
            durable: self.durable,
            passive: self.passive,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            ..Self::default()
        }
    }

    /// Keep only the options that make sense for an exchange descriptor
    pub fn for_exchange(self) -> Self {
        Self {
            durable: self.durable,
            passive: self.passive,
            auto_delete: self.auto_delete,
            internal: self.internal,
            ..Self::default()
        }
    }
}

impl From<u32> for Flags {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}
