//! Shared handles for the addressable peers of a CAN segment.
//!
//! A [`ControlFunction`] is an opaque peer identity: a dynamic 8-bit address
//! plus a validity flag. The transport layer never owns these handles; it
//! borrows them from a caller-owned [`PeerRegistry`] and only ever reads the
//! current address and validity, re-checking both on every tick so that a
//! node losing its address tears its sessions down.
use core::cell::Cell;

/// Destination address meaning "all recipients".
pub const GLOBAL_ADDRESS: u8 = 0xFF;
/// The NULL address used by nodes that have not claimed an address yet.
pub const NULL_ADDRESS: u8 = 0xFE;

//==================================================================================CONTROL_FUNCTION

/// An addressable peer on the CAN network.
///
/// Interior mutability lets the address-management layer re-address or
/// invalidate a peer while transport sessions hold shared references to it.
/// Identity is the handle itself: two sessions refer to the same peer exactly
/// when they hold references to the same `ControlFunction`.
#[derive(Debug)]
pub struct ControlFunction {
    address: Cell<u8>,
    address_valid: Cell<bool>,
}

impl ControlFunction {
    /// A peer known to hold `address`.
    pub const fn new(address: u8) -> Self {
        Self {
            address: Cell::new(address),
            address_valid: Cell::new(true),
        }
    }

    /// A peer that has not claimed an address yet.
    pub const fn unclaimed() -> Self {
        Self {
            address: Cell::new(NULL_ADDRESS),
            address_valid: Cell::new(false),
        }
    }

    /// Current 8-bit address.
    #[inline]
    pub fn address(&self) -> u8 {
        self.address.get()
    }

    /// Whether the peer currently holds a usable address.
    #[inline]
    pub fn has_valid_address(&self) -> bool {
        self.address_valid.get() && self.address.get() < NULL_ADDRESS
    }

    /// Record a (re)claimed address for this peer.
    pub fn claim(&self, address: u8) {
        self.address.set(address);
        self.address_valid.set(address < NULL_ADDRESS);
    }

    /// Mark the peer as having lost its address.
    pub fn release(&self) {
        self.address_valid.set(false);
    }
}

//==================================================================================PEER_REGISTRY

struct PeerSlot {
    occupied: Cell<bool>,
    control_function: ControlFunction,
}

impl core::fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerSlot")
            .field("occupied", &self.occupied.get())
            .field("control_function", &self.control_function)
            .finish()
    }
}

/// Fixed pool resolving a source address to a shared [`ControlFunction`]
/// handle.
///
/// The registry is owned by the firmware and borrowed by the transport
/// layer, so session handles stay valid for as long as the registry lives.
#[derive(Debug)]
pub struct PeerRegistry<const N: usize> {
    slots: [PeerSlot; N],
}

impl<const N: usize> PeerRegistry<N> {
    /// Instantiate the registry with every slot free.
    pub const fn new() -> Self {
        Self {
            slots: [const {
                PeerSlot {
                    occupied: Cell::new(false),
                    control_function: ControlFunction::unclaimed(),
                }
            }; N],
        }
    }

    /// Find the peer currently known under `address`.
    pub fn lookup(&self, address: u8) -> Option<&ControlFunction> {
        self.slots
            .iter()
            .find(|slot| slot.occupied.get() && slot.control_function.address() == address)
            .map(|slot| &slot.control_function)
    }

    /// Find or record the peer transmitting from `address`.
    ///
    /// Returns `None` for the NULL and global addresses, and when the pool is
    /// exhausted.
    pub fn claim(&self, address: u8) -> Option<&ControlFunction> {
        if address >= NULL_ADDRESS {
            return None;
        }
        if let Some(control_function) = self.lookup(address) {
            return Some(control_function);
        }
        let slot = self.slots.iter().find(|slot| !slot.occupied.get())?;
        slot.occupied.set(true);
        slot.control_function.claim(address);
        Some(&slot.control_function)
    }

    /// Forget the peer at `address` and free its slot.
    pub fn release(&self, address: u8) {
        if let Some(slot) = self
            .slots
            .iter()
            .find(|slot| slot.occupied.get() && slot.control_function.address() == address)
        {
            slot.control_function.release();
            slot.occupied.set(false);
        }
    }
}

impl<const N: usize> Default for PeerRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}
