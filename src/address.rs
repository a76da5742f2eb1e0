pub use alloy::primitives::Address;

/// Anything that owns an on-chain address: raw addresses, agents, contracts.
/// Callers normalise to a plain `Address` at the chain boundary.
pub trait Addressable {
    fn address(&self) -> Address;
}

impl Addressable for Address {
    fn address(&self) -> Address {
        *self
    }
}

impl<T: Addressable + ?Sized> Addressable for &T {
    fn address(&self) -> Address {
        (**self).address()
    }
}

/// An address whose low eight bytes encode `n`. Used for mock deployments
/// and fixtures.
pub fn low_address(n: u64) -> Address {
    Address::left_padding_from(&n.to_be_bytes())
}
