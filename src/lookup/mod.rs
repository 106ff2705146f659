//! Discovery of the addresses and ports this node can advertise.

pub mod address;
pub mod port;

pub use address::{
    default_address, first_address, interface_addresses, interfaces, interfaces_matching,
    local_outbound_address, NetworkInterface,
};
pub use port::{find_open_address, find_open_port, Protocol};
