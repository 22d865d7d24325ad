//! Test utilities: packet builders for unit and integration tests

pub mod packets;

pub use packets::{icmp_message, ipv4_icmp, ipv4_udp, mpls_stack};
