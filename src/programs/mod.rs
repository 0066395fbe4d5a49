pub mod dnsmasq;
pub mod resolver;
