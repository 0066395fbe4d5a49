pub mod redirect;

pub use redirect::{FirewallManager, InstallError, Proto, RedirectRule};
