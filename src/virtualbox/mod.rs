pub mod disk;
pub mod driver;
pub mod errors;
pub mod host_ifaces;
pub mod iso;
pub mod models;
pub mod nat;
pub mod network;
pub mod parse;
pub mod ssh;
pub mod store;
pub mod util;
pub mod vbm;
pub mod version;
pub mod vtx;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the main types for easier access
pub use self::driver::{IpWaiter, SshIpWaiter, VirtualBoxDriver};
pub use self::errors::{Result, VBoxError};
pub use self::models::*;
pub use self::vbm::{VBoxCmdManager, VBoxManager};
