use log::warn;
use thiserror::Error;

/// Look up the OS index for a named network interface.
///
/// The index changes when a device is replaced (e.g. a USB NIC is
/// re-plugged), which is exactly the signal the poller uses to discard a
/// stale counter baseline.
pub fn interface_index(name: &str) -> Result<u32, IfError> {
    match nix::net::if_::if_nametoindex(name) {
        Ok(idx) => Ok(idx),
        Err(e) => {
            warn!("Unable to resolve interface {name}: {:?}", e);
            Err(IfError::NoSuchInterface(name.to_string()))
        }
    }
}

#[derive(Error, Debug)]
pub enum IfError {
    #[error("No such interface: {0}")]
    NoSuchInterface(String),
}
