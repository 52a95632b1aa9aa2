//! VNC port allocation.
//!
//! The probe binds a loopback listener and releases it straight away; the
//! build's hypervisor binds the port later. Another process can take the
//! port in between, so the result is a best-effort hint, not a reservation.

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// First port at or above `start` that a loopback listener can bind.
///
/// # Errors
///
/// [`BuildError::Configuration`] when every port from `start` to 65535 is
/// taken.
pub async fn find_free_vnc_port(start: u16) -> Result<u16> {
    let mut port = start;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                info!(port, "Using VNC port");
                return Ok(port);
            }
            Err(e) => debug!(port, error = %e, "VNC port busy"),
        }
        port = port.checked_add(1).ok_or_else(|| {
            BuildError::configuration(format!("no free VNC port at or above {start}"))
        })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_returned_unchanged() {
        // Ask the OS for a free port, release it, then probe it.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        assert_eq!(find_free_vnc_port(port).await.expect("probe"), port);
    }

    #[tokio::test]
    async fn occupied_port_yields_a_strictly_greater_one() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let taken = listener.local_addr().expect("addr").port();
        if taken == u16::MAX {
            return;
        }

        let found = find_free_vnc_port(taken).await.expect("probe");
        assert!(found > taken);
        drop(listener);
    }
}
