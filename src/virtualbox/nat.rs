use log::debug;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::models::PortForward;
use crate::virtualbox::vbm::VBoxManager;

const PORT_ATTEMPTS: usize = 10;
const PORT_RETRY_DELAY: Duration = Duration::from_nanos(1);

/// Find a free TCP port on 127.0.0.1. `hint` is tried first; `0` means any port.
pub async fn get_available_tcp_port(hint: u16) -> Result<u16> {
    let mut port = hint;

    for _ in 0..PORT_ATTEMPTS {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                if bound != 0 {
                    return Ok(bound);
                }
            }
            Err(e) => debug!("Unable to bind 127.0.0.1:{}: {}", port, e),
        }

        // Throw away the hint before trying again.
        port = 0;
        tokio::time::sleep(PORT_RETRY_DELAY).await;
    }

    Err(VBoxError::PortUnavailable)
}

/// Install `rule` on the NAT interface of `machine`, replacing any rule with
/// the same name. Returns the host port actually used, which differs from
/// `rule.host_port` when that one is taken.
pub async fn set_port_forwarding(
    vbox: &dyn VBoxManager,
    machine: &str,
    rule: &PortForward,
) -> Result<u16> {
    let actual = get_available_tcp_port(rule.host_port).await?;
    if rule.host_port != 0 && actual != rule.host_port {
        debug!(
            "NAT forwarding host port for guest port {} ({}) changed from {} to {}",
            rule.guest_port, rule.name, rule.host_port, actual
        );
    }

    let flag = format!("--natpf{}", rule.interface);

    // Nothing to delete on the first start.
    let _ = vbox
        .vbm(&["modifyvm", machine, &flag, "delete", &rule.name])
        .await;

    let installed = PortForward {
        host_port: actual,
        ..rule.clone()
    };
    vbox.vbm(&["modifyvm", machine, &flag, &installed.rule()])
        .await?;

    Ok(actual)
}
