// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Prometheus exporter for the engine's counters and gauges.
//!
//! The engine records through the `metrics` facade (flow gauges plus
//! per-interface tx, rx, loss and send error counters); without an
//! installed recorder those calls are no-ops.

use anyhow::Result;
use std::net::SocketAddr;

#[cfg(not(test))]
pub fn install_prometheus_recorder(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use socket2::{Domain, Socket, Type};

    // Probe bind with SO_REUSEADDR so a port held in TIME_WAIT does not
    // fail the exporter's own bind below.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    drop(socket);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::from)
}

#[cfg(test)]
pub fn install_prometheus_recorder(_addr: SocketAddr) -> Result<()> {
    Ok(())
}
