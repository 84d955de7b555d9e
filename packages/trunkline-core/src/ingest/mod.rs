//! Multi-transport ingestion layer.
//!
//! Each submodule owns one long-running input source from the decoder
//! process:
//!
//! - [`audio`]: UDP PCM frames in four auto-detected wire formats
//! - [`fft`]: UDP spectrum frames (`"FFTD"` framing)
//! - [`status`]: the decoder's duplex status socket
//! - [`log_tail`]: the rotating decoder log, classified into control events
//! - [`watcher`]: finalized recording sidecars deposited on disk
//!
//! Ingestors never block on anything but their own source; fan-out is a
//! non-blocking `try_send` into per-consumer channels wired by the
//! supervisor.

pub mod audio;
pub mod fft;
pub mod log_tail;
pub mod status;
pub mod watcher;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

use crate::error::{TrunklineError, TrunklineResult};
use crate::protocol_constants::UDP_RECV_BUFFER_SIZE;

/// Binds a non-blocking UDP socket with an enlarged receive buffer and hands
/// it to tokio.
///
/// Shared by the audio and FFT ingestors. Bind failures are fatal at
/// startup.
pub(crate) fn bind_udp(addr: SocketAddr, endpoint: &str) -> TrunklineResult<tokio::net::UdpSocket> {
    let bind = || -> std::io::Result<tokio::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(UDP_RECV_BUFFER_SIZE)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        tokio::net::UdpSocket::from_std(socket.into())
    };
    bind().map_err(|source| TrunklineError::Bind {
        endpoint: format!("{} UDP {}", endpoint, addr),
        source,
    })
}
