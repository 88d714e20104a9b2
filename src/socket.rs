use tokio::net::{TcpListener, UdpSocket};

use crate::error::CoordinatorError;

/// Bind a UDP socket on an ephemeral port chosen by the OS.
///
/// Ownership of the socket transfers to the caller; the broker never closes
/// what it hands out.
pub async fn bind_udp() -> Result<(UdpSocket, u16), CoordinatorError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|source| CoordinatorError::Allocation { kind: "udp", source })?;
    let port = socket
        .local_addr()
        .map_err(|source| CoordinatorError::Allocation { kind: "udp", source })?
        .port();
    Ok((socket, port))
}

/// Bind a UDP socket on a fixed port, used for the single-port ICE mux.
pub async fn bind_udp_port(port: u16) -> Result<UdpSocket, CoordinatorError> {
    UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|source| CoordinatorError::Allocation { kind: "udp", source })
}

/// Bind a TCP listener on an ephemeral port chosen by the OS.
pub async fn bind_tcp() -> Result<(TcpListener, u16), CoordinatorError> {
    let listener = TcpListener::bind("0.0.0.0:0")
        .await
        .map_err(|source| CoordinatorError::Allocation { kind: "tcp", source })?;
    let port = listener
        .local_addr()
        .map_err(|source| CoordinatorError::Allocation { kind: "tcp", source })?
        .port();
    Ok((listener, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_udp_returns_live_port() {
        let (socket, port) = bind_udp().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(socket.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_tcp_returns_live_port() {
        let (listener, port) = bind_tcp().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let (_a, port_a) = bind_udp().await.unwrap();
        let (_b, port_b) = bind_udp().await.unwrap();
        assert_ne!(port_a, port_b);
    }

    #[tokio::test]
    async fn test_bind_udp_port_rejects_taken_port() {
        let (_held, port) = bind_udp().await.unwrap();
        let err = bind_udp_port(port).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Allocation { kind: "udp", .. }));
    }
}
