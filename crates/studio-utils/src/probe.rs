use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Interval between readiness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Checks if a TCP port is open.
pub async fn check_tcp(addr: &str) -> bool {
    match TcpStream::connect(addr).await {
        Ok(_) => true,
        Err(e) => {
            debug!("TCP probe failed for {}: {}", addr, e);
            false
        }
    }
}

/// Polls `addr` every `interval` until it accepts a connection.
///
/// Returns `false` if `timeout` elapses first.
pub async fn wait_for_tcp(addr: &str, interval: Duration, timeout: Duration) -> bool {
    let poll = async {
        loop {
            if check_tcp(addr).await {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    };

    tokio::time::timeout(timeout, poll).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_listener_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        assert!(check_tcp(&addr).await);
        assert!(wait_for_tcp(&addr, PROBE_INTERVAL, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(!check_tcp(&addr).await);
        assert!(!wait_for_tcp(&addr, Duration::from_millis(20), Duration::from_millis(150)).await);
    }
}
