use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;
use tracing::debug;

const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];
const TCP_LISTEN: u8 = 0x0A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TcpEntry {
    local_port: u16,
    inode: u64,
}

/// Parses the body of `/proc/net/tcp{,6}`, keeping sockets in LISTEN state.
fn parse_tcp_table(content: &str) -> Result<Vec<TcpEntry>> {
    let mut entries = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        // local_address is column 1 -> "0100007F:1F90"
        let state = u8::from_str_radix(parts[3], 16)?;
        if state != TCP_LISTEN {
            continue;
        }

        let (_ip, port_hex) = parts[1]
            .split_once(':')
            .context("Invalid local address format")?;
        let local_port = u16::from_str_radix(port_hex, 16)?;
        let inode = parts[9].parse::<u64>()?;

        entries.push(TcpEntry { local_port, inode });
    }

    Ok(entries)
}

async fn listening_entries() -> Vec<TcpEntry> {
    let mut entries = Vec::new();
    for file in TCP_TABLES {
        let Ok(content) = fs::read_to_string(file).await else {
            continue;
        };
        match parse_tcp_table(&content) {
            Ok(parsed) => entries.extend(parsed),
            Err(e) => debug!("Failed to parse {}: {}", file, e),
        }
    }
    entries
}

async fn get_sockets_for_pid(pid: u32) -> Result<HashSet<u64>> {
    let fd_path = format!("/proc/{pid}/fd");
    let mut sockets = HashSet::new();

    if !Path::new(&fd_path).exists() {
        return Ok(sockets);
    }

    let mut entries = fs::read_dir(fd_path).await?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(target) = fs::read_link(entry.path()).await
            && let Some(target_str) = target.to_str()
            && let Some(inode) = socket_inode(target_str)
        {
            sockets.insert(inode);
        }
    }

    Ok(sockets)
}

fn socket_inode(link_target: &str) -> Option<u64> {
    link_target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Find the processes holding a listening socket on `port`.
///
/// Processes whose file descriptors can't be read (other users) are skipped.
///
/// # Errors
///
/// Returns an error if `/proc` cannot be listed.
pub async fn find_pids_listening_on(port: u16) -> Result<Vec<u32>> {
    let inodes: HashSet<u64> = listening_entries()
        .await
        .into_iter()
        .filter(|entry| entry.local_port == port)
        .map(|entry| entry.inode)
        .collect();

    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut pids = Vec::new();
    let mut proc_dir = fs::read_dir("/proc").await.context("Failed to list /proc")?;
    while let Ok(Some(entry)) = proc_dir.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Ok(sockets) = get_sockets_for_pid(pid).await
            && !sockets.is_disjoint(&inodes)
        {
            debug!("PID {} listens on port {}", pid, port);
            pids.push(pid);
        }
    }

    Ok(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:22B1 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 51234 1 0000000000000000 100 0 0 10 0
   1: 0100007F:A1B2 0100007F:22B1 01 00000000:00000000 00:00000000 00000000  1000        0 51299 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn parses_only_listening_sockets() {
        let entries = parse_tcp_table(SAMPLE).unwrap();
        assert_eq!(
            entries,
            vec![TcpEntry {
                local_port: 8881,
                inode: 51234
            }]
        );
    }

    #[test]
    fn socket_links_yield_inodes() {
        assert_eq!(socket_inode("socket:[51234]"), Some(51234));
        assert_eq!(socket_inode("pipe:[51234]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn finds_own_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let pids = find_pids_listening_on(port).await.unwrap();
        assert!(pids.contains(&std::process::id()));
    }
}
