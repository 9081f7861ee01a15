//! RESP node client
//!
//! One short-lived connection per call; the whole exchange (connect, AUTH,
//! command, reply) is bounded by the configured timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::resp::{encode_command, RespError, RespReader, RespValue};
use super::{MigrationProgress, NodeRpc, NodeRpcError, NodeRpcResult};
use crate::metadata::{NodeInfo, SlotRange};

pub struct RespNodeClient {
    timeout: Duration,
}

impl RespNodeClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(&self, node: &NodeInfo, args: &[String]) -> NodeRpcResult<RespValue> {
        let addr = node.addr.clone();
        match tokio::time::timeout(self.timeout, exchange(node, args)).await {
            Ok(result) => result,
            Err(_) => Err(NodeRpcError::Timeout(addr)),
        }
    }

    async fn call_ok(&self, node: &NodeInfo, args: &[String]) -> NodeRpcResult<()> {
        match self.call(node, args).await? {
            RespValue::SimpleString(_) | RespValue::BulkString(_) | RespValue::Integer(_) => Ok(()),
            other => Err(NodeRpcError::Protocol(format!(
                "unexpected reply to {}: {:?}",
                args.first().map(String::as_str).unwrap_or(""),
                other
            ))),
        }
    }
}

fn io_error(addr: &str, source: std::io::Error) -> NodeRpcError {
    NodeRpcError::Io {
        addr: addr.to_string(),
        source,
    }
}

fn resp_error(addr: &str, err: RespError) -> NodeRpcError {
    match err {
        RespError::Io(source) => io_error(addr, source),
        other => NodeRpcError::Protocol(format!("{}: {}", addr, other)),
    }
}

async fn exchange(node: &NodeInfo, args: &[String]) -> NodeRpcResult<RespValue> {
    let addr = node.addr.as_str();
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| io_error(addr, e))?;
    let (read_half, mut write_half) = stream.split();
    let mut reader = RespReader::new(read_half);

    let mut request = Vec::new();
    if let Some(password) = &node.password {
        request.push(encode_command(&["AUTH", password.as_str()]));
    }
    request.push(encode_command(args));
    for frame in &request {
        write_half.write_all(frame).await.map_err(|e| io_error(addr, e))?;
    }
    write_half.flush().await.map_err(|e| io_error(addr, e))?;

    if node.password.is_some() {
        let reply = reader.read_reply().await.map_err(|e| resp_error(addr, e))?;
        server_error(addr, reply)?;
    }
    let reply = reader.read_reply().await.map_err(|e| resp_error(addr, e))?;
    server_error(addr, reply)
}

fn server_error(addr: &str, reply: RespValue) -> NodeRpcResult<RespValue> {
    match reply {
        RespValue::Error(message) => Err(NodeRpcError::Server {
            addr: addr.to_string(),
            message: String::from_utf8_lossy(&message).into_owned(),
        }),
        other => Ok(other),
    }
}

/// Extract the transfer state of `range` from a `CLUSTER INFO` reply
pub(crate) fn parse_migration_progress(info: &str, range: SlotRange) -> MigrationProgress {
    let mut slot = None;
    let mut state = None;
    for line in info.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match field.trim() {
            "migrating_slot" | "migrating_slot(s)" => slot = Some(value.to_string()),
            "migrating_state" => state = Some(value.to_string()),
            _ => {}
        }
    }

    let same_range = slot
        .and_then(|s| s.parse::<SlotRange>().ok())
        .is_some_and(|s| s == range);
    if !same_range {
        return MigrationProgress::Idle;
    }
    match state.as_deref() {
        Some("success") => MigrationProgress::Success,
        Some("fail") | Some("failed") => MigrationProgress::Failed,
        Some("start") | Some("ongoing") => MigrationProgress::InProgress,
        _ => MigrationProgress::Idle,
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[async_trait]
impl NodeRpc for RespNodeClient {
    async fn ping(&self, node: &NodeInfo) -> NodeRpcResult<()> {
        match self.call(node, &cmd(&["PING"])).await? {
            RespValue::SimpleString(_) | RespValue::BulkString(_) => Ok(()),
            other => Err(NodeRpcError::Protocol(format!("unexpected PING reply {:?}", other))),
        }
    }

    async fn promote(&self, node: &NodeInfo) -> NodeRpcResult<()> {
        debug!("Promoting {} ({})", node.id, node.addr);
        self.call_ok(node, &cmd(&["SLAVEOF", "NO", "ONE"])).await
    }

    async fn demote(&self, node: &NodeInfo, master: &NodeInfo) -> NodeRpcResult<()> {
        let (host, port) = master
            .host_port()
            .map_err(|_| NodeRpcError::InvalidAddr(master.addr.clone()))?;
        debug!("Demoting {} to replicate from {}", node.addr, master.addr);
        self.call_ok(node, &cmd(&["SLAVEOF", host, &port.to_string()]))
            .await
    }

    async fn set_topology(&self, node: &NodeInfo, nodes: &str, version: u64) -> NodeRpcResult<()> {
        self.call_ok(node, &cmd(&["CLUSTERX", "SETNODES", nodes, &version.to_string()]))
            .await
    }

    async fn start_migration(
        &self,
        source: &NodeInfo,
        range: SlotRange,
        target_id: &str,
    ) -> NodeRpcResult<()> {
        self.call_ok(
            source,
            &cmd(&["CLUSTERX", "MIGRATE", &range.to_string(), target_id]),
        )
        .await
    }

    async fn migration_status(
        &self,
        source: &NodeInfo,
        range: SlotRange,
    ) -> NodeRpcResult<MigrationProgress> {
        let reply = self.call(source, &cmd(&["CLUSTER", "INFO"])).await?;
        let info = reply
            .as_text()
            .ok_or_else(|| NodeRpcError::Protocol(format!("unexpected CLUSTER INFO reply {:?}", reply)))?;
        Ok(parse_migration_progress(&info, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NodeRole;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_migration_progress() {
        let range = SlotRange::single(100).unwrap();
        let info = "cluster_state:ok\r\nmigrating_slot: 100\r\nmigrating_state: success\r\n";
        assert_eq!(parse_migration_progress(info, range), MigrationProgress::Success);

        let info = "migrating_slot(s): 100\r\nmigrating_state: ongoing\r\n";
        assert_eq!(parse_migration_progress(info, range), MigrationProgress::InProgress);

        let info = "migrating_slot: 101\r\nmigrating_state: fail\r\n";
        assert_eq!(parse_migration_progress(info, range), MigrationProgress::Idle);

        let info = "migrating_slot(s): 10-20\r\nmigrating_state: fail\r\n";
        let range = SlotRange::new(10, 20).unwrap();
        assert_eq!(parse_migration_progress(info, range), MigrationProgress::Failed);
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let node = NodeInfo::new(addr.to_string(), NodeRole::Master, None).unwrap();
        let client = RespNodeClient::new(Duration::from_secs(1));
        client.ping(&node).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_surfaces() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"-ERR invalid version\r\n").await.unwrap();
        });

        let node = NodeInfo::new(addr.to_string(), NodeRole::Master, None).unwrap();
        let client = RespNodeClient::new(Duration::from_secs(1));
        let err = client.set_topology(&node, "x", 3).await.unwrap_err();
        assert!(matches!(err, NodeRpcError::Server { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_times_out_or_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let node = NodeInfo::new(addr.to_string(), NodeRole::Master, None).unwrap();
        let client = RespNodeClient::new(Duration::from_millis(200));
        assert!(client.ping(&node).await.is_err());
    }
}
