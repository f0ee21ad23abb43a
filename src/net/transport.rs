//! 对端传输
//!
//! PeerTransport 抽象一条到远程服务的持久连接；TcpTransport 是 tokio TCP 实现，
//! ScriptedTransport 为测试提供预置输出与发送记录。连接丢失以 AgentError::Transport
//! 上报，核心不做静默重连。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

use crate::core::AgentError;

/// 对端传输接口。receive 返回 Ok(None) 表示本轮窗口内没有新输出（读超时）。
#[async_trait]
pub trait PeerTransport: Send {
    async fn send(&mut self, line: &str) -> Result<(), AgentError>;
    async fn receive(&mut self) -> Result<Option<String>, AgentError>;
}

/// TCP 传输：读超时视为"暂无输出"，写超时与对端关闭、IO 错误视为连接丢失
pub struct TcpTransport {
    stream: TcpStream,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TcpTransport {
    /// 建立到 host:port 的连接
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| AgentError::Transport(format!("连接 {addr} 超时")))?
            .map_err(|e| AgentError::Transport(format!("连接 {addr} 失败: {e}")))?;
        info!(%addr, "已连接到对端");
        Ok(Self {
            stream,
            read_timeout,
            write_timeout,
        })
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn send(&mut self, line: &str) -> Result<(), AgentError> {
        let payload = format!("{line}\n");
        // 对端缓冲区写满（不再接收）同样视为连接丢失，不能无限阻塞主循环
        match tokio::time::timeout(self.write_timeout, self.stream.write_all(payload.as_bytes()))
            .await
        {
            Err(_) => Err(AgentError::Transport("发送超时（对端不再接收）".to_string())),
            Ok(Err(e)) => Err(AgentError::Transport(format!("发送失败（连接中断）: {e}"))),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn receive(&mut self) -> Result<Option<String>, AgentError> {
        let mut buf = [0u8; 4096];
        match tokio::time::timeout(self.read_timeout, self.stream.read(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(AgentError::Transport("服务器关闭了连接".to_string())),
            Ok(Ok(n)) => Ok(Some(String::from_utf8_lossy(&buf[..n]).trim().to_string())),
            Ok(Err(e)) => Err(AgentError::Transport(format!("接收失败: {e}"))),
        }
    }
}

/// 预置输出传输（测试用）：receive 按序弹出脚本输出，send 记录到共享列表
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    outputs: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new(outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            outputs: outputs.into_iter().map(Into::into).collect(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 获取已发送内容的共享句柄（boxed 之前调用）
    pub fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn send(&mut self, line: &str) -> Result<(), AgentError> {
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>, AgentError> {
        // 脚本耗尽后视为对端静默
        Ok(Some(self.outputs.pop_front().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_times_out_when_peer_stops_reading() {
        // 双方都用小缓冲区，对端接受连接但从不读取：写必然被阻塞
        let listener_socket = tokio::net::TcpSocket::new_v4().unwrap();
        listener_socket.set_recv_buffer_size(8192).unwrap();
        listener_socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = listener_socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_send_buffer_size(8192).unwrap();
        let stream = socket.connect(addr).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let mut transport = TcpTransport {
            stream,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
        };
        let payload = "x".repeat(4 * 1024 * 1024);
        let err = transport.send(&payload).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert!(err.to_string().contains("超时"));
    }

    #[tokio::test]
    async fn test_send_within_buffer_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let mut transport = TcpTransport {
            stream,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
        };
        transport.send("look").await.unwrap();
    }
}
