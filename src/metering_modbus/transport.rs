use std::time::Duration;
use log::debug;
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{ModbusConfig, ModbusProtoConfig};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("read timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("modbus frame error: {0}")]
    Frame(String),
}

/// Register-read access to the shared field bus. The poll loop owns the
/// transport exclusively, reads are never issued concurrently.
pub trait Transport {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn read_registers(
        &mut self,
        unit_id: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError>;
    fn is_connected(&self) -> bool;
    async fn close(&mut self);
}

/// Modbus over a TCP stream, either with TCP framing or RTU framing
/// (RTU over TCP adds all of those fancy CRC bytes).
pub struct TcpTransport {
    addr: String,
    proto: ModbusProto,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(config: &ModbusConfig) -> Self {
        let proto = match config.proto {
            ModbusProtoConfig::TCP => ModbusProto::TcpUdp,
            ModbusProtoConfig::RTUoverTCP => ModbusProto::Rtu,
        };

        return TcpTransport {
            addr: format!("{}:{}", config.host, config.port),
            proto,
            stream: None,
        };
    }
}

async fn exchange(
    stream: &mut TcpStream,
    proto: ModbusProto,
    unit_id: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, TransportError> {
    let mut mreq = ModbusRequest::new(unit_id, proto);
    let mut request = Vec::new();
    mreq.generate_get_holdings(start, count, &mut request)
        .map_err(|e| TransportError::Frame(format!("{:?}", e)))?;

    stream.write_all(&request).await?;

    let mut buf = [0u8; 6];
    let bytes_read = stream.read(&mut buf).await?;
    if bytes_read == 0 {
        return Err(TransportError::ConnectionClosed);
    }

    let mut response = Vec::new();
    response.extend_from_slice(&buf[..bytes_read]);

    let len = guess_response_frame_len(&buf, proto)
        .map_err(|e| TransportError::Frame(format!("{:?}", e)))?;
    if len as usize > bytes_read {
        let mut rest = vec![0u8; len as usize - bytes_read];
        stream.read_exact(&mut rest).await?;
        response.extend(rest);
    }

    let mut data = Vec::new();
    mreq.parse_u16(&response, &mut data)
        .map_err(|e| TransportError::Frame(format!("{:?}", e)))?;
    return Ok(data);
}

impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connect(self.addr.clone(), e.to_string()))?;
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        debug!("Connected to Modbus endpoint {}", self.addr);
        return Ok(());
    }

    async fn read_registers(
        &mut self,
        unit_id: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        match tokio::time::timeout(timeout, exchange(stream, self.proto, unit_id, start, count)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => {
                if matches!(e, TransportError::Io(_) | TransportError::ConnectionClosed) {
                    self.stream = None;
                }
                Err(e)
            }
            Err(_) => {
                /* A late reply would desync the framing, so the session is dropped */
                self.stream = None;
                Err(TransportError::Timeout)
            }
        }
    }

    fn is_connected(&self) -> bool {
        return self.stream.is_some();
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config(host: &str, port: u16) -> ModbusConfig {
        ModbusConfig {
            host: host.to_string(),
            port,
            proto: ModbusProtoConfig::TCP,
            read_timeout_ms: 500,
            group_delay_ms: 1,
            cycle_delay_ms: 100,
            devices: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_read_without_connect_fails() {
        let mut transport = TcpTransport::new(&test_config("127.0.0.1", 50200));
        let result = transport.read_registers(1, 2999, 6, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Grab a free port and release it again, nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::new(&test_config("127.0.0.1", port));
        assert!(matches!(transport.connect().await, Err(TransportError::Connect(_, _))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_drops_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Accept and hold the connection open without ever answering
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut transport = TcpTransport::new(&test_config("127.0.0.1", addr.port()));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        let result = transport.read_registers(1, 2999, 6, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(!transport.is_connected());

        server.abort();
    }

    #[tokio::test]
    async fn test_closed_peer_drops_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Accept and close immediately
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = TcpTransport::new(&test_config("127.0.0.1", addr.port()));
        transport.connect().await.unwrap();
        server.await.unwrap();

        let result = transport.read_registers(1, 2999, 6, Duration::from_millis(500)).await;
        assert!(result.is_err());
        assert!(!transport.is_connected());
    }
}
