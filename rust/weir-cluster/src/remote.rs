//! Minimal framed-JSON TCP client.
//!
//! One JSON object per line in both directions. Registry calls are unary
//! request/response over a shared connection; writers and streamers each own
//! a dedicated connection so frame traffic never head-of-line blocks
//! registry lookups. Heavier transports (protobuf, TLS) live outside the
//! driver behind the same [`Client`] trait.

use std::io::{BufRead, BufReader, Write as IoWrite};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};

use crate::client::{Client, Streamer, StreamerConfig, Writer, WriterConfig};
use crate::keys::{RackKey, TaskKey};
use crate::types::{Channel, Device, Rack, Task};

/// Connection parameters from the driver config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ca_cert_file: String,
    pub client_cert_file: String,
    pub client_key_file: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
            username: String::new(),
            password: String::new(),
            ca_cert_file: String::new(),
            client_cert_file: String::new(),
            client_key_file: String::new(),
        }
    }
}

impl ConnectionConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Serialize)]
struct Request<'a, T: Serialize> {
    op: &'a str,
    payload: T,
}

#[derive(Deserialize)]
struct Response<T> {
    #[serde(default)]
    error: Option<String>,
    payload: Option<T>,
}

fn io_err(err: std::io::Error) -> Error {
    Error::new(errors::UNREACHABLE, err.to_string())
}

struct Conn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Conn {
    fn dial(cfg: &ConnectionConfig) -> errors::Result<Self> {
        let stream = TcpStream::connect(cfg.addr()).map_err(io_err)?;
        stream.set_nodelay(true).map_err(io_err)?;
        let reader = BufReader::new(stream.try_clone().map_err(io_err)?);
        let mut conn = Self { stream, reader };
        if !cfg.username.is_empty() {
            let _: Response<serde_json::Value> = conn.request(
                "auth.login",
                json!({ "username": cfg.username, "password": cfg.password }),
            )?;
        }
        Ok(conn)
    }

    fn send<T: Serialize>(&mut self, op: &str, payload: T) -> errors::Result<()> {
        let mut line = serde_json::to_string(&Request { op, payload })
            .map_err(|e| Error::new(errors::UNEXPECTED, e.to_string()))?;
        line.push('\n');
        self.stream.write_all(line.as_bytes()).map_err(io_err)
    }

    fn recv<T: DeserializeOwned>(&mut self) -> errors::Result<Response<T>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(io_err)?;
        if n == 0 {
            return Err(Error::new(errors::EOF, "connection closed"));
        }
        serde_json::from_str(&line).map_err(|e| Error::new(errors::UNEXPECTED, e.to_string()))
    }

    fn request<T: Serialize, R: DeserializeOwned>(
        &mut self,
        op: &str,
        payload: T,
    ) -> errors::Result<Response<R>> {
        self.send(op, payload)?;
        let res: Response<R> = self.recv()?;
        if let Some(wire) = &res.error {
            let err = Error::parse(wire);
            if !err.ok() {
                return Err(err);
            }
        }
        Ok(res)
    }
}

/// A cluster client over a live socket.
pub struct RemoteCluster {
    config: ConnectionConfig,
    unary: Mutex<Option<Conn>>,
}

impl RemoteCluster {
    /// Builds a client. The first request dials; no connection is held while
    /// the cluster is unreachable, so the breaker-driven retry loops above
    /// this layer own the reconnect policy.
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, unary: Mutex::new(None) }
    }

    fn unary<T: Serialize, R: DeserializeOwned>(&self, op: &str, payload: T) -> errors::Result<R> {
        let mut guard = self.unary.lock();
        if guard.is_none() {
            debug!(addr = %self.config.addr(), "dialing cluster");
            *guard = Some(Conn::dial(&self.config)?);
        }
        let conn = guard.as_mut().unwrap_or_else(|| unreachable!("connection just established"));
        let result: errors::Result<Response<R>> = conn.request(op, payload);
        match result {
            Ok(res) => res
                .payload
                .ok_or_else(|| Error::new(errors::UNEXPECTED, format!("{op}: empty payload"))),
            Err(err) => {
                // Drop the broken connection so the next call redials.
                if err.matches(errors::UNREACHABLE) || err.matches(errors::EOF) {
                    *guard = None;
                }
                Err(err)
            }
        }
    }
}

impl Client for RemoteCluster {
    fn retrieve_channel(&self, name: &str) -> errors::Result<Channel> {
        self.unary("channel.retrieve", json!({ "name": name }))
    }

    fn retrieve_channels(&self, keys: &[ChannelKey]) -> errors::Result<Vec<Channel>> {
        self.unary("channel.retrieve_many", json!({ "keys": keys }))
    }

    fn create_channel(&self, channel: Channel) -> errors::Result<Channel> {
        self.unary("channel.create", channel)
    }

    fn retrieve_rack(&self, key: RackKey) -> errors::Result<Rack> {
        self.unary("rack.retrieve", json!({ "key": key }))
    }

    fn create_rack(&self, name: &str) -> errors::Result<Rack> {
        self.unary("rack.create", json!({ "name": name }))
    }

    fn retrieve_task(&self, key: TaskKey) -> errors::Result<Task> {
        self.unary("task.retrieve", json!({ "key": key }))
    }

    fn retrieve_rack_tasks(&self, rack: RackKey) -> errors::Result<Vec<Task>> {
        self.unary("task.retrieve_rack", json!({ "rack": rack }))
    }

    fn create_task(&self, task: &Task) -> errors::Result<Task> {
        self.unary("task.create", task)
    }

    fn retrieve_device(&self, key: &str) -> errors::Result<Device> {
        self.unary("device.retrieve", json!({ "key": key }))
    }

    fn retrieve_rack_devices(&self, rack: RackKey) -> errors::Result<Vec<Device>> {
        self.unary("device.retrieve_rack", json!({ "rack": rack }))
    }

    fn create_device(&self, device: &Device) -> errors::Result<Device> {
        self.unary("device.create", device)
    }

    fn delete_device(&self, key: &str) -> errors::Result<()> {
        let _: serde_json::Value = self.unary("device.delete", json!({ "key": key }))?;
        Ok(())
    }

    fn open_writer(&self, config: WriterConfig) -> errors::Result<Box<dyn Writer>> {
        let mut conn = Conn::dial(&self.config)?;
        let _: Response<serde_json::Value> = conn.request("writer.open", &config)?;
        Ok(Box::new(RemoteWriter { conn }))
    }

    fn open_streamer(&self, config: StreamerConfig) -> errors::Result<Arc<dyn Streamer>> {
        let mut conn = Conn::dial(&self.config)?;
        let _: Response<serde_json::Value> = conn.request("streamer.open", &config)?;
        Ok(Arc::new(RemoteStreamer {
            stream: conn.stream.try_clone().map_err(io_err)?,
            reader: Mutex::new(conn),
        }))
    }
}

struct RemoteWriter {
    conn: Conn,
}

impl Writer for RemoteWriter {
    fn write(&mut self, frame: &Frame) -> errors::Result<()> {
        let _: Response<serde_json::Value> = self.conn.request("writer.write", frame)?;
        Ok(())
    }

    fn set_authority(&mut self, keys: &[ChannelKey], authorities: &[u8]) -> errors::Result<()> {
        let _: Response<serde_json::Value> = self
            .conn
            .request("writer.set_authority", json!({ "keys": keys, "authorities": authorities }))?;
        Ok(())
    }

    fn close(&mut self) -> errors::Result<()> {
        let _ = self.conn.send("writer.close", json!({}));
        self.conn.stream.shutdown(Shutdown::Both).map_err(io_err)
    }
}

struct RemoteStreamer {
    stream: TcpStream,
    reader: Mutex<Conn>,
}

impl Streamer for RemoteStreamer {
    fn read(&self) -> errors::Result<Frame> {
        let mut conn = self.reader.lock();
        let res: Response<Frame> = conn.recv()?;
        if let Some(wire) = &res.error {
            let err = Error::parse(wire);
            if !err.ok() {
                return Err(err);
            }
        }
        res.payload
            .ok_or_else(|| Error::new(errors::UNEXPECTED, "streamer push without frame"))
    }

    fn close_send(&self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite2;
    use std::net::TcpListener;

    #[test]
    fn unreachable_host_maps_to_unreachable() {
        let client = RemoteCluster::new(ConnectionConfig {
            host: "127.0.0.1".to_string(),
            // Reserved port nothing listens on during tests.
            port: 1,
            ..ConnectionConfig::default()
        });
        let err = client.retrieve_channel("weir_task_set").unwrap_err();
        assert!(err.matches(errors::UNREACHABLE));
    }

    #[test]
    fn unary_round_trip_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["op"], "channel.retrieve");
            let mut stream = stream;
            let payload = json!({
                "error": null,
                "payload": {"key": 9, "name": "ai_0", "data_type": "float64"}
            });
            writeln!(stream, "{payload}").unwrap();
        });

        let client = RemoteCluster::new(ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            ..ConnectionConfig::default()
        });
        let channel = client.retrieve_channel("ai_0").unwrap();
        assert_eq!(channel.key, 9);
        server.join().unwrap();
    }

    #[test]
    fn server_error_surfaces_with_kind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut stream = stream;
            writeln!(
                stream,
                "{}",
                json!({ "error": "sy.query.not_found---no such channel", "payload": null })
            )
            .unwrap();
        });

        let client = RemoteCluster::new(ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            ..ConnectionConfig::default()
        });
        let err = client.retrieve_channel("missing").unwrap_err();
        assert!(err.matches(errors::NOT_FOUND));
        assert_eq!(err.data, "no such channel");
        server.join().unwrap();
    }
}
