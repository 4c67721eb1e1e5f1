// MuLES acquisition-server client
//
// One TCP connection, one outstanding request at a time. The server answers the
// header, names and request commands with a length-prefixed frame; flush, kill
// and trigger commands have no reply.
//
// If a request/response exchange is abandoned half way (its future dropped on
// cancellation or timeout) the connection can no longer be trusted to sit on a
// frame boundary. The next exchange then drops the socket and reports a
// connection error so the caller reconnects.

use super::codec::{self, Command, LENGTH_PREFIX};
use super::SampleSource;
use crate::config::{seconds_to_samples, ClientConfig};
use crate::error::{StreamError, StreamResult};
use crate::types::{DeviceParams, FormatCode, SampleChunk};
use async_trait::async_trait;
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

pub struct MulesClient {
    config: ClientConfig,
    stream: Option<TcpStream>,
    params: Option<DeviceParams>,
    in_flight: bool,
}

fn read_error(e: std::io::Error, what: &str) -> StreamError {
    if e.kind() == ErrorKind::UnexpectedEof {
        StreamError::Framing(format!("Connection closed while reading {}", what))
    } else {
        StreamError::Connection(format!("Failed to read {}: {}", what, e))
    }
}

async fn write_command(stream: &mut TcpStream, command: Command) -> StreamResult<()> {
    stream
        .write_all(&[command.as_byte()])
        .await
        .map_err(|e| StreamError::Connection(format!("Failed to send {:?}: {}", command, e)))
}

async fn read_frame(stream: &mut TcpStream) -> StreamResult<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| read_error(e, "length prefix"))?;

    let len = codec::payload_length(prefix)?;
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| read_error(e, "payload"))?;

    Ok(payload)
}

impl MulesClient {
    /// Disconnected client; call [`MulesClient::connect`] before any request
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            stream: None,
            params: None,
            in_flight: false,
        }
    }

    /// Connect and negotiate device parameters
    pub async fn open(config: ClientConfig) -> StreamResult<Self> {
        let mut client = Self::new(config);
        client.connect().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the TCP session and read header and channel names
    ///
    /// Either the client ends up connected with known device parameters, or it
    /// stays disconnected.
    pub async fn connect(&mut self) -> StreamResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = self.config.address();
        log::info!("Connecting to acquisition server at {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| {
                StreamError::Connection(format!("TCP connection to {} failed: {}", addr, e))
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to disable Nagle on {}: {}", addr, e);
        }

        self.stream = Some(stream);
        self.in_flight = false;

        match self.negotiate().await {
            Ok(params) => {
                log::info!(
                    "Connected to {} ({}): {} columns [{}] @ {} Hz",
                    params.name,
                    params.hardware,
                    params.n_columns(),
                    params.data_format_tags(),
                    params.fs
                );
                self.params = Some(params);
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                self.params = None;
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self) -> StreamResult<DeviceParams> {
        let header = self.get_header().await?;
        let channel_names = self.get_channel_names().await?;

        if header.channel_count != header.data_format.len() {
            log::warn!(
                "Header announces {} channels but {} data format codes",
                header.channel_count,
                header.data_format.len()
            );
        }
        if channel_names.len() != header.data_format.len() {
            log::warn!(
                "Received {} channel names for {} data columns",
                channel_names.len(),
                header.data_format.len()
            );
        }

        Ok(DeviceParams {
            name: header.name,
            hardware: header.hardware,
            fs: header.fs,
            data_format: header.data_format,
            channel_count: header.channel_count,
            channel_names,
        })
    }

    /// Close the socket; device parameters are kept for inspection
    pub async fn disconnect(&mut self) {
        match self.stream.take() {
            Some(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    log::debug!("Socket shutdown failed: {}", e);
                }
                self.in_flight = false;
                log::info!("Disconnected from {}", self.config.address());
            }
            None => log::debug!("Disconnect requested while not connected"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn params(&self) -> Option<&DeviceParams> {
        self.params.as_ref()
    }

    pub fn fs(&self) -> Option<f64> {
        self.params.as_ref().map(DeviceParams::fs)
    }

    pub fn device_name(&self) -> Option<&str> {
        self.params.as_ref().map(DeviceParams::device_name)
    }

    /// Socket for a new exchange, marked busy until the exchange completes
    fn begin_exchange(&mut self) -> StreamResult<&mut TcpStream> {
        if self.in_flight {
            log::warn!("Previous exchange was interrupted, dropping the connection");
            self.stream = None;
            self.in_flight = false;
            return Err(StreamError::Connection(
                "Connection interrupted mid-exchange, reconnect required".to_string(),
            ));
        }
        self.in_flight = true;
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => {
                self.in_flight = false;
                Err(StreamError::Connection("Not connected".to_string()))
            }
        }
    }

    fn end_exchange<T>(&mut self, result: StreamResult<T>) -> StreamResult<T> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.requires_reconnect() {
                log::warn!("Dropping connection after failure: {}", e);
                self.stream = None;
            }
        }
        result
    }

    /// Send a single command byte
    pub async fn send_command(&mut self, command: Command) -> StreamResult<()> {
        log::debug!("Sending {:?}", command);
        let stream = self.begin_exchange()?;
        let result = write_command(stream, command).await;
        self.end_exchange(result)
    }

    /// Read one length-prefixed message
    pub async fn receive_message(&mut self) -> StreamResult<Vec<u8>> {
        let stream = self.begin_exchange()?;
        let result = read_frame(stream).await;
        self.end_exchange(result)
    }

    /// Send a command and read its reply as one exchange
    async fn request(&mut self, command: Command) -> StreamResult<Vec<u8>> {
        log::debug!("Requesting {:?}", command);
        let stream = self.begin_exchange()?;
        let result = match write_command(stream, command).await {
            Ok(()) => read_frame(stream).await,
            Err(e) => Err(e),
        };
        let payload = self.end_exchange(result)?;
        log::debug!("{:?} reply: {} bytes", command, payload.len());
        Ok(payload)
    }

    fn require_params(&self) -> StreamResult<&DeviceParams> {
        self.params.as_ref().ok_or_else(|| {
            StreamError::Connection("Device parameters not negotiated yet".to_string())
        })
    }

    /// Query the header again; the negotiated parameters are left untouched
    pub async fn get_header(&mut self) -> StreamResult<codec::Header> {
        codec::parse_header(&self.request(Command::Header).await?)
    }

    pub async fn get_channel_names(&mut self) -> StreamResult<Vec<String>> {
        Ok(codec::parse_channel_names(&self.request(Command::Names).await?))
    }

    /// Everything the server buffered since the last request
    pub async fn get_all_data(&mut self) -> StreamResult<Array2<f64>> {
        let format = self.require_params()?.data_format.clone();
        self.request_block(&format).await
    }

    async fn request_block(&mut self, format: &[FormatCode]) -> StreamResult<Array2<f64>> {
        let payload = self.request(Command::Request).await?;
        codec::decode_data(&payload, format)
    }

    /// Exactly `round(seconds * fs)` of the newest samples
    ///
    /// Requests data until enough rows have arrived, sleeping for the poll
    /// interval after empty replies. With `flush` the server buffer is emptied
    /// first so only fresh samples are returned. A zero-length request returns
    /// immediately without touching the socket.
    pub async fn get_data(&mut self, seconds: f64, flush: bool) -> StreamResult<Array2<f64>> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(StreamError::InvalidInput(format!(
                "Cannot request {} seconds of data",
                seconds
            )));
        }

        let params = self.require_params()?;
        let target = seconds_to_samples(seconds, params.fs);
        let format = params.data_format.clone();
        if target == 0 {
            return Ok(Array2::zeros((0, format.len())));
        }

        if flush {
            self.flush().await?;
        }

        match self.config.data_timeout_ms {
            Some(ms) => timeout(Duration::from_millis(ms), self.accumulate(target, &format))
                .await
                .map_err(|_| {
                    StreamError::Timeout(format!(
                        "{} samples not received within {} ms",
                        target, ms
                    ))
                })?,
            None => self.accumulate(target, &format).await,
        }
    }

    async fn accumulate(
        &mut self,
        target: usize,
        format: &[FormatCode],
    ) -> StreamResult<Array2<f64>> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut blocks: Vec<Array2<f64>> = Vec::new();
        let mut needed = target;

        while needed > 0 {
            let block = self.request_block(format).await?;
            if block.nrows() == 0 {
                sleep(poll_interval).await;
                continue;
            }
            needed = needed.saturating_sub(block.nrows());
            blocks.push(block);
        }

        let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
        let all = concatenate(Axis(0), &views)
            .map_err(|e| StreamError::Protocol(format!("Inconsistent data blocks: {}", e)))?;
        let start = all.nrows() - target;

        Ok(all.slice(s![start.., ..]).to_owned())
    }

    /// Ask the server to discard its buffered samples
    pub async fn flush(&mut self) -> StreamResult<()> {
        self.send_command(Command::Flush).await
    }

    /// Ask the server to shut down, then close the connection
    pub async fn kill(&mut self) -> StreamResult<()> {
        self.send_command(Command::Kill).await?;
        self.disconnect().await;
        Ok(())
    }

    /// Mark an event in the recording with a trigger code in 1..=64
    pub async fn send_trigger(&mut self, code: u8) -> StreamResult<()> {
        self.send_command(Command::trigger(code)?).await
    }
}

#[async_trait]
impl SampleSource for MulesClient {
    async fn connect(&mut self) -> StreamResult<()> {
        MulesClient::connect(self).await
    }

    async fn read_chunk(&mut self, min_seconds: f64) -> StreamResult<SampleChunk> {
        let samples = self.get_data(min_seconds, false).await?;
        Ok(SampleChunk::new(samples))
    }

    async fn flush(&mut self) -> StreamResult<()> {
        MulesClient::flush(self).await
    }

    async fn stop(&mut self) -> StreamResult<()> {
        self.disconnect().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        MulesClient::is_connected(self)
    }

    fn params(&self) -> Option<&DeviceParams> {
        MulesClient::params(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_when_disconnected() {
        let mut client = MulesClient::new(ClientConfig::default());
        assert!(!client.is_connected());
        assert!(client.fs().is_none());
        assert!(matches!(
            client.send_command(Command::Flush).await,
            Err(StreamError::Connection(_))
        ));
        assert!(matches!(
            client.get_all_data().await,
            Err(StreamError::Connection(_))
        ));
        // Nothing to close
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_no_state() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = MulesClient::new(ClientConfig::new("127.0.0.1", port));
        assert!(matches!(
            client.connect().await,
            Err(StreamError::Connection(_))
        ));
        assert!(!client.is_connected());
        assert!(client.params().is_none());
    }

    #[tokio::test]
    async fn test_invalid_trigger_sends_nothing() {
        let mut client = MulesClient::new(ClientConfig::default());
        assert!(matches!(
            client.send_trigger(0).await,
            Err(StreamError::InvalidInput(_))
        ));
    }
}
