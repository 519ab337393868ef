/*!
Message transports feeding the acquisition worker.

A [`Transport`] hands out one parsed [`Message`] at a time and never blocks
longer than the poll timeout it is given, so the worker can keep checking
its running flag. Two byte-stream transports are provided:

- [`UdpTransport`] receives datagrams from a serial-to-UDP bridge on a
  tokio socket thread and forwards them through a bounded channel
- [`ReaderTransport`] decodes a recorded byte dump (or any other reader)
*/

use crate::config::TransportConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use shared::{Message, WireDecoder, WireError};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Largest datagram the bridge sends
const UDP_DATAGRAM_BYTES: usize = 4096;

/// Bytes pulled from a reader per decode attempt
const READ_CHUNK_BYTES: usize = 8192;

/// How long `connect` waits for the socket thread to bind
const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    #[error("Transport is not connected")]
    NotConnected,

    /// The stream ended cleanly; not a failure
    #[error("Transport closed")]
    Closed,
}

/// Source of parsed device messages
pub trait Transport: Send {
    /// Open the underlying link
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// Release the link. Must be safe to call more than once.
    fn shutdown(&mut self);
}

/// Receives wire-framed messages from a UDP bridge
pub struct UdpTransport {
    config: TransportConfig,
    decoder: WireDecoder,
    data_rx: Option<Receiver<Vec<u8>>>,
    local_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            decoder: WireDecoder::new(),
            data_rx: None,
            local_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            receiver: None,
        }
    }

    /// Address the socket is bound to, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn bind_socket(addr: &str, recv_buffer_bytes: usize) -> std::io::Result<UdpSocket> {
        info!("🔌 Binding UDP socket to {}", addr);
        let socket = UdpSocket::bind(addr).await?;

        let sock_ref = socket2::SockRef::from(&socket);
        sock_ref.set_recv_buffer_size(recv_buffer_bytes)?;
        info!("📊 Socket receive buffer set to {} bytes", recv_buffer_bytes);

        Ok(socket)
    }

    /// Socket loop - receives datagrams and forwards them to the worker
    async fn udp_receiver_thread(
        addr: String,
        recv_buffer_bytes: usize,
        data_tx: Sender<Vec<u8>>,
        ready_tx: Sender<Result<SocketAddr, String>>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        let socket = match Self::bind_socket(&addr, recv_buffer_bytes).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return Err(e);
            }
        };
        let _ = ready_tx.send(socket.local_addr().map_err(|e| e.to_string()));

        let mut buffer = vec![0u8; UDP_DATAGRAM_BYTES];
        let mut total_bytes = 0u64;
        let mut packet_count = 0u64;
        let mut dropped_count = 0u64;
        let start_time = Instant::now();

        while running.load(Ordering::SeqCst) {
            let timeout = Duration::from_millis(100);

            match tokio::time::timeout(timeout, socket.recv(&mut buffer)).await {
                Ok(Ok(bytes_received)) if bytes_received > 0 => {
                    total_bytes += bytes_received as u64;
                    packet_count += 1;

                    if data_tx.try_send(buffer[..bytes_received].to_vec()).is_err() {
                        error!("Data channel full, dropping datagram");
                        dropped_count += 1;
                    }

                    if packet_count % 1000 == 0 {
                        debug!(
                            "Received {} datagrams, {:.1} KB, {} dropped",
                            packet_count,
                            total_bytes as f64 / 1024.0,
                            dropped_count
                        );
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!("UDP receive error: {}", e);
                }
                Err(_) => {
                    // Timeout - check the running flag again
                    continue;
                }
            }
        }

        info!("📈 UDP receiver final stats:");
        info!("   Datagrams: {}", packet_count);
        info!("   Bytes: {:.1} KB", total_bytes as f64 / 1024.0);
        info!("   Dropped: {}", dropped_count);
        info!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());

        Ok(())
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.receiver.is_some() {
            return Ok(());
        }

        let (data_tx, data_rx) = bounded::<Vec<u8>>(self.config.channel_buffer_size.max(1));
        let (ready_tx, ready_rx) = bounded(1);

        let addr = format!("{}:{}", self.config.udp_bind_addr, self.config.udp_port);
        let recv_buffer_bytes = self.config.recv_buffer_bytes;
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("udp-receiver".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("tokio runtime: {}", e)));
                        return;
                    }
                };
                let result = rt.block_on(Self::udp_receiver_thread(
                    addr,
                    recv_buffer_bytes,
                    data_tx,
                    ready_tx,
                    running,
                ));
                match result {
                    Ok(()) => info!("UDP receiver thread finished successfully"),
                    Err(e) => error!("UDP receiver thread failed: {}", e),
                }
            })?;
        self.receiver = Some(handle);

        match ready_rx.recv_timeout(BIND_TIMEOUT) {
            Ok(Ok(local_addr)) => {
                info!("✅ UDP socket bound to {}", local_addr);
                self.local_addr = Some(local_addr);
                self.data_rx = Some(data_rx);
                Ok(())
            }
            Ok(Err(reason)) => {
                self.shutdown();
                Err(TransportError::Connect(reason))
            }
            Err(_) => {
                self.shutdown();
                Err(TransportError::Connect("UDP receiver did not start".to_string()))
            }
        }
    }

    fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if let Some(message) = self.decoder.next_message() {
            return Ok(Some(message?));
        }

        let data_rx = self.data_rx.as_ref().ok_or(TransportError::NotConnected)?;
        match data_rx.recv_timeout(timeout) {
            Ok(datagram) => {
                self.decoder.push(&datagram);
                Ok(self.decoder.next_message().transpose()?)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected(
                "UDP receiver has stopped".to_string(),
            )),
        }
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.data_rx = None;
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("UDP receiver thread panicked");
            }
            let (decoded, skipped) = self.decoder.stats();
            info!("UDP transport closed: {} messages decoded, {} bytes skipped", decoded, skipped);
        }
    }
}

/// Decodes messages from any byte reader, typically a recorded session dump.
///
/// End of input is reported as [`TransportError::Closed`].
pub struct ReaderTransport<R> {
    reader: R,
    label: String,
    decoder: WireDecoder,
    chunk: Vec<u8>,
    exhausted: bool,
}

impl ReaderTransport<BufReader<File>> {
    /// Open a recorded dump
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::new(file), path.as_ref().display().to_string()))
    }
}

impl<R: Read + Send> ReaderTransport<R> {
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self {
            reader,
            label: label.into(),
            decoder: WireDecoder::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            exhausted: false,
        }
    }
}

impl<R: Read + Send> Transport for ReaderTransport<R> {
    fn connect(&mut self) -> Result<(), TransportError> {
        info!("📂 Replaying {}", self.label);
        Ok(())
    }

    fn next_message(&mut self, _timeout: Duration) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some(message) = self.decoder.next_message() {
                return Ok(Some(message?));
            }
            if self.exhausted {
                return Err(TransportError::Closed);
            }

            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.exhausted = true;
                    if self.decoder.buffered() > 0 {
                        warn!(
                            "{} ends with {} bytes of an incomplete message",
                            self.label,
                            self.decoder.buffered()
                        );
                    }
                }
                Ok(n) => self.decoder.push(&self.chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn shutdown(&mut self) {
        let (decoded, skipped) = self.decoder.stats();
        debug!("{}: {} messages decoded, {} bytes skipped", self.label, decoded, skipped);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Plays back a fixed list of transport results
    pub struct ScriptedTransport {
        script: VecDeque<Result<Option<Message>, TransportError>>,
        connect_error: Option<String>,
        hold_open: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        pub fn new(messages: Vec<Message>) -> Self {
            Self {
                script: messages.into_iter().map(|m| Ok(Some(m))).collect(),
                connect_error: None,
                hold_open: false,
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Fail with `error` once the messages are used up
        pub fn then_error(mut self, error: TransportError) -> Self {
            self.script.push_back(Err(error));
            self
        }

        /// Keep returning timeouts instead of closing when the script ends
        pub fn hold_open(mut self) -> Self {
            self.hold_open = true;
            self
        }

        pub fn failing_connect(mut self, reason: &str) -> Self {
            self.connect_error = Some(reason.to_string());
            self
        }

        pub fn shutdown_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.shutdowns)
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self) -> Result<(), TransportError> {
            match self.connect_error.take() {
                Some(reason) => Err(TransportError::Connect(reason)),
                None => Ok(()),
            }
        }

        fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
            match self.script.pop_front() {
                Some(step) => step,
                None if self.hold_open => {
                    thread::sleep(timeout);
                    Ok(None)
                }
                None => Err(TransportError::Closed),
            }
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}
