//! Wi-Fi station bring-up and the UDP transport for SNTP

use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use epdclock_core::ntp::{NtpTransport, TransportError};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use log::{info, warn};

const SOCKET_BUF_LEN: usize = 128;

/// Backing memory for the SNTP socket. Must outlive the transport.
pub struct SocketBuffers {
    rx_meta: [PacketMetadata; 2],
    rx: [u8; SOCKET_BUF_LEN],
    tx_meta: [PacketMetadata; 1],
    tx: [u8; SOCKET_BUF_LEN],
}

impl SocketBuffers {
    pub const fn new() -> Self {
        Self {
            rx_meta: [PacketMetadata::EMPTY; 2],
            rx: [0; SOCKET_BUF_LEN],
            tx_meta: [PacketMetadata::EMPTY; 1],
            tx: [0; SOCKET_BUF_LEN],
        }
    }
}

impl Default for SocketBuffers {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WifiCredentials {
    pub ssid: &'static str,
    pub password: &'static str,
}

/// SNTP over the Wi-Fi station interface.
///
/// The radio is only started by [`NtpTransport::connect`], so wakes that skip
/// synchronization never power it up.
pub struct WifiUdpTransport<'a> {
    stack: Stack<'static>,
    controller: &'a mut WifiController<'static>,
    credentials: WifiCredentials,
    socket: UdpSocket<'a>,
    port: u16,
    bound: bool,
}

impl<'a> WifiUdpTransport<'a> {
    pub fn new(
        stack: Stack<'static>,
        controller: &'a mut WifiController<'static>,
        credentials: WifiCredentials,
        buffers: &'a mut SocketBuffers,
        port: u16,
    ) -> Self {
        let socket = UdpSocket::new(
            stack,
            &mut buffers.rx_meta,
            &mut buffers.rx,
            &mut buffers.tx_meta,
            &mut buffers.tx,
        );
        Self {
            stack,
            controller,
            credentials,
            socket,
            port,
            bound: false,
        }
    }

    /// Disconnect and stop the radio before deep sleep.
    pub async fn shutdown(&mut self) {
        self.socket.close();
        if !matches!(self.controller.is_started(), Ok(true)) {
            return;
        }
        if let Err(e) = self.controller.disconnect_async().await {
            warn!("Wi-Fi: disconnect failed: {:?}", e);
        }
        if let Err(e) = self.controller.stop_async().await {
            warn!("Wi-Fi: stop failed: {:?}", e);
        }
        info!("Wi-Fi: stopped");
    }

    async fn associate(&mut self) -> Result<(), TransportError> {
        if self.credentials.ssid.is_empty() {
            warn!("Wi-Fi: no SSID configured");
            return Err(TransportError::LinkDown);
        }

        if !matches!(self.controller.is_started(), Ok(true)) {
            let client_config = ModeConfig::Client(
                ClientConfig::default()
                    .with_ssid(self.credentials.ssid.into())
                    .with_password(self.credentials.password.into()),
            );
            self.controller.set_config(&client_config).map_err(|e| {
                warn!("Wi-Fi: set_config failed: {:?}", e);
                TransportError::LinkDown
            })?;
            self.controller.start_async().await.map_err(|e| {
                warn!("Wi-Fi: start failed: {:?}", e);
                TransportError::LinkDown
            })?;
        }

        info!("Wi-Fi: connecting to {}", self.credentials.ssid);
        self.controller.connect_async().await.map_err(|e| {
            warn!("Wi-Fi: connect failed: {:?}", e);
            TransportError::LinkDown
        })
    }

    async fn wait_for_address(&self) {
        self.stack.wait_config_up().await;
        if let Some(config) = self.stack.config_v4() {
            info!("Wi-Fi: got address {}", config.address);
        }
    }
}

impl NtpTransport for WifiUdpTransport<'_> {
    type Addr = IpEndpoint;

    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.stack.is_config_up() {
            self.associate().await?;
            self.wait_for_address().await;
        }
        if !self.bound {
            self.socket.bind(0).map_err(|e| {
                warn!("UDP: bind failed: {:?}", e);
                TransportError::LinkDown
            })?;
            self.bound = true;
        }
        Ok(())
    }

    async fn resolve(&mut self, host: &str) -> Result<IpEndpoint, TransportError> {
        let addrs = self
            .stack
            .dns_query(host, DnsQueryType::A)
            .await
            .map_err(|e| {
                warn!("DNS: lookup of {} failed: {:?}", host, e);
                TransportError::Dns
            })?;
        let ip = addrs.first().copied().ok_or(TransportError::Dns)?;
        Ok(IpEndpoint::new(ip, self.port))
    }

    async fn send(&mut self, to: IpEndpoint, packet: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(packet, to).await.map_err(|e| {
            warn!("UDP: send to {} failed: {:?}", to, e);
            TransportError::Send
        })
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let (len, _meta) = self.socket.recv_from(buf).await.map_err(|e| {
            warn!("UDP: receive failed: {:?}", e);
            TransportError::Recv
        })?;
        Ok(len)
    }
}
