use embassy_time::{Duration, with_timeout};
use log::{info, warn};
use thiserror_no_std::Error;

use super::packet::{
    NTP_PACKET_LEN, PacketError, clock_offset_us, decode_response, encode_request, round_trip_us,
};
use crate::clock::{Clock, Timestamp};
use crate::config::SyncConfig;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("network link could not be brought up")]
    LinkDown,
    #[error("name resolution failed")]
    Dns,
    #[error("send failed")]
    Send,
    #[error("receive failed")]
    Recv,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("network unavailable: {0}")]
    Network(TransportError),
    #[error("all time servers failed")]
    AllServersFailed,
}

#[derive(Debug)]
enum ServerError {
    Transport(TransportError),
    Packet(PacketError),
}

impl From<TransportError> for ServerError {
    fn from(e: TransportError) -> Self {
        ServerError::Transport(e)
    }
}

impl From<PacketError> for ServerError {
    fn from(e: PacketError) -> Self {
        ServerError::Packet(e)
    }
}

/// Datagram access to the time servers.
pub trait NtpTransport {
    type Addr: Copy;

    /// Bring the link up (association, address assignment).
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>>;

    fn resolve(&mut self, host: &str) -> impl Future<Output = Result<Self::Addr, TransportError>>;

    fn send(
        &mut self,
        to: Self::Addr,
        packet: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>>;

    /// Wait for the next datagram, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, TransportError>>;
}

/// A link that could not be created this wake behaves as one that never comes up.
impl<T: NtpTransport> NtpTransport for Option<T> {
    type Addr = T::Addr;

    async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            Some(transport) => transport.connect().await,
            None => Err(TransportError::LinkDown),
        }
    }

    async fn resolve(&mut self, host: &str) -> Result<T::Addr, TransportError> {
        match self {
            Some(transport) => transport.resolve(host).await,
            None => Err(TransportError::LinkDown),
        }
    }

    async fn send(&mut self, to: T::Addr, packet: &[u8]) -> Result<(), TransportError> {
        match self {
            Some(transport) => transport.send(to, packet).await,
            None => Err(TransportError::LinkDown),
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self {
            Some(transport) => transport.recv(buf).await,
            None => Err(TransportError::LinkDown),
        }
    }
}

/// Outcome of one successful exchange. Nothing has been committed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    /// Corrected wall time at the moment the reply arrived.
    pub corrected_at_arrival: Timestamp,
    pub arrival_uptime_us: u64,
    /// Server time minus local time.
    pub offset_us: i64,
    pub round_trip_us: i64,
    /// Local wall time captured before the first server was tried.
    pub pre_sync_local: Option<Timestamp>,
    pub pre_sync_uptime_us: u64,
    /// Position of the answering server in the configured list.
    pub server_index: usize,
}

impl SyncSample {
    /// The corrected time at `uptime_us`, accounting for work done since arrival.
    pub fn corrected_at(&self, uptime_us: u64) -> Timestamp {
        let since_arrival = uptime_us.saturating_sub(self.arrival_uptime_us) as i64;
        self.corrected_at_arrival.offset_by(since_arrival)
    }
}

/// Set the clock from a sample as of `uptime_us`. Returns the committed time.
pub fn commit<C: Clock>(sample: &SyncSample, clock: &mut C, uptime_us: u64) -> Timestamp {
    let now = sample.corrected_at(uptime_us);
    clock.set(now);
    info!(
        "Clock set to {}.{:06} (offset {} us, rtt {} us)",
        now.secs, now.micros, sample.offset_us, sample.round_trip_us
    );
    now
}

/// Local time for the exchange. Uptime stands in while the wall clock is unset,
/// which keeps the offset math valid: the offset then carries the absolute time.
fn local_time<C: Clock>(clock: &C) -> Timestamp {
    clock
        .now()
        .unwrap_or_else(|| Timestamp::from_micros(clock.uptime_us() as i64))
}

pub struct TimeSyncClient<'a> {
    config: &'a SyncConfig,
}

impl<'a> TimeSyncClient<'a> {
    pub fn new(config: &'a SyncConfig) -> Self {
        Self { config }
    }

    /// Query the configured servers in order until one answers.
    pub async fn sync<T, C>(&self, transport: &mut T, clock: &C) -> Result<SyncSample, SyncError>
    where
        T: NtpTransport,
        C: Clock,
    {
        let pre_sync_local = clock.now();
        let pre_sync_uptime_us = clock.uptime_us();

        transport.connect().await.map_err(|e| {
            warn!("NTP: link not available: {}", e);
            SyncError::Network(e)
        })?;

        let timeout = Duration::from_millis(self.config.per_server_timeout_ms);
        for (index, server) in self.config.servers.iter().enumerate() {
            info!("NTP: querying {}", server.as_str());
            match with_timeout(timeout, self.query(transport, clock, server.as_str())).await {
                Ok(Ok((offset_us, round_trip_us, t4, arrival_uptime_us))) => {
                    info!(
                        "NTP: {} answered, offset {} us, rtt {} us",
                        server.as_str(),
                        offset_us,
                        round_trip_us
                    );
                    return Ok(SyncSample {
                        corrected_at_arrival: t4.offset_by(offset_us),
                        arrival_uptime_us,
                        offset_us,
                        round_trip_us,
                        pre_sync_local,
                        pre_sync_uptime_us,
                        server_index: index,
                    });
                }
                Ok(Err(e)) => warn!("NTP: {} failed: {:?}", server.as_str(), e),
                Err(_) => warn!("NTP: {} timed out", server.as_str()),
            }
        }

        warn!("NTP: all servers failed");
        Err(SyncError::AllServersFailed)
    }

    async fn query<T, C>(
        &self,
        transport: &mut T,
        clock: &C,
        server: &str,
    ) -> Result<(i64, i64, Timestamp, u64), ServerError>
    where
        T: NtpTransport,
        C: Clock,
    {
        let addr = transport.resolve(server).await?;

        let t1 = local_time(clock);
        transport.send(addr, &encode_request(t1)).await?;

        let mut buf = [0u8; NTP_PACKET_LEN + 20];
        let len = transport.recv(&mut buf).await?;
        let t4 = local_time(clock);
        let arrival_uptime_us = clock.uptime_us();

        let times = decode_response(&buf[..len], t1)?;
        let offset = clock_offset_us(t1, times.receive, times.transmit, t4);
        let rtt = round_trip_us(t1, times.receive, times.transmit, t4);
        Ok((offset, rtt, t4, arrival_uptime_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerName, SyncConfig};
    use crate::mock::{MockClock, MockNtpServer, ServerBehavior};
    use embassy_futures::block_on;

    const START: Timestamp = Timestamp::new(1_767_225_600, 0);

    fn config(servers: &[&str], timeout_ms: u64) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.servers.clear();
        for s in servers {
            let mut name = ServerName::new();
            name.push_str(s).unwrap();
            config.servers.push(name).unwrap();
        }
        config.per_server_timeout_ms = timeout_ms;
        config
    }

    #[test]
    fn test_sync_from_unset_clock_yields_true_time() {
        let clock = MockClock::power_on(START);
        let mut server = MockNtpServer::new(clock.clone()).with_delay(20_000);
        let config = config(&["a.example"], 1_000);

        let sample = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock)).unwrap();
        assert_eq!(sample.pre_sync_local, None);
        assert_eq!(sample.round_trip_us, 40_000);
        // Symmetric delay: corrected time equals true time at arrival.
        assert_eq!(sample.corrected_at_arrival, clock.true_time());
    }

    #[test]
    fn test_commit_accounts_for_processing_delay() {
        let mut clock = MockClock::power_on(START);
        let mut server = MockNtpServer::new(clock.clone());
        let config = config(&["a.example"], 1_000);
        let sample = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock)).unwrap();

        clock.advance(750_000);
        let uptime_us = clock.uptime_us();
        let committed = commit(&sample, &mut clock, uptime_us);
        assert_eq!(committed, clock.true_time());
        assert_eq!(committed, sample.corrected_at(uptime_us));
        assert_eq!(clock.error_us(), Some(0));
    }

    #[test]
    fn test_falls_back_in_order() {
        let clock = MockClock::power_on(START);
        let mut server = MockNtpServer::new(clock.clone())
            .with_server("a.example", ServerBehavior::Unresolvable)
            .with_server("b.example", ServerBehavior::KissOfDeath);
        let config = config(&["a.example", "b.example", "c.example"], 1_000);

        let sample = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock)).unwrap();
        assert_eq!(sample.server_index, 2);
        assert_eq!(server.queried(), ["a.example", "b.example", "c.example"]);
    }

    #[test]
    fn test_silent_server_times_out_then_next_answers() {
        let clock = MockClock::power_on(START);
        let mut server =
            MockNtpServer::new(clock.clone()).with_server("slow.example", ServerBehavior::Silent);
        let config = config(&["slow.example", "ok.example"], 50);

        let sample = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock)).unwrap();
        assert_eq!(sample.server_index, 1);
    }

    #[test]
    fn test_all_servers_failing_leaves_clock_untouched() {
        let clock = MockClock::power_on(START);
        let mut server = MockNtpServer::new(clock.clone())
            .with_server("a.example", ServerBehavior::Unresolvable)
            .with_server("b.example", ServerBehavior::Silent);
        let config = config(&["a.example", "b.example"], 50);

        let result = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock));
        assert_eq!(result, Err(SyncError::AllServersFailed));
        assert_eq!(clock.error_us(), None);
    }

    #[test]
    fn test_link_down() {
        let clock = MockClock::power_on(START);
        let mut server = MockNtpServer::new(clock.clone()).link_down();
        let config = config(&["a.example"], 50);
        let result = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock));
        assert_eq!(result, Err(SyncError::Network(TransportError::LinkDown)));
    }

    #[test]
    fn test_measures_existing_error() {
        let mut clock = MockClock::power_on(START);
        // Device clock 1.5 s behind true time.
        clock.set(START.offset_by(-1_500_000));
        let mut server = MockNtpServer::new(clock.clone());
        let config = config(&["a.example"], 1_000);

        let sample = block_on(TimeSyncClient::new(&config).sync(&mut server, &clock)).unwrap();
        assert_eq!(sample.offset_us, 1_500_000);
        assert_eq!(sample.pre_sync_local, Some(START.offset_by(-1_500_000)));
    }
}
