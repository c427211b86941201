use crate::events::{ClusterEvent, EventBusPublisher};
use crate::membership::{PeerId, PeerRegistry};
use crate::stop_signal;
use crate::wire::ProtoHeartbeat;
use prost::Message;
use rand::Rng;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};

/// Heartbeat datagrams fit comfortably in one ethernet frame.
const MAX_DATAGRAM_BYTES: usize = 1500;

/// The discovery channel's sockets: where announcements go out and where peer
/// announcements come in.
pub(crate) struct HeartbeatTransport {
    send_socket: UdpSocket,
    recv_socket: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl HeartbeatTransport {
    /// Announce to and listen on a well-known multicast group.
    pub async fn multicast(group: SocketAddrV4) -> io::Result<Self> {
        let recv_socket =
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()))).await?;
        recv_socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;

        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        send_socket.set_multicast_loop_v4(true)?;

        Ok(HeartbeatTransport {
            send_socket,
            recv_socket,
            targets: vec![SocketAddr::V4(group)],
        })
    }

    /// Announce directly to a fixed set of listener addresses. Same protocol
    /// and staleness handling as multicast, for networks where multicast is
    /// unavailable.
    pub async fn unicast(bind: SocketAddr, targets: Vec<SocketAddr>) -> io::Result<Self> {
        let recv_socket = UdpSocket::bind(bind).await?;
        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;

        Ok(HeartbeatTransport {
            send_socket,
            recv_socket,
            targets,
        })
    }

    /// The address peers should announce to, for this node's listener.
    #[cfg(test)]
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.recv_socket.local_addr()
    }
}

/// Periodically announces local presence, ingests peer announcements into the
/// registry, and evicts peers that have gone quiet.
pub(crate) struct HeartbeatService {
    _stoppers: Vec<stop_signal::Stopper>,
}

impl HeartbeatService {
    pub fn spawn(
        logger: slog::Logger,
        transport: HeartbeatTransport,
        local_peer_id: PeerId,
        local_rpc_addr: SocketAddr,
        registry: Arc<PeerRegistry>,
        events: EventBusPublisher,
        heartbeat_interval: Duration,
        staleness_timeout: Duration,
    ) -> Self {
        let HeartbeatTransport {
            send_socket,
            recv_socket,
            targets,
        } = transport;

        let mut stoppers = Vec::with_capacity(3);

        let (stopper, stop_check) = stop_signal::new();
        tokio::task::spawn(sender_task(
            logger.new(slog::o!("task" => "heartbeat-sender")),
            send_socket,
            targets,
            local_peer_id.clone(),
            local_rpc_addr,
            heartbeat_interval,
            stop_check,
        ));
        stoppers.push(stopper);

        let (stopper, stop_check) = stop_signal::new();
        tokio::task::spawn(listener_task(
            logger.new(slog::o!("task" => "heartbeat-listener")),
            recv_socket,
            local_peer_id,
            registry.clone(),
            events.clone(),
            heartbeat_interval,
            stop_check,
        ));
        stoppers.push(stopper);

        let (stopper, stop_check) = stop_signal::new();
        tokio::task::spawn(sweeper_task(
            logger.new(slog::o!("task" => "stale-peer-sweeper")),
            registry,
            events,
            heartbeat_interval,
            staleness_timeout,
            stop_check,
        ));
        stoppers.push(stopper);

        HeartbeatService { _stoppers: stoppers }
    }
}

async fn sender_task(
    logger: slog::Logger,
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    local_peer_id: PeerId,
    local_rpc_addr: SocketAddr,
    heartbeat_interval: Duration,
    stop_check: stop_signal::StopCheck,
) {
    // Stagger the first announcement so simultaneously started nodes don't
    // burst onto the discovery channel in lockstep.
    let jitter = rand::thread_rng().gen_range(Duration::from_millis(0)..heartbeat_interval);
    time::sleep(jitter).await;

    let mut interval = time::interval(heartbeat_interval);
    loop {
        interval.tick().await;
        if stop_check.should_stop() {
            return;
        }

        let announcement = ProtoHeartbeat {
            peer_id: local_peer_id.as_str().to_string(),
            address: local_rpc_addr.to_string(),
            sent_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        let mut datagram = Vec::with_capacity(announcement.encoded_len());
        if announcement.encode(&mut datagram).is_err() {
            continue;
        }

        for target in &targets {
            if let Err(e) = socket.send_to(&datagram, target).await {
                slog::warn!(logger, "Failed to send heartbeat to {}: {}", target, e);
            }
        }
    }
}

async fn listener_task(
    logger: slog::Logger,
    socket: UdpSocket,
    local_peer_id: PeerId,
    registry: Arc<PeerRegistry>,
    events: EventBusPublisher,
    heartbeat_interval: Duration,
    stop_check: stop_signal::StopCheck,
) {
    let mut buf = [0u8; MAX_DATAGRAM_BYTES];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = time::sleep(heartbeat_interval) => {
                if stop_check.should_stop() {
                    return;
                }
                continue;
            }
        };
        if stop_check.should_stop() {
            return;
        }

        let (len, from) = match received {
            Ok(ok) => ok,
            Err(e) => {
                slog::warn!(logger, "Heartbeat receive failure: {}", e);
                // Avoid a hot error loop if the socket is in a bad state.
                time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let announcement = match ProtoHeartbeat::decode(&buf[..len]) {
            Ok(hb) => hb,
            Err(e) => {
                slog::warn!(logger, "Malformed heartbeat from {}: {}", from, e);
                continue;
            }
        };

        if announcement.peer_id == local_peer_id.as_str() {
            continue;
        }

        let address: SocketAddr = match announcement.address.parse() {
            Ok(addr) => addr,
            Err(_) => {
                slog::warn!(
                    logger,
                    "Heartbeat from {} carries unparseable address '{}'",
                    from,
                    announcement.address
                );
                continue;
            }
        };

        let peer_id = PeerId::new(announcement.peer_id);
        let is_new = registry.upsert(peer_id.clone(), address, Instant::now());
        if is_new {
            slog::info!(logger, "Discovered peer {} at {}", peer_id, address);
            let peer = registry
                .list()
                .into_iter()
                .find(|p| p.id == peer_id);
            if let Some(peer) = peer {
                events.broadcast(ClusterEvent::PeerJoined(peer));
            }
        }
    }
}

async fn sweeper_task(
    logger: slog::Logger,
    registry: Arc<PeerRegistry>,
    events: EventBusPublisher,
    heartbeat_interval: Duration,
    staleness_timeout: Duration,
    stop_check: stop_signal::StopCheck,
) {
    let mut interval = time::interval(heartbeat_interval);
    loop {
        interval.tick().await;
        if stop_check.should_stop() {
            return;
        }

        for peer in registry.evict_stale(Instant::now(), staleness_timeout) {
            slog::info!(
                logger,
                "Peer {} went quiet for more than {:?}, evicting",
                peer.id,
                staleness_timeout
            );
            events.broadcast(ClusterEvent::PeerLeft(peer));
        }
    }
}
