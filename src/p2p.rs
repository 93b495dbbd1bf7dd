use crate::identity::IdentityKeypair;
use crate::nat::{self, punch, HolePunchConfig, HolePunchStrategy, StunClient};
use crate::packet::Endpoint;
use crate::relay::RelayClient;
use crate::rendezvous::{ClientMessage, RendezvousClient, ServerMessage};
use crate::types::{
    print, ConnectionType, MachineId, NatType, NetError, PeerConnection, PrintSender,
    PublicEndpoint,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub rendezvous_url: Option<String>,
    pub stun_servers: Vec<SocketAddr>,
    pub enable_nat_traversal: bool,
    pub punch: HolePunchConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            rendezvous_url: None,
            stun_servers: Vec::new(),
            enable_nat_traversal: true,
            punch: HolePunchConfig::default(),
        }
    }
}

struct ConnectionEntry {
    connection: PeerConnection,
    /// the punched/direct socket, waiting to be handed to the mesh
    socket: Option<UdpSocket>,
    relay: Option<Arc<RelayClient>>,
    last_used: Instant,
}

/// Binds rendezvous, STUN, hole punching and the relay fallback into one
/// start/connect/stop surface. Established connections are cached per peer;
/// the winning socket is handed off to the mesh layer with `take_socket`.
pub struct P2pSessionManager {
    keypair: Arc<IdentityKeypair>,
    config: P2pConfig,
    connections: Arc<DashMap<MachineId, ConnectionEntry>>,
    public_endpoint: Mutex<Option<PublicEndpoint>>,
    rendezvous: Mutex<Option<Arc<RendezvousClient>>>,
    signaling: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    print_tx: PrintSender,
}

impl P2pSessionManager {
    pub fn new(keypair: Arc<IdentityKeypair>, config: P2pConfig, print_tx: PrintSender) -> Self {
        P2pSessionManager {
            keypair,
            config,
            connections: Arc::new(DashMap::new()),
            public_endpoint: Mutex::new(None),
            rendezvous: Mutex::new(None),
            signaling: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            print_tx,
        }
    }

    /// Discover our reflexive endpoint and NAT class, register with the
    /// rendezvous when configured, and start the stale-connection sweep.
    pub async fn start(&self) -> Result<PublicEndpoint, NetError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let classification = StunClient::default()
            .classify(&socket, &self.config.stun_servers)
            .await;
        let public = match classification.reflexive {
            Some(endpoint) => PublicEndpoint {
                addr: endpoint.addr,
                port: endpoint.port,
                nat_type: classification.nat_type,
            },
            None => {
                // no STUN answers: fall back to the local binding
                let local = socket
                    .local_addr()
                    .map_err(|e| NetError::BindFailed(e.to_string()))?;
                let addr = match local {
                    SocketAddr::V4(v4) => *v4.ip(),
                    _ => std::net::Ipv4Addr::UNSPECIFIED,
                };
                PublicEndpoint {
                    addr,
                    port: local.port(),
                    nat_type: NatType::Unknown,
                }
            }
        };
        *self.public_endpoint.lock().expect("endpoint lock poisoned") = Some(public.clone());

        if let Some(url) = &self.config.rendezvous_url {
            let client = Arc::new(RendezvousClient::connect(url, self.print_tx.clone()).await?);
            client.send(ClientMessage::register(
                self.keypair.peer_id(),
                hex::encode(self.keypair.public_key()),
            ))?;
            *self.signaling.lock().await = Some(client.take_messages()?);
            *self.rendezvous.lock().expect("rendezvous lock poisoned") = Some(client);
        }

        let sweep_connections = self.connections.clone();
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STALE_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sweep_connections.retain(|_, entry| entry.last_used.elapsed() < STALE_AFTER);
            }
        });
        self.tasks.lock().expect("task lock poisoned").push(sweep);

        Ok(public)
    }

    pub fn public_endpoint(&self) -> Option<PublicEndpoint> {
        self.public_endpoint
            .lock()
            .expect("endpoint lock poisoned")
            .clone()
    }

    /// Establish (or return the cached) connection to a peer. A provided
    /// `direct_endpoint` takes the direct fast path; otherwise the
    /// rendezvous negotiates strategy, and a failed punch falls back to the
    /// relay when allowed.
    pub async fn connect_to_peer(
        &self,
        peer_id: &MachineId,
        direct_endpoint: Option<Endpoint>,
    ) -> Result<PeerConnection, NetError> {
        if let Some(mut entry) = self.connections.get_mut(peer_id) {
            entry.last_used = Instant::now();
            return Ok(entry.connection.clone());
        }

        if let Some(endpoint) = direct_endpoint {
            return self.connect_direct(peer_id, endpoint).await;
        }
        if !self.config.enable_nat_traversal {
            return Err(NetError::InvalidConfiguration(
                "nat traversal disabled and no direct endpoint given".into(),
            ));
        }
        if self.rendezvous.lock().expect("rendezvous lock poisoned").is_none() {
            return Err(NetError::InvalidConfiguration(
                "no rendezvous configured for nat traversal".into(),
            ));
        }
        self.connect_via_rendezvous(peer_id).await
    }

    /// Both sides probe the known endpoint; the first echo settles it.
    async fn connect_direct(
        &self,
        peer_id: &MachineId,
        endpoint: Endpoint,
    ) -> Result<PeerConnection, NetError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let outcome = punch(
            &socket,
            endpoint,
            HolePunchStrategy::Simultaneous,
            self.config.punch,
        )
        .await
        .map_err(|e| match e {
            NetError::Timeout => NetError::PeerUnreachable,
            other => other,
        })?;

        let connection = PeerConnection {
            peer_id: peer_id.clone(),
            endpoint: outcome.endpoint,
            connection_type: ConnectionType::Direct,
            rtt: outcome.rtt,
            nat_type: self
                .public_endpoint()
                .map(|p| p.nat_type)
                .unwrap_or(NatType::Unknown),
        };
        self.connections.insert(
            peer_id.clone(),
            ConnectionEntry {
                connection: connection.clone(),
                socket: Some(socket),
                relay: None,
                last_used: Instant::now(),
            },
        );
        Ok(connection)
    }

    async fn connect_via_rendezvous(
        &self,
        peer_id: &MachineId,
    ) -> Result<PeerConnection, NetError> {
        // one signaling conversation at a time; concurrent connects queue here
        let mut signaling_guard = self.signaling.lock().await;
        let signaling = signaling_guard.as_mut().ok_or(NetError::NotConnected)?;
        let client = self
            .rendezvous
            .lock()
            .expect("rendezvous lock poisoned")
            .clone()
            .ok_or(NetError::NotConnected)?;

        // fresh socket per attempt: its NAT mapping is what we report
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let classification = StunClient::default()
            .classify(&socket, &self.config.stun_servers)
            .await;
        let our_endpoint = match classification.reflexive {
            Some(endpoint) => endpoint,
            None => {
                let local = socket
                    .local_addr()
                    .map_err(|e| NetError::BindFailed(e.to_string()))?;
                let mut endpoint: Endpoint = local
                    .to_string()
                    .parse()
                    .map_err(|_| NetError::InvalidEndpoint(local.to_string()))?;
                // an unspecified bind is only reachable as loopback
                if endpoint.addr.is_unspecified() {
                    endpoint.addr = std::net::Ipv4Addr::LOCALHOST;
                }
                endpoint
            }
        };
        client.send(ClientMessage::report_endpoint(
            our_endpoint.to_string(),
            classification.nat_type,
        ))?;
        client.send(ClientMessage::request_connection(peer_id.clone()))?;

        let mut peer_endpoint: Option<Endpoint> = None;
        let mut peer_nat = NatType::Unknown;
        let mut strategy: Option<HolePunchStrategy> = None;
        let deadline = Instant::now() + SIGNALING_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetError::Timeout);
            }
            let message = tokio::time::timeout(remaining, signaling.recv())
                .await
                .map_err(|_| NetError::Timeout)?
                .ok_or(NetError::NotConnected)?;
            match message {
                ServerMessage::PeerEndpoint {
                    peer_id: subject,
                    endpoint,
                    nat_type,
                } if &subject == peer_id => {
                    peer_endpoint = Some(endpoint.parse()?);
                    peer_nat = nat_type;
                }
                ServerMessage::HolePunchStrategy {
                    peer_id: subject,
                    strategy: assigned,
                } if &subject == peer_id => {
                    strategy = Some(assigned);
                    if assigned == HolePunchStrategy::Relay {
                        client.send(ClientMessage::request_relay(peer_id.clone()))?;
                    }
                }
                ServerMessage::HolePunchNow { peer_id: subject }
                | ServerMessage::HolePunchInitiate { peer_id: subject }
                | ServerMessage::HolePunchWait { peer_id: subject }
                | ServerMessage::HolePunchContinue { peer_id: subject }
                    if &subject == peer_id =>
                {
                    let endpoint = peer_endpoint.ok_or_else(|| {
                        NetError::InvalidConfiguration("punch signal before peer endpoint".into())
                    })?;
                    let assigned = strategy
                        .unwrap_or_else(|| nat::strategy_for(classification.nat_type, peer_nat));
                    client.send(ClientMessage::hole_punch_sent(peer_id.clone()))?;
                    match punch(&socket, endpoint, assigned, self.config.punch).await {
                        Ok(outcome) => {
                            client.send(ClientMessage::hole_punch_result(
                                peer_id.clone(),
                                true,
                                Some(outcome.endpoint.to_string()),
                            ))?;
                            let connection = PeerConnection {
                                peer_id: peer_id.clone(),
                                endpoint: outcome.endpoint,
                                connection_type: ConnectionType::HolePunched,
                                rtt: outcome.rtt,
                                nat_type: classification.nat_type,
                            };
                            self.connections.insert(
                                peer_id.clone(),
                                ConnectionEntry {
                                    connection: connection.clone(),
                                    socket: Some(socket),
                                    relay: None,
                                    last_used: Instant::now(),
                                },
                            );
                            return Ok(connection);
                        }
                        Err(e) => {
                            client.send(ClientMessage::hole_punch_result(
                                peer_id.clone(),
                                false,
                                None,
                            ))?;
                            if self.config.punch.fallback_to_relay {
                                client.send(ClientMessage::request_relay(peer_id.clone()))?;
                                // stay in the loop for relayAssigned
                            } else {
                                return Err(e);
                            }
                        }
                    }
                }
                ServerMessage::RelayAssigned {
                    peer_id: subject,
                    relay,
                    token,
                } if &subject == peer_id => {
                    let relay_endpoint: Endpoint = relay.parse()?;
                    let relay_client =
                        Arc::new(RelayClient::new(Arc::new(socket), relay_endpoint, token));
                    let connection = PeerConnection {
                        peer_id: peer_id.clone(),
                        endpoint: relay_endpoint,
                        connection_type: ConnectionType::Relayed { relay: relay_endpoint },
                        // the relay path has no probe echo; signaling latency
                        // stands in until real traffic measures better
                        rtt: Duration::ZERO,
                        nat_type: classification.nat_type,
                    };
                    self.connections.insert(
                        peer_id.clone(),
                        ConnectionEntry {
                            connection: connection.clone(),
                            socket: None,
                            relay: Some(relay_client),
                            last_used: Instant::now(),
                        },
                    );
                    return Ok(connection);
                }
                ServerMessage::Error { message } => {
                    return Err(NetError::Transport(format!("rendezvous: {message}")));
                }
                other => {
                    print(
                        &self.print_tx,
                        1,
                        format!("p2p: ignoring signaling message {other:?}"),
                    )
                    .await;
                }
            }
        }
    }

    pub fn get_connection(&self, peer_id: &MachineId) -> Option<PeerConnection> {
        self.connections.get_mut(peer_id).map(|mut entry| {
            entry.last_used = Instant::now();
            entry.connection.clone()
        })
    }

    /// Hand the established socket to the transport layer (one taker).
    pub fn take_socket(&self, peer_id: &MachineId) -> Option<UdpSocket> {
        self.connections
            .get_mut(peer_id)
            .and_then(|mut entry| entry.socket.take())
    }

    pub fn relay_client(&self, peer_id: &MachineId) -> Option<Arc<RelayClient>> {
        self.connections
            .get(peer_id)
            .and_then(|entry| entry.relay.clone())
    }

    pub fn disconnect(&self, peer_id: &MachineId) {
        self.connections.remove(peer_id);
    }

    /// Cancels the sweep, closes signaling, and drops every per-peer
    /// connection in one motion.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        if let Some(client) = self
            .rendezvous
            .lock()
            .expect("rendezvous lock poisoned")
            .take()
        {
            client.close();
        }
        self.connections.clear();
    }
}

impl Drop for P2pSessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite};

    fn print_channel() -> PrintSender {
        let (tx, _rx) = mpsc::channel(64);
        tx
    }

    fn manager(config: P2pConfig) -> P2pSessionManager {
        P2pSessionManager::new(
            Arc::new(IdentityKeypair::generate().unwrap()),
            config,
            print_channel(),
        )
    }

    #[test]
    fn method_precedence() {
        let relayed = ConnectionType::Relayed { relay: "1.2.3.4:1".parse().unwrap() };
        assert!(ConnectionType::Direct.precedence() < ConnectionType::HolePunched.precedence());
        assert!(ConnectionType::HolePunched.precedence() < relayed.precedence());
        assert!(relayed.is_relayed());
        assert!(!ConnectionType::Direct.is_relayed());
    }

    #[tokio::test]
    async fn start_without_stun_reports_unknown() {
        let m = manager(P2pConfig::default());
        let public = m.start().await.unwrap();
        assert_eq!(public.nat_type, NatType::Unknown);
        assert_ne!(public.port, 0);
        m.stop();
    }

    #[tokio::test]
    async fn traversal_without_rendezvous_is_a_config_error() {
        let m = manager(P2pConfig::default());
        m.start().await.unwrap();
        let result = m.connect_to_peer(&"peer-x".to_string(), None).await;
        assert!(matches!(result, Err(NetError::InvalidConfiguration(_))));

        let m = manager(P2pConfig {
            enable_nat_traversal: false,
            ..Default::default()
        });
        let result = m.connect_to_peer(&"peer-x".to_string(), None).await;
        assert!(matches!(result, Err(NetError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn direct_fast_path_between_two_managers() {
        let fast_punch = HolePunchConfig {
            deadline: Duration::from_secs(2),
            ..Default::default()
        };
        let m1 = manager(P2pConfig { punch: fast_punch, ..Default::default() });
        let m2 = manager(P2pConfig { punch: fast_punch, ..Default::default() });

        // stage both sockets first so each side knows where to aim
        let s1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let s2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let e1: Endpoint = s1.local_addr().unwrap().to_string().parse().unwrap();
        let e2: Endpoint = s2.local_addr().unwrap().to_string().parse().unwrap();
        drop(s1);
        drop(s2);
        // rebinding the same ports keeps the loopback rendezvous honest
        let peer = "peer-1".to_string();
        let (r1, r2) = tokio::join!(
            async {
                let socket = UdpSocket::bind(e1.to_socket_addr()).await.unwrap();
                let outcome = punch(
                    &socket,
                    e2,
                    HolePunchStrategy::Simultaneous,
                    fast_punch,
                )
                .await;
                (socket, outcome)
            },
            m2.connect_to_peer(&peer, Some(e1)),
        );
        let _ = r1;
        let connection = r2.unwrap();
        assert_eq!(connection.connection_type, ConnectionType::Direct);
        assert_eq!(connection.peer_id, "peer-1");
        // cached on repeat, and the socket is claimable exactly once
        let again = m2.connect_to_peer(&"peer-1".to_string(), Some(e1)).await.unwrap();
        assert_eq!(again.connection_type, ConnectionType::Direct);
        assert!(m2.take_socket(&"peer-1".to_string()).is_some());
        assert!(m2.take_socket(&"peer-1".to_string()).is_none());
        m2.disconnect(&"peer-1".to_string());
        assert!(m2.get_connection(&"peer-1".to_string()).is_none());
        m1.stop();
        m2.stop();
    }

    /// The whole stack in one piece: a direct P2P connection whose socket is
    /// handed to the mesh, a noise link on top, a tunnel session on top of
    /// that, and a guest packet round-tripped through the remote exit.
    #[tokio::test]
    async fn full_stack_direct_tunnel() {
        use crate::mesh::UdpMesh;
        use crate::packet::ipv4::build_udp_packet;
        use crate::packet::Ipv4Packet;
        use crate::session::TunnelSession;

        let punch_config = HolePunchConfig {
            deadline: Duration::from_secs(2),
            ..Default::default()
        };

        // consumer side holds a fixed socket the provider can aim at
        let consumer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let consumer_endpoint: Endpoint =
            consumer_socket.local_addr().unwrap().to_string().parse().unwrap();

        let provider = manager(P2pConfig { punch: punch_config, ..Default::default() });
        let stale = "127.0.0.1:1".parse().unwrap();
        let consumer_peer = "consumer".to_string();
        let (provider_conn, consumer_punch) = tokio::join!(
            provider.connect_to_peer(&consumer_peer, Some(consumer_endpoint)),
            punch(&consumer_socket, stale, HolePunchStrategy::PeerInitiates, punch_config),
        );
        let provider_conn = provider_conn.unwrap();
        assert_eq!(provider_conn.connection_type, ConnectionType::Direct);
        let provider_socket = provider.take_socket(&"consumer".to_string()).unwrap();
        let provider_observed = consumer_punch.unwrap().endpoint;

        // identity-authenticated mesh link over the punched pair
        let kp_provider = Arc::new(IdentityKeypair::generate().unwrap());
        let kp_consumer = Arc::new(IdentityKeypair::generate().unwrap());
        let mesh_provider = UdpMesh::new(kp_provider.clone(), print_channel());
        let mesh_consumer = UdpMesh::new(kp_consumer.clone(), print_channel());
        let (provider_link, consumer_link) = tokio::join!(
            mesh_provider.connect_peer(provider_socket, consumer_endpoint, true),
            mesh_consumer.connect_peer(consumer_socket, provider_observed, false),
        );
        assert_eq!(provider_link.unwrap(), kp_consumer.peer_id());
        assert_eq!(consumer_link.unwrap(), kp_provider.peer_id());

        // tunnel session per side: provider is the traffic source, the
        // consumer terminates traffic in its exit netstack
        let source = TunnelSession::open(
            Arc::new(mesh_provider),
            kp_consumer.peer_id(),
            print_channel(),
        );
        let exit = TunnelSession::open(
            Arc::new(mesh_consumer),
            kp_provider.peer_id(),
            print_channel(),
        );
        exit.enable_traffic_routing(true).await.unwrap();
        source.enable_traffic_routing(false).await.unwrap();
        let mut returns = source.return_packets().unwrap();

        let request = build_udp_packet(
            "10.200.0.2:40000".parse().unwrap(),
            "203.0.113.50:51900".parse().unwrap(),
            b"workload",
        );
        source.inject_packet(request).await.unwrap();

        let reply = Ipv4Packet::parse(&tokio_stream::StreamExt::next(&mut returns).await.unwrap()).unwrap();
        assert_eq!(reply.udp_payload(), Some(&b"workload"[..]));
        assert_eq!(
            reply.source_endpoint().unwrap().to_string(),
            "203.0.113.50:51900"
        );
        source.leave().await;
        exit.leave().await;
        provider.stop();
    }

    /// Scripted rendezvous: two clients register, report endpoints, request
    /// each other; the server hands both the simultaneous strategy and the
    /// punch-now signal. Full-cone to full-cone on loopback.
    #[tokio::test]
    async fn hole_punch_via_scripted_rendezvous() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut sockets = Vec::new();
            let mut infos: Vec<(String, String)> = Vec::new(); // (peer_id, endpoint)
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut websocket = accept_async(stream).await.unwrap();
                let mut peer_id = String::new();
                let mut endpoint = String::new();
                // register, reportEndpoint, requestConnection
                for _ in 0..3 {
                    let Some(Ok(tungstenite::Message::Text(text))) = websocket.next().await else {
                        panic!("client hung up early");
                    };
                    match serde_json::from_str::<ClientMessage>(&text).unwrap() {
                        ClientMessage::Register { peer_id: id, .. } => peer_id = id,
                        ClientMessage::ReportEndpoint { endpoint: e, .. } => endpoint = e,
                        ClientMessage::RequestConnection { .. } => {}
                        other => panic!("unexpected {other:?}"),
                    }
                }
                infos.push((peer_id, endpoint));
                sockets.push(websocket);
            }
            // both sides in hand: deliver endpoint, strategy, go
            for (index, websocket) in sockets.iter_mut().enumerate() {
                let (other_id, other_endpoint) = infos[1 - index].clone();
                for reply in [
                    ServerMessage::PeerEndpoint {
                        peer_id: other_id.clone(),
                        endpoint: other_endpoint,
                        nat_type: NatType::FullCone,
                    },
                    ServerMessage::HolePunchStrategy {
                        peer_id: other_id.clone(),
                        strategy: HolePunchStrategy::Simultaneous,
                    },
                    ServerMessage::HolePunchNow { peer_id: other_id },
                ] {
                    let text = serde_json::to_string(&reply).unwrap();
                    websocket
                        .send(tungstenite::Message::Text(text))
                        .await
                        .unwrap();
                }
            }
            // drain result reports so the clients' writes don't error
            for websocket in sockets.iter_mut() {
                while let Ok(Some(_)) =
                    tokio::time::timeout(Duration::from_secs(2), websocket.next()).await
                {
                }
            }
        });

        let config = P2pConfig {
            rendezvous_url: Some(format!("ws://{addr}")),
            punch: HolePunchConfig {
                deadline: Duration::from_secs(3),
                ..Default::default()
            },
            ..Default::default()
        };
        let m1 = manager(config.clone());
        let m2 = manager(config);
        let id1 = m1.keypair.peer_id();
        let id2 = m2.keypair.peer_id();
        m1.start().await.unwrap();
        m2.start().await.unwrap();

        let (c1, c2) = tokio::join!(
            m1.connect_to_peer(&id2, None),
            m2.connect_to_peer(&id1, None),
        );
        let c1 = c1.unwrap();
        let c2 = c2.unwrap();
        assert_eq!(c1.connection_type, ConnectionType::HolePunched);
        assert_eq!(c2.connection_type, ConnectionType::HolePunched);
        assert!(c1.rtt <= Duration::from_secs(1));
        m1.stop();
        m2.stop();
    }

    /// Both sides symmetric: the server skips punching entirely and assigns
    /// a shared relay session.
    #[tokio::test]
    async fn symmetric_pair_falls_back_to_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for _ in 0..1 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut websocket = accept_async(stream).await.unwrap();
                let mut other = String::new();
                for _ in 0..3 {
                    let Some(Ok(tungstenite::Message::Text(text))) = websocket.next().await else {
                        panic!("client hung up early");
                    };
                    if let ClientMessage::RequestConnection { peer_id, .. } =
                        serde_json::from_str::<ClientMessage>(&text).unwrap()
                    {
                        other = peer_id;
                    }
                }
                let strategy = ServerMessage::HolePunchStrategy {
                    peer_id: other.clone(),
                    strategy: HolePunchStrategy::Relay,
                };
                websocket
                    .send(tungstenite::Message::Text(serde_json::to_string(&strategy).unwrap()))
                    .await
                    .unwrap();
                // client answers with requestRelay
                loop {
                    let Some(Ok(tungstenite::Message::Text(text))) = websocket.next().await else {
                        panic!("expected requestRelay");
                    };
                    if matches!(
                        serde_json::from_str::<ClientMessage>(&text).unwrap(),
                        ClientMessage::RequestRelay { .. }
                    ) {
                        break;
                    }
                }
                let assigned = ServerMessage::RelayAssigned {
                    peer_id: other,
                    relay: "203.0.113.40:3479".into(),
                    token: 0x5e55_10f1,
                };
                websocket
                    .send(tungstenite::Message::Text(serde_json::to_string(&assigned).unwrap()))
                    .await
                    .unwrap();
            }
        });

        let m = manager(P2pConfig {
            rendezvous_url: Some(format!("ws://{addr}")),
            ..Default::default()
        });
        m.start().await.unwrap();
        let connection = m.connect_to_peer(&"symmetric-peer".to_string(), None).await.unwrap();
        assert!(connection.connection_type.is_relayed());
        assert_eq!(
            connection.connection_type,
            ConnectionType::Relayed { relay: "203.0.113.40:3479".parse().unwrap() }
        );
        assert!(m.relay_client(&"symmetric-peer".to_string()).is_some());
        m.stop();
    }
}
