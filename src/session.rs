use crate::mesh::{ChannelHandler, MeshProvider};
use crate::netstack::{LoopbackNetstack, Netstack, NetstackBridge, NetstackConfig};
use crate::types::{print, MachineId, NetError, PrintSender};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const CHANNEL_DATA: &str = "tunnel-data";
pub const CHANNEL_TRAFFIC: &str = "tunnel-traffic";
pub const CHANNEL_RETURN: &str = "tunnel-return";

/// Exit-side netstack configuration.
const EXIT_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 200, 0, 1);
const EXIT_MTU: usize = 1500;

pub type TrafficForwardCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Connecting,
    Active,
    Disconnected,
}

/// Session roles as a tagged variant; `inject_packet` and friends dispatch
/// on the tag. The exit owns a netstack, the client owns a local netstack
/// for outbound dialing, the source only carries streams.
enum Role {
    Peer,
    TrafficSource {
        return_tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    TrafficExit {
        bridge: Arc<NetstackBridge>,
        forward_cb: Arc<Mutex<Option<TrafficForwardCallback>>>,
    },
    TrafficClient {
        bridge: Arc<NetstackBridge>,
    },
}

struct SessionShared {
    mesh: Arc<dyn MeshProvider>,
    remote: MachineId,
    state: Mutex<SessionState>,
    role: Mutex<Role>,
    data_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    data_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    return_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    spoofed: AtomicU64,
    print_tx: PrintSender,
}

impl SessionShared {
    fn is_active(&self) -> bool {
        *self.state.lock().expect("state lock poisoned") == SessionState::Active
    }
}

/// A per-job duplex tunnel to one remote machine, carried on exactly three
/// mesh channels: `tunnel-data` for application messages, `tunnel-traffic`
/// for raw IP packets flowing source -> exit, and `tunnel-return` for the
/// packets coming back.
pub struct TunnelSession {
    shared: Arc<SessionShared>,
}

/// Build a handler that drops anything not sent by `remote` and otherwise
/// feeds `deliver`. Holds only a weak session handle so a torn-down session
/// cannot be revived by late traffic.
fn validated_handler<F>(shared: &Arc<SessionShared>, deliver: F) -> ChannelHandler
where
    F: Fn(&SessionShared, Vec<u8>) + Send + Sync + 'static,
{
    let weak: Weak<SessionShared> = Arc::downgrade(shared);
    Arc::new(move |from: MachineId, bytes: Vec<u8>| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if !shared.is_active() {
            return;
        }
        if from != shared.remote {
            shared.spoofed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        deliver(&shared, bytes);
    })
}

impl TunnelSession {
    /// Open the session toward `remote`. The mesh link underneath must
    /// already exist; this registers the data channel and goes active.
    pub fn open(
        mesh: Arc<dyn MeshProvider>,
        remote: MachineId,
        print_tx: PrintSender,
    ) -> TunnelSession {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            mesh,
            remote,
            state: Mutex::new(SessionState::Connecting),
            role: Mutex::new(Role::Peer),
            data_tx: Mutex::new(Some(data_tx)),
            data_rx: Mutex::new(Some(data_rx)),
            return_rx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            spoofed: AtomicU64::new(0),
            print_tx,
        });

        let handler = validated_handler(&shared, |shared, bytes| {
            if let Some(tx) = shared.data_tx.lock().expect("data lock poisoned").as_ref() {
                let _ = tx.send(bytes);
            }
        });
        shared.mesh.on_channel(CHANNEL_DATA, handler);
        *shared.state.lock().expect("state lock poisoned") = SessionState::Active;

        TunnelSession { shared }
    }

    pub fn remote_machine(&self) -> &MachineId {
        &self.shared.remote
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    pub fn spoofed_drops(&self) -> u64 {
        self.shared.spoofed.load(Ordering::Relaxed)
    }

    /// Application bytes to the remote side. Only valid while active.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), NetError> {
        if !self.shared.is_active() {
            return Err(NetError::NotConnected);
        }
        self.shared
            .mesh
            .send_on_channel(&self.shared.remote, CHANNEL_DATA, bytes)
            .await
    }

    /// The inbound `tunnel-data` stream: lazy, ends at disconnect, and can
    /// be taken exactly once.
    pub fn receive(&self) -> Result<UnboundedReceiverStream<Vec<u8>>, NetError> {
        let rx = self
            .shared
            .data_rx
            .lock()
            .expect("data lock poisoned")
            .take()
            .ok_or(NetError::AlreadyConnected)?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Become the traffic exit (runs the netstack, default loopback) or the
    /// traffic source (collects return packets). One role change per
    /// session; a second call fails with `AlreadyConnected`.
    pub async fn enable_traffic_routing(&self, as_exit: bool) -> Result<(), NetError> {
        let stack: Arc<dyn Netstack> = Arc::new(LoopbackNetstack::new(NetstackConfig {
            gateway: EXIT_GATEWAY,
            mtu: EXIT_MTU,
        }));
        self.enable_traffic_routing_with(stack, as_exit).await
    }

    /// Same, with an injected netstack implementation.
    pub async fn enable_traffic_routing_with(
        &self,
        stack: Arc<dyn Netstack>,
        as_exit: bool,
    ) -> Result<(), NetError> {
        if !self.shared.is_active() {
            return Err(NetError::NotConnected);
        }
        {
            let role = self.shared.role.lock().expect("role lock poisoned");
            if !matches!(*role, Role::Peer) {
                return Err(NetError::AlreadyConnected);
            }
        }

        if as_exit {
            let bridge = Arc::new(NetstackBridge::new(stack, self.shared.print_tx.clone()));
            bridge.start().await?;

            // netstack emissions flow back on tunnel-return; the handler is
            // sync, so a pump task carries them onto the mesh
            let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            bridge.set_return_handler(Arc::new(move |packet| {
                let _ = emit_tx.send(packet);
            }));
            let mesh = self.shared.mesh.clone();
            let remote = self.shared.remote.clone();
            let print_tx = self.shared.print_tx.clone();
            let pump = tokio::spawn(async move {
                while let Some(packet) = emit_rx.recv().await {
                    if let Err(e) = mesh.send_on_channel(&remote, CHANNEL_RETURN, packet).await {
                        print(&print_tx, 1, format!("session: return send failed: {e}")).await;
                    }
                }
            });
            self.shared.tasks.lock().expect("task lock poisoned").push(pump);

            let forward_cb: Arc<Mutex<Option<TrafficForwardCallback>>> =
                Arc::new(Mutex::new(None));
            let handler_bridge = bridge.clone();
            let handler_cb = forward_cb.clone();
            let handler = validated_handler(&self.shared, move |_shared, bytes| {
                let cb = handler_cb.lock().expect("callback lock poisoned").clone();
                match cb {
                    Some(cb) => cb(bytes),
                    None => handler_bridge.inject(bytes),
                }
            });
            self.shared.mesh.on_channel(CHANNEL_TRAFFIC, handler);

            *self.shared.role.lock().expect("role lock poisoned") =
                Role::TrafficExit { bridge, forward_cb };
        } else {
            let (return_tx, return_rx) = mpsc::unbounded_channel();
            *self.shared.return_rx.lock().expect("return lock poisoned") = Some(return_rx);

            let handler_tx = return_tx.clone();
            let handler = validated_handler(&self.shared, move |_shared, bytes| {
                let _ = handler_tx.send(bytes);
            });
            self.shared.mesh.on_channel(CHANNEL_RETURN, handler);

            *self.shared.role.lock().expect("role lock poisoned") =
                Role::TrafficSource { return_tx };
        }
        Ok(())
    }

    /// Become the traffic client: a local netstack whose outbound packets
    /// ride `tunnel-traffic` toward the remote exit, with returns injected
    /// back into the local stack.
    pub async fn enable_dial_support(&self) -> Result<(), NetError> {
        self.enable_dial_support_with(Arc::new(LoopbackNetstack::new(NetstackConfig::default())))
            .await
    }

    pub async fn enable_dial_support_with(
        &self,
        stack: Arc<dyn Netstack>,
    ) -> Result<(), NetError> {
        if !self.shared.is_active() {
            return Err(NetError::NotConnected);
        }
        {
            let role = self.shared.role.lock().expect("role lock poisoned");
            if !matches!(*role, Role::Peer) {
                return Err(NetError::AlreadyConnected);
            }
        }

        let bridge = Arc::new(NetstackBridge::new(stack, self.shared.print_tx.clone()));
        bridge.start().await?;

        let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        bridge.set_return_handler(Arc::new(move |packet| {
            let _ = emit_tx.send(packet);
        }));
        let mesh = self.shared.mesh.clone();
        let remote = self.shared.remote.clone();
        let print_tx = self.shared.print_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(packet) = emit_rx.recv().await {
                if let Err(e) = mesh.send_on_channel(&remote, CHANNEL_TRAFFIC, packet).await {
                    print(&print_tx, 1, format!("session: outbound send failed: {e}")).await;
                }
            }
        });
        self.shared.tasks.lock().expect("task lock poisoned").push(pump);

        let handler_bridge = bridge.clone();
        let handler = validated_handler(&self.shared, move |_shared, bytes| {
            handler_bridge.inject(bytes);
        });
        self.shared.mesh.on_channel(CHANNEL_RETURN, handler);

        *self.shared.role.lock().expect("role lock poisoned") = Role::TrafficClient { bridge };
        Ok(())
    }

    /// Raw IP packet into the tunnel: a source sends it toward the exit, an
    /// exit pushes it into its stack. Any other role is a caller bug.
    pub async fn inject_packet(&self, packet: Vec<u8>) -> Result<(), NetError> {
        if !self.shared.is_active() {
            return Err(NetError::NotConnected);
        }
        enum Dispatch {
            SendTraffic,
            Inject(Arc<NetstackBridge>),
        }
        let dispatch = {
            let role = self.shared.role.lock().expect("role lock poisoned");
            match &*role {
                Role::TrafficSource { .. } => Dispatch::SendTraffic,
                Role::TrafficExit { bridge, .. } => Dispatch::Inject(bridge.clone()),
                _ => return Err(NetError::TrafficRoutingNotEnabled),
            }
        };
        match dispatch {
            Dispatch::SendTraffic => {
                self.shared
                    .mesh
                    .send_on_channel(&self.shared.remote, CHANNEL_TRAFFIC, packet)
                    .await
            }
            Dispatch::Inject(bridge) => {
                bridge.inject(packet);
                Ok(())
            }
        }
    }

    /// Exit side only: route arriving traffic packets to `cb` instead of the
    /// netstack. Used when the exit bridges a VM rather than the internet.
    pub fn set_traffic_forward_callback(
        &self,
        cb: TrafficForwardCallback,
    ) -> Result<(), NetError> {
        let role = self.shared.role.lock().expect("role lock poisoned");
        match &*role {
            Role::TrafficExit { forward_cb, .. } => {
                *forward_cb.lock().expect("callback lock poisoned") = Some(cb);
                Ok(())
            }
            _ => Err(NetError::TrafficRoutingNotEnabled),
        }
    }

    /// Exit side only: push a raw IP packet back toward the source.
    pub async fn send_return_packet(&self, packet: Vec<u8>) -> Result<(), NetError> {
        if !self.shared.is_active() {
            return Err(NetError::NotConnected);
        }
        {
            let role = self.shared.role.lock().expect("role lock poisoned");
            if !matches!(&*role, Role::TrafficExit { .. }) {
                return Err(NetError::TrafficRoutingNotEnabled);
            }
        }
        self.shared
            .mesh
            .send_on_channel(&self.shared.remote, CHANNEL_RETURN, packet)
            .await
    }

    /// Source side only: the stream of raw IP packets the exit sent back.
    /// Like `receive`, it can be taken exactly once.
    pub fn return_packets(&self) -> Result<UnboundedReceiverStream<Vec<u8>>, NetError> {
        {
            let role = self.shared.role.lock().expect("role lock poisoned");
            if !matches!(&*role, Role::TrafficSource { .. }) {
                return Err(NetError::TrafficRoutingNotEnabled);
            }
        }
        let rx = self
            .shared
            .return_rx
            .lock()
            .expect("return lock poisoned")
            .take()
            .ok_or(NetError::AlreadyConnected)?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Tear the session down: deregister every channel handler, stop the
    /// netstack, cancel owned tasks, finish the streams. Idempotent.
    pub async fn leave(&self) {
        {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }
        self.shared.mesh.off_channel(CHANNEL_DATA);
        self.shared.mesh.off_channel(CHANNEL_TRAFFIC);
        self.shared.mesh.off_channel(CHANNEL_RETURN);

        for task in self.shared.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        // closing the senders finishes receiver streams
        self.shared.data_tx.lock().expect("data lock poisoned").take();

        let bridge = {
            let mut role = self.shared.role.lock().expect("role lock poisoned");
            let bridge = match &*role {
                Role::TrafficExit { bridge, .. } => Some(bridge.clone()),
                Role::TrafficClient { bridge } => Some(bridge.clone()),
                _ => None,
            };
            *role = Role::Peer;
            bridge
        };
        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
    }

    /// Dial out through the client-role netstack.
    pub async fn dial_tcp(
        &self,
        host: Ipv4Addr,
        port: u16,
    ) -> Result<crate::netstack::TcpDial, NetError> {
        let bridge = {
            let role = self.shared.role.lock().expect("role lock poisoned");
            match &*role {
                Role::TrafficClient { bridge } => bridge.clone(),
                _ => return Err(NetError::TrafficRoutingNotEnabled),
            }
        };
        bridge.dial_tcp(host, port).await
    }
}
