use crate::packet::{ipv4::build_udp_packet, Endpoint, Ipv4Packet};
use crate::types::{print, NetError, PrintSender};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Packets the traffic queue will hold before dropping under overload.
pub const TRAFFIC_QUEUE_DEPTH: usize = 1024;

/// Invoked for every raw IP packet the stack emits back toward the tunnel.
pub type ReturnHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct NetstackConfig {
    pub gateway: Ipv4Addr,
    pub mtu: usize,
}

impl Default for NetstackConfig {
    fn default() -> Self {
        NetstackConfig {
            gateway: Ipv4Addr::new(10, 200, 0, 1),
            mtu: 1500,
        }
    }
}

/// An outbound TCP connection originated inside the stack, exposed to the
/// dial-support role as two byte pipes.
pub struct TcpDial {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// The contract with a userspace TCP/IP stack: raw IP packets in via
/// `inject_packet`, raw IP packets out via the return handler, plus a
/// `dial_tcp` escape hatch for connections that originate inside the stack.
/// Which stack backs this is the embedder's choice; the core only moves
/// bytes across this seam.
#[async_trait]
pub trait Netstack: Send + Sync {
    async fn start(&self) -> Result<(), NetError>;
    async fn stop(&self);
    /// Best effort: may drop on backpressure with a logged warning.
    async fn inject_packet(&self, ip: Vec<u8>) -> Result<(), NetError>;
    fn set_return_handler(&self, handler: ReturnHandler);
    async fn dial_tcp(&self, host: Ipv4Addr, port: u16) -> Result<TcpDial, NetError>;
}

/// Wraps a `Netstack` with the bounded ingest queue the traffic channel
/// needs: the tunnel side enqueues without suspending, a pump task feeds the
/// stack, and overload drops packets with a counter instead of growing the
/// queue without bound.
pub struct NetstackBridge {
    stack: Arc<dyn Netstack>,
    traffic_tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetstackBridge {
    pub fn new(stack: Arc<dyn Netstack>, print_tx: PrintSender) -> Self {
        let (traffic_tx, mut traffic_rx) = mpsc::channel::<Vec<u8>>(TRAFFIC_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicU64::new(0));
        let pump_stack = stack.clone();
        let pump = tokio::spawn(async move {
            while let Some(ip) = traffic_rx.recv().await {
                if let Err(e) = pump_stack.inject_packet(ip).await {
                    print(&print_tx, 1, format!("netstack: inject failed: {e}")).await;
                }
            }
        });
        NetstackBridge {
            stack,
            traffic_tx,
            dropped,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub async fn start(&self) -> Result<(), NetError> {
        self.stack.start().await
    }

    pub async fn stop(&self) {
        if let Some(pump) = self.pump.lock().expect("pump lock poisoned").take() {
            pump.abort();
        }
        self.stack.stop().await;
    }

    /// Non-suspending enqueue from the packet path.
    pub fn inject(&self, ip: Vec<u8>) {
        if self.traffic_tx.try_send(ip).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_return_handler(&self, handler: ReturnHandler) {
        self.stack.set_return_handler(handler);
    }

    pub async fn dial_tcp(&self, host: Ipv4Addr, port: u16) -> Result<TcpDial, NetError> {
        self.stack.dial_tcp(host, port).await
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// In-process stand-in stack: echoes UDP payloads back through the return
/// path (src/dst and ports swapped) and dials TCP through the host network.
/// Tests and single-host deployments run on this; production exits swap in a
/// full userspace TCP/IP stack behind the same trait.
pub struct LoopbackNetstack {
    config: NetstackConfig,
    started: AtomicBool,
    return_handler: Mutex<Option<ReturnHandler>>,
}

impl LoopbackNetstack {
    pub fn new(config: NetstackConfig) -> Self {
        LoopbackNetstack {
            config,
            started: AtomicBool::new(false),
            return_handler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> NetstackConfig {
        self.config
    }

    fn emit_return(&self, packet: Vec<u8>) {
        let handler = self.return_handler.lock().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            handler(packet);
        }
    }
}

#[async_trait]
impl Netstack for LoopbackNetstack {
    async fn start(&self) -> Result<(), NetError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn inject_packet(&self, ip: Vec<u8>) -> Result<(), NetError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(NetError::Netstack("stack not started".into()));
        }
        if ip.len() > self.config.mtu + 20 {
            return Err(NetError::Netstack("packet exceeds mtu".into()));
        }
        let Some(packet) = Ipv4Packet::parse(&ip) else {
            // malformed injections are counted by the caller, never fatal
            return Ok(());
        };
        if let (Some(source), Some(destination), Some(payload)) = (
            packet.source_endpoint(),
            packet.destination_endpoint(),
            packet.udp_payload(),
        ) {
            let reply = build_udp_packet(destination, source, payload);
            self.emit_return(reply);
        }
        Ok(())
    }

    fn set_return_handler(&self, handler: ReturnHandler) {
        *self.return_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    async fn dial_tcp(&self, host: Ipv4Addr, port: u16) -> Result<TcpDial, NetError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(NetError::Netstack("stack not started".into()));
        }
        let endpoint = Endpoint::new(host, port);
        let stream = tokio::net::TcpStream::connect(endpoint.to_socket_addr())
            .await
            .map_err(|e| NetError::Netstack(format!("dial {endpoint}: {e}")))?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(TcpDial {
            tx: outbound_tx,
            rx: inbound_rx,
        })
    }
}
