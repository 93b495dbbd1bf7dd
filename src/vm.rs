use crate::bridge::FramePacketBridge;
use crate::filter::{
    ConntrackStrategy, Decision, EndpointAllowlist, FilterStrategy, FullFilterStrategy,
    SampledStrategy,
};
use crate::packet::{Ipv4Packet, MacAddr};
use crate::session::TunnelSession;
use crate::types::{
    print, ExecutionResult, FailureReason, NetError, NetworkMode, PrintSender, VmNetworkConfig,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

/// Frames buffered per direction before the NIC queues push back.
const NIC_QUEUE_DEPTH: usize = 1024;
const DEFAULT_SAMPLING_RATE: f64 = 0.1;

/// The hypervisor-facing side of an attachment: it pushes guest egress
/// frames in and drains frames destined for the guest. Everything else
/// (extraction, filtering, tunnel wiring) happens behind these two queues.
pub struct VirtualNic {
    pub guest_tx: mpsc::Sender<Vec<u8>>,
    pub guest_rx: mpsc::Receiver<Vec<u8>>,
    pub gateway_mac: MacAddr,
}

/// Emitted on the handle's event stream when a strategy decides the guest
/// must die. The owner shuts the VM down and releases the session.
#[derive(Clone, Debug)]
pub enum VmNetworkEvent {
    Terminated { reason: String },
}

pub struct VmNetworkHandle {
    pub nic: VirtualNic,
    pub strategy: Option<Arc<dyn FilterStrategy>>,
    pub allowlist: Option<EndpointAllowlist>,
    pub events: mpsc::UnboundedReceiver<VmNetworkEvent>,
    processor: Option<tokio::task::JoinHandle<()>>,
}

impl VmNetworkHandle {
    /// Release the attachment: the processor task dies, the NIC queues
    /// close, and any sockets held through the session are the session's
    /// problem, not ours.
    pub fn cleanup(&mut self) {
        if let Some(processor) = self.processor.take() {
            processor.abort();
        }
    }
}

impl Drop for VmNetworkHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// What the scheduler reports when a strategy terminated the workload.
pub fn security_violation_result(job_id: &str) -> ExecutionResult {
    ExecutionResult::Failure {
        job_id: job_id.to_string(),
        reason: FailureReason::TunnelSecurityViolation,
    }
}

/// Attaches isolated NICs to VMs, optionally in a filtered mode that routes
/// every guest packet through an inspection strategy before it reaches the
/// tunnel session.
pub struct VmNetworkManager {
    print_tx: PrintSender,
}

impl VmNetworkManager {
    pub fn new(print_tx: PrintSender) -> Self {
        VmNetworkManager { print_tx }
    }

    /// Build the NIC for one VM. Filtering modes need the consumer's tunnel
    /// endpoint (it seeds the allowlist) and a fresh session, which this
    /// call flips into the traffic-source role. Direct mode attaches no
    /// inspection at all: the hypervisor's own NAT carries the traffic.
    pub async fn create_network(
        &self,
        config: &VmNetworkConfig,
        session: Arc<TunnelSession>,
    ) -> Result<VmNetworkHandle, NetError> {
        let (guest_tx, host_rx) = mpsc::channel::<Vec<u8>>(NIC_QUEUE_DEPTH);
        let (host_tx, guest_rx) = mpsc::channel::<Vec<u8>>(NIC_QUEUE_DEPTH);
        let (event_tx, events) = mpsc::unbounded_channel();
        let bridge = FramePacketBridge::new();
        let nic = VirtualNic {
            guest_tx,
            guest_rx,
            gateway_mac: bridge.gateway_mac(),
        };

        if config.mode == NetworkMode::Direct {
            return Ok(VmNetworkHandle {
                nic,
                strategy: None,
                allowlist: None,
                events,
                processor: None,
            });
        }

        let Some(consumer_endpoint) = config.consumer_endpoint else {
            return Err(NetError::FilteringRequiresEndpoint);
        };
        let allowlist = EndpointAllowlist::new();
        allowlist.add(consumer_endpoint);

        let strategy: Arc<dyn FilterStrategy> = match config.mode {
            NetworkMode::Filtered => Arc::new(FullFilterStrategy::new(allowlist.clone())),
            NetworkMode::Conntrack => Arc::new(ConntrackStrategy::new(allowlist.clone())),
            NetworkMode::Sampled => Arc::new(SampledStrategy::new(
                allowlist.clone(),
                config.sampling_rate.unwrap_or(DEFAULT_SAMPLING_RATE),
            )),
            NetworkMode::Direct => unreachable!("handled above"),
        };

        session.enable_traffic_routing(false).await?;
        let returns = session.return_packets()?;

        let processor = tokio::spawn(packet_processor(
            self.print_tx.clone(),
            config.vm_id.clone(),
            session,
            strategy.clone(),
            host_rx,
            host_tx,
            returns,
            event_tx,
        ));

        Ok(VmNetworkHandle {
            nic,
            strategy: Some(strategy),
            allowlist: Some(allowlist),
            events,
            processor: Some(processor),
        })
    }
}

/// The filtered packet path: guest frame -> bridge -> strategy -> tunnel,
/// and tunnel returns -> synthetic frame -> guest. Runs until the NIC
/// closes, the session drops, or a Terminate decision ends the workload.
#[allow(clippy::too_many_arguments)]
async fn packet_processor(
    print_tx: PrintSender,
    vm_id: String,
    session: Arc<TunnelSession>,
    strategy: Arc<dyn FilterStrategy>,
    mut host_rx: mpsc::Receiver<Vec<u8>>,
    host_tx: mpsc::Sender<Vec<u8>>,
    mut returns: tokio_stream::wrappers::UnboundedReceiverStream<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<VmNetworkEvent>,
) {
    let mut bridge = FramePacketBridge::new();
    let mut dropped: u64 = 0;
    loop {
        tokio::select! {
            maybe_frame = host_rx.recv() => {
                let Some(frame) = maybe_frame else {
                    break;
                };
                let Some(packet) = bridge.extract_egress(&frame) else {
                    continue;
                };
                match strategy.should_forward(&packet) {
                    Decision::Forward => {
                        if let Err(e) = session.inject_packet(packet.bytes().to_vec()).await {
                            print(&print_tx, 1, format!("vm {vm_id}: forward failed: {e}")).await;
                        }
                    }
                    Decision::Drop(_reason) => {
                        dropped += 1;
                    }
                    Decision::Terminate(reason) => {
                        print(
                            &print_tx,
                            0,
                            format!("vm {vm_id}: terminating workload: {reason}"),
                        )
                        .await;
                        let _ = event_tx.send(VmNetworkEvent::Terminated { reason });
                        break;
                    }
                }
            }
            maybe_return = returns.next() => {
                let Some(ip) = maybe_return else {
                    break;
                };
                let Some(packet) = Ipv4Packet::parse(&ip) else {
                    continue;
                };
                let (Some(source), Some(vm_port), Some(payload)) = (
                    packet.source_endpoint(),
                    packet.destination_port,
                    packet.udp_payload(),
                ) else {
                    continue;
                };
                let Some(frame) = bridge.wrap_response(payload, source, vm_port) else {
                    continue;
                };
                // guest queue full: drop, the guest's loss to absorb
                let _ = host_tx.try_send(frame.to_bytes());
            }
        }
    }
    session.leave().await;
    if dropped > 0 {
        print(&print_tx, 1, format!("vm {vm_id}: dropped {dropped} packets")).await;
    }
}
