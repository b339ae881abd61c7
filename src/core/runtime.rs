/// Engine runtime - one tokio task per device link
///
/// Each transport gets one `Bus` and one router task forwarding its inbound
/// bytes. Each link gets its own bounded event channel, scheduler and task;
/// the task is the only place the link's state is touched.
use anyhow::{anyhow, Result};
use std::{collections::HashMap, sync::Arc, time::Duration};

use super::{
    bus::{Bus, LinkId},
    event::LinkEvent,
    link::DeviceLink,
    scheduler::TokioScheduler,
};
use crate::{
    api::{builder::LinkBuilder, sink::ChannelSink},
    cli::config::{EngineConfig, TransportConfig},
    protocol::transport::{SerialTransport, TcpTransport, Transport},
};

/// Capacity of each link's event channel.
const LINK_EVENT_CAPACITY: usize = 256;

/// Control handle of one running link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    name: String,
    events: flume::Sender<LinkEvent>,
}

impl LinkHandle {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-arm polling; health history is kept.
    pub fn start(&self) -> Result<()> {
        self.send(LinkEvent::Start)
    }

    /// Cancel the link's timers; its state stays as it was.
    pub fn stop(&self) -> Result<()> {
        self.send(LinkEvent::Stop)
    }

    /// Stop and end the link task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(LinkEvent::Shutdown)
    }

    fn send(&self, event: LinkEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!("Link '{}' is no longer running", self.name))
    }
}

/// Running set of links.
#[derive(Debug)]
pub struct Engine {
    links: Vec<LinkHandle>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    routers: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Validate `config`, open every transport and start all enabled links.
    pub async fn start(config: EngineConfig, sink: Arc<dyn ChannelSink>) -> Result<Self> {
        config.validate()?;
        let mut transports = HashMap::new();
        for transport in &config.transports {
            let opened = open_transport(transport).await?;
            transports.insert(transport.name().to_string(), opened);
        }
        Self::start_with_transports(config, sink, transports)
    }

    /// Start links over transports that are already open, keyed by transport name.
    /// Must be called from within a tokio runtime.
    pub fn start_with_transports(
        config: EngineConfig,
        sink: Arc<dyn ChannelSink>,
        transports: HashMap<String, Arc<dyn Transport>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut buses: HashMap<String, Arc<Bus>> = HashMap::new();
        let mut routers = Vec::new();
        for (name, transport) in transports {
            let bus = Bus::new(transport);
            routers.push(bus.spawn_router());
            buses.insert(name, bus);
        }

        let mut links = Vec::with_capacity(config.links.len());
        let mut tasks = Vec::with_capacity(config.links.len());
        for (index, link_config) in config.links.iter().enumerate() {
            let id = LinkId(index as u32);
            let bus = buses.get(&link_config.transport).cloned().ok_or_else(|| {
                anyhow!(
                    "Transport '{}' for link '{}' is not open",
                    link_config.transport,
                    link_config.name
                )
            })?;

            let (events, receiver) = flume::bounded(LINK_EVENT_CAPACITY);
            let scheduler = Arc::new(TokioScheduler::new(events.clone()));
            let link = LinkBuilder::from_config(link_config).build(
                id,
                bus,
                events.clone(),
                scheduler,
                sink.clone(),
            )?;

            let handle = LinkHandle {
                id,
                name: link_config.name.clone(),
                events,
            };
            if link_config.enabled {
                handle.start()?;
            } else {
                log::info!("{}: disabled in configuration", link_config.name);
            }

            tasks.push(tokio::spawn(run_link(link, receiver)));
            links.push(handle);
        }

        log::info!(
            "Engine started: {} link(s) on {} transport(s)",
            links.len(),
            buses.len()
        );
        Ok(Self {
            links,
            tasks,
            routers,
        })
    }

    pub fn links(&self) -> &[LinkHandle] {
        &self.links
    }

    pub fn link(&self, name: &str) -> Option<&LinkHandle> {
        self.links.iter().find(|link| link.name == name)
    }

    /// Stop every link and wait for its task to finish.
    pub async fn shutdown(self) {
        for link in &self.links {
            if let Err(err) = link.shutdown() {
                log::warn!("{err}");
            }
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                log::warn!("Link task ended abnormally: {err}");
            }
        }
        for router in self.routers {
            router.abort();
        }
        log::info!("Engine stopped");
    }
}

/// Open the medium described by `config`.
pub async fn open_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match config {
        TransportConfig::Serial { name, .. } => {
            let name = name.clone();
            let settings = config
                .serial_settings()
                .ok_or_else(|| anyhow!("Transport '{name}' has no serial settings"))?;
            // opening a port blocks
            let transport =
                tokio::task::spawn_blocking(move || SerialTransport::open(name, &settings))
                    .await??;
            Ok(Arc::new(transport))
        }
        TransportConfig::Tcp {
            name,
            address,
            connect_timeout_ms,
        } => {
            let transport = TcpTransport::connect(
                name.clone(),
                address,
                Duration::from_millis(*connect_timeout_ms),
            )
            .await?;
            Ok(Arc::new(transport))
        }
    }
}

async fn run_link(mut link: DeviceLink, events: flume::Receiver<LinkEvent>) {
    while let Ok(event) = events.recv_async().await {
        if !link.handle_event(event) {
            break;
        }
    }
    log::info!("{}: task finished in state {}", link.name(), link.state());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::sink::{ChannelEvent, FlumeSink},
        cli::config::{CodecConfig, LinkConfig, RegisterRead},
        core::health::HealthState,
        protocol::{
            codec::{append_crc, RegisterMode},
            transport::MemoryTransport,
        },
    };

    fn fast_link(name: &str, unit_id: u8) -> LinkConfig {
        let mut link = LinkConfig::new(
            name,
            "mem",
            CodecConfig::ModbusRtu(RegisterRead {
                unit_id,
                mode: RegisterMode::Holding,
                address: 0,
                count: 1,
                fields: Vec::new(),
            }),
        );
        link.poll_interval_ms = 40;
        link.response_timeout_ms = 15;
        link.initial_poll_delay_ms = 5;
        link.stale_after_missed = 1;
        link.offline_after_missed = 2;
        link
    }

    fn config(links: Vec<LinkConfig>) -> EngineConfig {
        EngineConfig {
            transports: vec![TransportConfig::Tcp {
                name: "mem".to_string(),
                address: "unused".to_string(),
                connect_timeout_ms: 1,
            }],
            links,
        }
    }

    async fn wait_for_state(
        events: &flume::Receiver<ChannelEvent>,
        link: &str,
        wanted: HealthState,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv_async()).await {
            if let ChannelEvent::State {
                link: name, state, ..
            } = event
            {
                if name == link && state == wanted {
                    return true;
                }
            }
        }
        false
    }

    #[tokio::test]
    async fn test_silent_device_goes_offline() {
        let transport = Arc::new(MemoryTransport::new("mem"));
        let (sink, events) = FlumeSink::new();
        let transports: HashMap<String, Arc<dyn Transport>> =
            HashMap::from([("mem".to_string(), transport.clone() as Arc<dyn Transport>)]);

        let engine = Engine::start_with_transports(
            config(vec![fast_link("quiet", 1)]),
            Arc::new(sink),
            transports,
        )
        .unwrap();
        assert!(wait_for_state(&events, "quiet", HealthState::Offline).await);
        assert!(transport.sent_count() >= 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_responding_device_becomes_active() {
        let transport = Arc::new(MemoryTransport::new("mem"));
        let (sink, events) = FlumeSink::new();
        let transports: HashMap<String, Arc<dyn Transport>> =
            HashMap::from([("mem".to_string(), transport.clone() as Arc<dyn Transport>)]);

        let engine = Engine::start_with_transports(
            config(vec![fast_link("pump", 4)]),
            Arc::new(sink),
            transports,
        )
        .unwrap();

        // answer every request with register value 0x0102
        let responder_transport = transport.clone();
        let responder = tokio::spawn(async move {
            let mut answered = 0;
            loop {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let sent = responder_transport.sent_count();
                while answered < sent {
                    let mut frame = vec![4, 0x03, 0x02, 0x01, 0x02];
                    append_crc(&mut frame);
                    responder_transport.inject(frame);
                    answered += 1;
                }
            }
        });

        assert!(wait_for_state(&events, "pump", HealthState::Active).await);
        responder.abort();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_links_share_one_bus() {
        let transport = Arc::new(MemoryTransport::new("mem"));
        let transports: HashMap<String, Arc<dyn Transport>> =
            HashMap::from([("mem".to_string(), transport.clone() as Arc<dyn Transport>)]);
        let (sink, _events) = FlumeSink::new();

        let engine = Engine::start_with_transports(
            config(vec![fast_link("a", 1), fast_link("b", 2)]),
            Arc::new(sink),
            transports,
        )
        .unwrap();
        assert_eq!(engine.links().len(), 2);
        assert!(engine.link("b").is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let units: Vec<u8> = transport.sent().iter().map(|frame| frame[0]).collect();
        assert!(units.contains(&1));
        assert!(units.contains(&2));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_transport_is_rejected() {
        let result = Engine::start_with_transports(
            config(vec![fast_link("orphan", 1)]),
            Arc::new(crate::api::sink::NoOpSink),
            HashMap::new(),
        );
        tokio_test::assert_err!(result);
    }
}
