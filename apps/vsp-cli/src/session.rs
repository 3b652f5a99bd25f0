use crate::config::{CliConfig, LinkConfig, PortConfig};
use anyhow::{Context, Result, anyhow, bail};
use futures::{StreamExt, channel::mpsc::UnboundedReceiver};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use vsp_client_core::{
    ClientEvent, CompletionPumpHandle, DispatchResult, ExtensionEvent, ExtensionState,
    PendingCommand, PumpSummary, TransportResult, Transition, VspController,
    VspControllerConfig, notice_channel,
};
use vsp_driver_sim::{SimDriver, SimExtensionManager, SimUserClient};
use vsp_proto::ControllerData;

pub type Controller = VspController<Arc<SimExtensionManager>, SimUserClient>;

/// One CLI invocation: the simulated system, the controller and its pump.
pub struct Session {
    controller: Arc<Controller>,
    driver: Arc<SimDriver>,
    events: UnboundedReceiver<ClientEvent>,
    pump: CompletionPumpHandle,
    task: JoinHandle<TransportResult<PumpSummary>>,
    timeout: Duration,
}

impl Session {
    pub fn start(config: &CliConfig, timeout: Duration) -> Self {
        let (tx, rx) = notice_channel();
        let manager = Arc::new(SimExtensionManager::new(
            tx.clone(),
            config.system.script(&config.extension_id),
        ));
        let driver = SimDriver::new(tx.clone());
        driver.set_latency(Duration::from_millis(config.system.latency_ms));

        let controller = Arc::new(VspController::with_config(
            manager,
            driver.client(),
            VspControllerConfig {
                extension_id: config.extension_id.clone(),
                ..VspControllerConfig::default()
            },
        ));
        controller.register_callback(tx);
        let (_id, events) = controller.observers().subscribe_channel();
        let (pump, task) = controller.start_pump(rx);

        Self {
            controller,
            driver,
            events,
            pump,
            task: tokio::spawn(task),
            timeout,
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Ask the system what is installed and wait for the answer.
    pub async fn discover(&mut self) -> Result<ExtensionState> {
        self.controller.query_installed().context("query installed extension")?;
        self.wait_lifecycle(|step| {
            matches!(
                step.event,
                ExtensionEvent::DiscoveredLoaded | ExtensionEvent::DiscoveredUnloaded
            )
        })
        .await
    }

    pub async fn install(&mut self) -> Result<ExtensionState> {
        self.controller.activate().context("submit activation")?;
        self.wait_lifecycle(|step| {
            matches!(
                step.event,
                ExtensionEvent::ActivationFinished | ExtensionEvent::ActivationFailed
            )
        })
        .await
    }

    pub async fn uninstall(&mut self) -> Result<ExtensionState> {
        self.controller.deactivate().context("submit deactivation")?;
        self.wait_lifecycle(|step| {
            matches!(
                step.event,
                ExtensionEvent::UninstallFinished | ExtensionEvent::ActivationFailed
            )
        })
        .await
    }

    /// Bring the extension to `Activated`, connect to the driver and rebuild
    /// the stored port topology.
    pub async fn ready(&mut self, config: &CliConfig) -> Result<()> {
        let mut state = self.discover().await?;
        if state != ExtensionState::Activated {
            state = self.install().await?;
        }
        if state != ExtensionState::Activated {
            bail!("driver extension is {state}: {}", state.describe());
        }

        self.driver.publish();
        if !self.controller.connect_driver().context("connect to driver")? {
            bail!("driver did not publish its user client");
        }
        self.restore(config).await
    }

    /// Recreate stored ports and links. Port ids are handed out by the driver,
    /// so stored links are remapped onto the new ids.
    async fn restore(&mut self, config: &CliConfig) -> Result<()> {
        let mut ids = BTreeMap::new();
        for port in &config.ports {
            let params = port.parameters()?;
            let created = self.run(self.controller.create_port(params)).await?;
            ids.insert(port.id, created.parameter.link.source);
        }
        for link in &config.links {
            let (Some(source), Some(target)) = (ids.get(&link.source), ids.get(&link.target))
            else {
                warn!(source = link.source, target = link.target, "dropping link to unknown port");
                continue;
            };
            self.run(self.controller.link_ports(*source, *target)).await?;
        }
        if !config.ports.is_empty() {
            debug!(ports = ids.len(), links = config.links.len(), "restored topology");
        }
        Ok(())
    }

    /// Wait for a submitted command, bounded by the session timeout.
    pub async fn run(&self, submitted: DispatchResult<PendingCommand>) -> Result<ControllerData> {
        let pending = submitted.context("submit command")?;
        let command = pending.command();
        let token = pending.token();
        let result = timeout(self.timeout, pending)
            .await
            .map_err(|_| anyhow!("{command} timed out after {:?}", self.timeout))?;
        debug!(%command, %token, ok = result.is_ok(), "command finished");
        result.with_context(|| format!("{command} failed"))
    }

    /// Current ports and links, as they would be written back to the config.
    pub fn topology(&self) -> (Vec<PortConfig>, Vec<LinkConfig>) {
        let ports = self
            .driver
            .ports()
            .iter()
            .map(|port| PortConfig::from_parameters(port.id, &port.parameters))
            .collect();
        let links = self
            .driver
            .links()
            .iter()
            .map(|link| LinkConfig {
                source: link.source,
                target: link.target,
            })
            .collect();
        (ports, links)
    }

    pub async fn shutdown(self) -> Result<PumpSummary> {
        if self.controller.is_driver_connected() {
            self.controller
                .disconnect_driver()
                .context("disconnect driver")?;
        }
        self.pump.shutdown().context("stop completion pump")?;
        let summary = self
            .task
            .await
            .context("join completion pump")?
            .context("completion pump failed")?;
        debug!(?summary, "session closed");
        Ok(summary)
    }

    async fn wait_lifecycle<F>(&mut self, done: F) -> Result<ExtensionState>
    where
        F: Fn(&Transition) -> bool,
    {
        let events = &mut self.events;
        let wait = async {
            while let Some(event) = events.next().await {
                match event {
                    ClientEvent::Status(notice) if notice.status.is_error() => {
                        warn!(code = notice.code, domain = %notice.domain, "{}", notice.message);
                    }
                    ClientEvent::Status(notice) => info!("{}", notice.message),
                    ClientEvent::Lifecycle(step) => {
                        debug!(from = %step.from, to = %step.to, event = ?step.event, "lifecycle");
                        if done(&step) {
                            return Some(step.to);
                        }
                    }
                    _ => {}
                }
            }
            None
        };
        timeout(self.timeout, wait)
            .await
            .map_err(|_| anyhow!("extension request timed out after {:?}", self.timeout))?
            .ok_or_else(|| anyhow!("observer channel closed"))
    }
}
