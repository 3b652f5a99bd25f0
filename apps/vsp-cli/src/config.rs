use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};
use vsp_driver_sim::SimScript;
use vsp_proto::{
    DEFAULT_EXTENSION_ID, FlowControl, MAX_PORT_LINKS, MAX_SERIAL_PORTS, Parity, PortParameters,
};

const CONFIG_VERSION: u32 = 1;

/// JSON file holding the simulated system setup and the port topology
/// carried between invocations.
#[derive(Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and check the config. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<CliConfig>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(format!("read {}", self.path.display())),
        };
        let config: CliConfig = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", self.path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", self.path.display()))?;
        Ok(Some(config))
    }

    /// Replace the file with `config`. The old file stays intact until the
    /// new contents are fully written.
    pub fn store(&self, config: &CliConfig) -> Result<()> {
        config.validate().context("refusing to store invalid config")?;
        let dir = self.path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = dir {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let mut text = serde_json::to_string_pretty(config).context("encode config")?;
        text.push('\n');
        let staged = self.path.with_extension("tmp");
        fs::write(&staged, text).with_context(|| format!("write {}", staged.display()))?;
        fs::rename(&staged, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    pub version: u32,
    #[serde(default = "default_extension_id")]
    pub extension_id: String,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

impl CliConfig {
    /// Check that the stored topology is one the driver could rebuild.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.version == CONFIG_VERSION,
            "unsupported config file version {}",
            self.version
        );
        ensure!(
            self.ports.len() <= MAX_SERIAL_PORTS,
            "{} ports configured, the driver holds at most {MAX_SERIAL_PORTS}",
            self.ports.len()
        );
        ensure!(
            self.links.len() <= MAX_PORT_LINKS,
            "{} links configured, the driver holds at most {MAX_PORT_LINKS}",
            self.links.len()
        );
        let mut ids = BTreeSet::new();
        for port in &self.ports {
            port.parameters()?;
            ensure!(ids.insert(port.id), "port {} is listed twice", port.id);
        }
        let mut linked = BTreeSet::new();
        for link in &self.links {
            ensure!(
                link.source != link.target,
                "port {} is linked to itself",
                link.source
            );
            for id in [link.source, link.target] {
                ensure!(ids.contains(&id), "link names unknown port {id}");
                ensure!(linked.insert(id), "port {id} is in more than one link");
            }
        }
        Ok(())
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            extension_id: default_extension_id(),
            system: SystemConfig::default(),
            ports: Vec::new(),
            links: Vec::new(),
        }
    }
}

/// How the simulated OS and driver behave.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub reboot_required: bool,
    /// Version already installed before the first activation.
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default = "default_bundle_version")]
    pub bundle_version: String,
    /// Delay applied to every driver completion.
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            require_approval: false,
            reboot_required: false,
            installed_version: None,
            bundle_version: default_bundle_version(),
            latency_ms: 0,
        }
    }
}

impl SystemConfig {
    pub fn script(&self, extension_id: &str) -> SimScript {
        let mut script = SimScript {
            identifier: extension_id.to_string(),
            ..SimScript::default()
        }
        .with_bundle_version(&self.bundle_version);
        if self.require_approval {
            script = script.with_approval();
        }
        if self.reboot_required {
            script = script.with_reboot();
        }
        if let Some(version) = &self.installed_version {
            script = script.with_installed(version);
        }
        script
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub id: u8,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// Wire code: 1 none, 2 odd, 3 even, 4 mark, 5 space.
    pub parity: u8,
    /// Wire code: 0 none, 1 hardware, 2 software.
    pub flow_control: u8,
}

impl PortConfig {
    pub fn from_parameters(id: u8, params: &PortParameters) -> Self {
        Self {
            id,
            baud_rate: params.baud_rate,
            data_bits: params.data_bits,
            stop_bits: params.stop_bits,
            parity: params.parity as u8,
            flow_control: params.flow_control as u8,
        }
    }

    pub fn parameters(&self) -> Result<PortParameters> {
        let parity =
            Parity::try_from(self.parity).map_err(|err| anyhow!("port {}: {err}", self.id))?;
        let flow_control = FlowControl::try_from(self.flow_control)
            .map_err(|err| anyhow!("port {}: {err}", self.id))?;
        PortParameters::new(
            self.baud_rate,
            self.data_bits,
            self.stop_bits,
            parity,
            flow_control,
        )
        .map_err(|err| anyhow!("port {}: {err}", self.id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub source: u8,
    pub target: u8,
}

fn default_extension_id() -> String {
    DEFAULT_EXTENSION_ID.to_string()
}

fn default_bundle_version() -> String {
    "1.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_config_file() {
        let dir = tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("nested").join("vsp.json"));
        assert!(file.load().unwrap().is_none());

        let config = CliConfig {
            system: SystemConfig {
                require_approval: true,
                latency_ms: 5,
                ..SystemConfig::default()
            },
            ports: vec![
                PortConfig::from_parameters(3, &PortParameters::default()),
                PortConfig::from_parameters(4, &PortParameters::default()),
            ],
            links: vec![LinkConfig {
                source: 3,
                target: 4,
            }],
            ..CliConfig::default()
        };
        file.store(&config).unwrap();
        assert_eq!(file.load().unwrap(), Some(config));
        assert!(!file.path().with_extension("tmp").exists());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vsp.json");
        fs::write(&path, br#"{"version": 1}"#).unwrap();
        let config = ConfigFile::new(path).load().unwrap().unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.system.script(&config.extension_id), SimScript::default());
    }

    #[test]
    fn rejects_other_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vsp.json");
        fs::write(&path, br#"{"version": 9}"#).unwrap();
        let err = ConfigFile::new(path).load().unwrap_err();
        assert!(format!("{err:#}").contains("unsupported config file version 9"));
    }

    #[test]
    fn rejects_topologies_the_driver_cannot_rebuild() {
        let port = |id| PortConfig::from_parameters(id, &PortParameters::default());
        let link = |source, target| LinkConfig { source, target };
        let config = |ports, links| CliConfig {
            ports,
            links,
            ..CliConfig::default()
        };
        let reason = |config: CliConfig| format!("{:#}", config.validate().unwrap_err());

        assert!(config(vec![port(1), port(2)], vec![link(1, 2)]).validate().is_ok());
        assert!(reason(config(vec![port(1), port(1)], vec![])).contains("listed twice"));
        assert!(reason(config(vec![port(1)], vec![link(1, 1)])).contains("linked to itself"));
        assert!(reason(config(vec![port(1)], vec![link(1, 7)])).contains("unknown port 7"));
        assert!(
            reason(config(vec![port(1), port(2), port(3)], vec![link(1, 2), link(2, 3)]))
                .contains("more than one link")
        );
        let crowded = (1..=17).map(port).collect();
        assert!(reason(config(crowded, vec![])).contains("at most 16"));

        let dir = tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("vsp.json"));
        assert!(file.store(&config(vec![], vec![link(1, 2)])).is_err());
        assert!(!file.path().exists());
    }

    #[test]
    fn port_parameters_are_validated() {
        let mut port = PortConfig::from_parameters(1, &PortParameters::default());
        assert_eq!(port.parameters().unwrap(), PortParameters::default());
        port.parity = 9;
        assert!(port.parameters().is_err());
    }
}
