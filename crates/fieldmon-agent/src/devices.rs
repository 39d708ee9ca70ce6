use crate::config::Config;
use fieldmon_common::Device;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct DeviceFile {
    pub devices: Vec<Device>,
}

/// Loads the device list from the configured provider. Zero devices is a
/// startup error; exceeding `agent.max_devices` is only a warning.
pub fn load(config: &Config) -> anyhow::Result<Vec<Arc<Device>>> {
    let devices = match config.devices.source.as_str() {
        "file" => load_from_file(&config.devices.file.path)?,
        other => anyhow::bail!("unsupported device source: {other}"),
    };

    if devices.is_empty() {
        anyhow::bail!("no devices configured");
    }
    if devices.len() > config.agent.max_devices {
        tracing::warn!(
            device_count = devices.len(),
            max_devices = config.agent.max_devices,
            "Device count exceeds max_devices limit"
        );
    }

    Ok(devices.into_iter().map(Arc::new).collect())
}

fn load_from_file(path: &str) -> anyhow::Result<Vec<Device>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read devices file '{path}': {e}"))?;
    let file: DeviceFile = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parse devices file '{path}': {e}"))?;

    tracing::info!(path = %path, count = file.devices.len(), "Loaded devices from file");
    Ok(file.devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldmon_common::ProtocolKind;
    use std::io::Write as _;

    fn config_with_device_file(path: &str) -> Config {
        let mut config: Config = toml::from_str("").unwrap();
        config.devices.file.path = path.to_string();
        config
    }

    #[test]
    fn parses_device_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "devices": [
                    {{
                        "id": "plc-001",
                        "name": "furnace",
                        "ip": "10.1.0.5",
                        "port": 4840,
                        "protocol": "sim",
                        "interval": 5,
                        "metrics": [
                            {{"node_id": "temp", "name": "temperature", "data_type": "float", "unit": "celsius", "scale_factor": 0.1}}
                        ],
                        "tags": {{"line": "a"}}
                    }}
                ]
            }}"#
        )
        .unwrap();

        let config = config_with_device_file(file.path().to_str().unwrap());
        let devices = load(&config).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "plc-001");
        assert_eq!(devices[0].protocol, ProtocolKind::Sim);
        assert!(devices[0].enabled);
        assert_eq!(devices[0].metrics[0].scale_factor, 0.1);
    }

    #[test]
    fn empty_device_list_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"devices": []}}"#).unwrap();

        let config = config_with_device_file(file.path().to_str().unwrap());
        assert!(load(&config).is_err());
    }

    #[test]
    fn unknown_source_is_an_error() {
        let mut config = config_with_device_file("devices.json");
        config.devices.source = "etcd".to_string();
        assert!(load(&config).is_err());
    }
}
