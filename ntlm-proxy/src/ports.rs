use anyhow::Context;
use anyhow::Result;
use anyhow::ensure;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use tracing::info;
use tracing::warn;
use url::Url;

pub const PORTS_FILE_NAME: &str = "cypress-ntlm-auth.port";

/// Contents of the ports file written on successful startup and deleted on
/// graceful shutdown, announcing both listener URLs to the host tooling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsFile {
    pub config_api_url: String,
    pub ntlm_proxy_url: String,
}

/// Default user data directory holding the ports file and the MITM CA cache.
pub fn user_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve the user data directory")?;
    Ok(base.join("cypress-ntlm-auth"))
}

pub fn ports_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PORTS_FILE_NAME)
}

pub fn write_ports_file(data_dir: &Path, ports: &PortsFile) -> Result<PathBuf> {
    validate(ports)?;
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let path = ports_file_path(data_dir);
    let contents = serde_json::to_string(ports).context("failed to serialize ports file")?;
    fs::write(&path, contents)
        .with_context(|| format!("failed to write ports file {}", path.display()))?;
    info!("wrote ports file (path={})", path.display());
    Ok(path)
}

pub fn read_ports_file(path: &Path) -> Result<PortsFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read ports file {}", path.display()))?;
    let ports: PortsFile =
        serde_json::from_str(&contents).context("failed to parse ports file")?;
    validate(&ports)?;
    Ok(ports)
}

/// Best-effort removal; a missing file is not an error on shutdown.
pub fn delete_ports_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("removed ports file (path={})", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove ports file {}: {err}", path.display()),
    }
}

fn validate(ports: &PortsFile) -> Result<()> {
    validate_url("configApiUrl", &ports.config_api_url)?;
    validate_url("ntlmProxyUrl", &ports.ntlm_proxy_url)?;
    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let parsed = Url::parse(value).with_context(|| format!("invalid {field}: {value}"))?;
    ensure!(
        matches!(parsed.scheme(), "http" | "https"),
        "invalid {field} scheme: {value}"
    );
    ensure!(
        parsed.host_str().map(|host| !host.is_empty()).unwrap_or(false),
        "missing host in {field}: {value}"
    );
    ensure!(parsed.port().is_some(), "missing port in {field}: {value}");
    Ok(())
}
