//! Broker endpoint parsing and TLS transport setup.
//!
//! - CA verification: custom CA path or the bundled webpki roots
//! - Client certificates: mutual TLS when both cert and key are given
//! - Plain TCP when TLS is off; TLS materials with TLS off is an error

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// PEM material for broker TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate. `None` uses the default root store.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Read TLS files. Client cert and key must be given together.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let read = |path: &Path, what: &str| {
            std::fs::read(path)
                .with_context(|| format!("failed to read broker TLS {} '{}'", what, path.display()))
        };
        let ca = ca_path.map(|p| read(p, "CA")).transpose()?;
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((read(cert, "client cert")?, read(key, "client key")?)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("broker TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("broker TLS client key provided without certificate"))
            }
        };
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse a broker address.
///
/// Accepts `host`, `host:port`, `[v6]:port`, with an optional `mqtt://`,
/// `tcp://`, `mqtts://` or `ssl://` scheme. A missing port defaults to 1883,
/// or 8883 when TLS is on.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest.trim_end_matches('/');
    }
    if remainder.is_empty() {
        return Err(anyhow!("empty MQTT broker address"));
    }

    let default_port = if use_tls {
        DEFAULT_MQTTS_PORT
    } else {
        DEFAULT_MQTT_PORT
    };
    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    let parse_port = |port: &str| -> Result<u16> {
        port.parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port)?)),
        Some(_) => Err(anyhow!("IPv6 MQTT address must be bracketed: {}", addr)),
        None => Ok((addr.to_string(), default_port)),
    }
}

/// Build the rumqttc transport for an endpoint.
pub fn build_transport(endpoint: &MqttEndpoint, tls: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if tls.is_configured() {
            return Err(anyhow!(
                "broker TLS materials provided but TLS is disabled; \
                 use --mqtt-use-tls or an mqtts:// address"
            ));
        }
        return Ok(Transport::tcp());
    }
    if !tls.is_configured() {
        return Ok(Transport::tls_with_default_config());
    }
    let ca = tls.ca.clone().ok_or_else(|| {
        anyhow!("broker TLS CA certificate is required when providing client certificates")
    })?;
    Ok(Transport::tls(ca, tls.client_auth.clone(), None))
}
