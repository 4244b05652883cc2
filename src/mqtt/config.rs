use super::BrokerError;
use rumqttc::{LastWill, MqttOptions, Transport};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsConfig {
    /// PEM bundle; system roots are used when absent.
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: DEFAULT_PORT,
            client_id: client_id.into(),
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
            tls: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }

    /// Builds the rumqttc options, including the last will.
    pub fn to_options(&self, last_will: LastWill) -> Result<MqttOptions, BrokerError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.broker.clone(), self.port);
        options
            .set_keep_alive(self.keepalive)
            .set_clean_session(true)
            .set_last_will(last_will);
        if let (Some(user), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(user.clone(), password.clone());
        }
        if let Some(tls) = &self.tls {
            options.set_transport(tls.transport()?);
        }
        Ok(options)
    }
}

impl TlsConfig {
    fn transport(&self) -> Result<Transport, BrokerError> {
        let read = |path: &PathBuf| {
            std::fs::read(path)
                .map_err(|e| BrokerError::Tls(format!("{}: {}", path.display(), e)))
        };
        let client_auth = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((read(cert)?, read(key)?)),
            (None, None) => None,
            _ => {
                return Err(BrokerError::Tls(
                    "client_cert and client_key must be given together".to_string(),
                ))
            }
        };
        match &self.ca_file {
            Some(ca) => Ok(Transport::tls(read(ca)?, client_auth, None)),
            None if client_auth.is_none() => Ok(Transport::tls_with_default_config()),
            None => Err(BrokerError::Tls(
                "client certificates require a ca_file".to_string(),
            )),
        }
    }
}
