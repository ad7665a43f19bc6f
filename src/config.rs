//! Executor policy flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::errors::{HeError, HeResult};

/// Largest number of elements sent in one activation request.
pub const DEFAULT_MAX_ACTIVATION_BATCH: usize = 1000;
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CLIENT_PORT: u16 = 34000;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub encrypt_data: bool,
    pub encrypt_model: bool,
    pub pack_data: bool,
    pub enable_client: bool,
    pub enable_gc: bool,
    pub mask_gc_inputs: bool,
    pub mask_gc_outputs: bool,
    pub lazy_rescaling: bool,
    pub known_zero_fast_path: bool,
    pub max_activation_batch: usize,
    pub activation_timeout: Duration,
    /// Address the server listens on for the client. Port 0 picks any.
    pub client_address: SocketAddr,
}

impl ExecutorConfig {
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::new()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            encrypt_data: false,
            encrypt_model: false,
            pack_data: true,
            enable_client: false,
            enable_gc: false,
            mask_gc_inputs: false,
            mask_gc_outputs: false,
            lazy_rescaling: true,
            known_zero_fast_path: true,
            max_activation_batch: DEFAULT_MAX_ACTIVATION_BATCH,
            activation_timeout: DEFAULT_ACTIVATION_TIMEOUT,
            client_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CLIENT_PORT),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutorConfigBuilder {
    encrypt_data: Option<bool>,
    encrypt_model: Option<bool>,
    pack_data: Option<bool>,
    enable_client: Option<bool>,
    enable_gc: Option<bool>,
    mask_gc_inputs: Option<bool>,
    mask_gc_outputs: Option<bool>,
    lazy_rescaling: Option<bool>,
    known_zero_fast_path: Option<bool>,
    max_activation_batch: Option<usize>,
    activation_timeout: Option<Duration>,
    client_address: Option<SocketAddr>,
}

impl ExecutorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encrypt_data(mut self, enabled: bool) -> Self {
        self.encrypt_data = Some(enabled);
        self
    }

    pub fn encrypt_model(mut self, enabled: bool) -> Self {
        self.encrypt_model = Some(enabled);
        self
    }

    pub fn pack_data(mut self, enabled: bool) -> Self {
        self.pack_data = Some(enabled);
        self
    }

    pub fn enable_client(mut self, enabled: bool) -> Self {
        self.enable_client = Some(enabled);
        self
    }

    pub fn enable_gc(mut self, enabled: bool) -> Self {
        self.enable_gc = Some(enabled);
        self
    }

    pub fn mask_gc_inputs(mut self, enabled: bool) -> Self {
        self.mask_gc_inputs = Some(enabled);
        self
    }

    pub fn mask_gc_outputs(mut self, enabled: bool) -> Self {
        self.mask_gc_outputs = Some(enabled);
        self
    }

    pub fn lazy_rescaling(mut self, enabled: bool) -> Self {
        self.lazy_rescaling = Some(enabled);
        self
    }

    pub fn known_zero_fast_path(mut self, enabled: bool) -> Self {
        self.known_zero_fast_path = Some(enabled);
        self
    }

    pub fn max_activation_batch(mut self, size: usize) -> Self {
        self.max_activation_batch = Some(size);
        self
    }

    pub fn activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = Some(timeout);
        self
    }

    pub fn client_address(mut self, address: SocketAddr) -> Self {
        self.client_address = Some(address);
        self
    }

    pub fn client_port(mut self, port: u16) -> Self {
        let mut address = self
            .client_address
            .unwrap_or_else(|| ExecutorConfig::default().client_address);
        address.set_port(port);
        self.client_address = Some(address);
        self
    }

    pub fn build(self) -> HeResult<ExecutorConfig> {
        let defaults = ExecutorConfig::default();
        let config = ExecutorConfig {
            encrypt_data: self.encrypt_data.unwrap_or(defaults.encrypt_data),
            encrypt_model: self.encrypt_model.unwrap_or(defaults.encrypt_model),
            pack_data: self.pack_data.unwrap_or(defaults.pack_data),
            enable_client: self.enable_client.unwrap_or(defaults.enable_client),
            enable_gc: self.enable_gc.unwrap_or(defaults.enable_gc),
            mask_gc_inputs: self.mask_gc_inputs.unwrap_or(defaults.mask_gc_inputs),
            mask_gc_outputs: self.mask_gc_outputs.unwrap_or(defaults.mask_gc_outputs),
            lazy_rescaling: self.lazy_rescaling.unwrap_or(defaults.lazy_rescaling),
            known_zero_fast_path: self
                .known_zero_fast_path
                .unwrap_or(defaults.known_zero_fast_path),
            max_activation_batch: self
                .max_activation_batch
                .unwrap_or(defaults.max_activation_batch),
            activation_timeout: self
                .activation_timeout
                .unwrap_or(defaults.activation_timeout),
            client_address: self.client_address.unwrap_or(defaults.client_address),
        };
        if config.max_activation_batch == 0 {
            return Err(HeError::invalid_parameter(
                "max_activation_batch must be positive",
            ));
        }
        if (config.mask_gc_inputs || config.mask_gc_outputs) && !config.enable_client {
            return Err(HeError::invalid_parameter(
                "garbled-circuit masking requires enable_client",
            ));
        }
        if config.enable_client && !config.encrypt_data {
            return Err(HeError::invalid_parameter(
                "a client session requires encrypt_data",
            ));
        }
        Ok(config)
    }
}
