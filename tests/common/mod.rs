#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use approx::assert_abs_diff_eq;
use toy_he_transformer::{EncryptionParameters, ExecutorConfigBuilder};

/// Installs the crate's subscriber once per test binary.
pub fn init() {
    toy_he_transformer::logging::init_logging();
}

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters with a wide lowest prime so that masked values still fit
/// after mod-switching to the bottom of the chain.
pub fn params() -> EncryptionParameters {
    EncryptionParameters::builder()
        .poly_modulus_degree(1024)
        .coeff_modulus_bits(vec![60, 40, 40, 60])
        .scale(2f64.powi(40))
        .build()
        .unwrap()
}

/// Encrypted execution talking to a client on an ephemeral loopback port.
pub fn client_config() -> ExecutorConfigBuilder {
    toy_he_transformer::ExecutorConfig::builder()
        .encrypt_data(true)
        .enable_client(true)
        .activation_timeout(TIMEOUT)
        .client_address(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
}

pub fn assert_close(got: &[f64], want: &[f64], epsilon: f64) {
    assert_eq!(got.len(), want.len(), "got {got:?}, want {want:?}");
    for (g, w) in got.iter().zip(want) {
        assert_abs_diff_eq!(*g, *w, epsilon = epsilon);
    }
}
