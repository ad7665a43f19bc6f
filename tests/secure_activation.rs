mod common;

use std::collections::HashMap;
use std::net::TcpStream;
use std::time::Duration;

use common::{TIMEOUT, assert_close, client_config, init, params};
use toy_he_transformer::protocol::{DEFAULT_MAX_MESSAGE_SIZE, Message, read_message, write_message};
use toy_he_transformer::{
    ElementType, ExecutorConfig, GraphBuilder, HeBackend, HeClient, HeError, HeScheme,
    PoolParams, ProtocolError, SimulatedCkks,
};

fn inputs(name: &str, values: &[f64]) -> HashMap<String, Vec<f64>> {
    HashMap::from([(name.to_string(), values.to_vec())])
}

fn serve_one(
    builder: GraphBuilder,
    config: ExecutorConfig,
    client_inputs: HashMap<String, Vec<f64>>,
) -> Vec<(String, Vec<f64>)> {
    init();
    let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
    let mut exe = backend.compile(builder.build().unwrap()).unwrap();
    let address = exe.local_addr().unwrap();
    let client = HeClient::<SimulatedCkks>::connect(address, client_inputs).unwrap();

    let out = exe.call(Vec::new()).unwrap();
    assert!(out[0].is_ciphertext());
    assert!(!exe.scheme().has_secret_key());
    assert!(out[0].read(exe.scheme()).is_err());
    client.wait_for_results(TIMEOUT).unwrap()
}

#[test]
fn masked_relu_round_trip() {
    let mut b = GraphBuilder::new();
    let x = b.client_parameter("x", vec![1, 4], ElementType::F64);
    let y = b.relu(x).unwrap();
    b.result(y).unwrap();

    let config = client_config()
        .enable_gc(true)
        .mask_gc_inputs(true)
        .mask_gc_outputs(true)
        .max_activation_batch(3)
        .build()
        .unwrap();
    let results = serve_one(b, config, inputs("x", &[-1.0, 2.0, -3.0, 4.0]));
    assert_eq!(results.len(), 1);
    assert_close(&results[0].1, &[0.0, 2.0, 0.0, 4.0], 1e-3);
}

#[test]
fn bounded_relu_feeds_further_arithmetic() {
    let mut b = GraphBuilder::new();
    let x = b.client_parameter("x", vec![2, 3], ElementType::F64);
    let r = b.bounded_relu(x, 6.0).unwrap();
    let w = b
        .constant("w", vec![3, 1], ElementType::F64, vec![1.0, 1.0, 1.0])
        .unwrap();
    let y = b.dot(r, w, 1).unwrap();
    b.result(y).unwrap();

    let config = client_config().build().unwrap();
    let results = serve_one(
        b,
        config,
        inputs("x", &[-1.0, 2.0, 9.0, 0.5, -4.0, 3.0]),
    );
    assert_close(&results[0].1, &[8.0, 3.5], 1e-3);
}

#[test]
fn max_pool_asks_the_client_per_window() {
    let mut b = GraphBuilder::new();
    let x = b.client_parameter("x", vec![1, 1, 2, 4], ElementType::F64);
    let y = b.max_pool(x, PoolParams::new(vec![2, 2])).unwrap();
    b.result(y).unwrap();

    let config = client_config().build().unwrap();
    let results = serve_one(
        b,
        config,
        inputs("x", &[1.0, 5.0, 0.0, 8.0, -2.0, 3.0, 7.0, -1.0]),
    );
    assert_close(&results[0].1, &[5.0, 8.0], 1e-3);
}

#[test]
fn masked_max_pool_round_trip() {
    let mut b = GraphBuilder::new();
    let x = b.client_parameter("x", vec![1, 1, 2, 2], ElementType::F64);
    let y = b.max_pool(x, PoolParams::new(vec![2, 2])).unwrap();
    b.result(y).unwrap();

    let config = client_config()
        .enable_gc(true)
        .mask_gc_inputs(true)
        .mask_gc_outputs(true)
        .build()
        .unwrap();
    let results = serve_one(b, config, inputs("x", &[-3.0, -1.5, -7.0, -2.0]));
    assert_close(&results[0].1, &[-1.5], 1e-3);
}

#[test]
fn client_disconnect_fails_the_call() {
    init();
    let mut b = GraphBuilder::new();
    let x = b.client_parameter("x", vec![1, 2], ElementType::F64);
    let y = b.relu(x).unwrap();
    b.result(y).unwrap();

    let config = client_config()
        .activation_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
    let mut exe = backend.compile(b.build().unwrap()).unwrap();

    {
        let mut stream = TcpStream::connect(exe.local_addr().unwrap()).unwrap();
        let hello = read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let keys = SimulatedCkks::from_parameters(hello.encryption_parameters.unwrap()).unwrap();
        keys.generate_keys().unwrap();
        let message = Message::keys(
            keys.export_public_key().unwrap(),
            keys.export_eval_key().unwrap(),
        );
        write_message(&mut stream, &message, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
    }

    let err = exe.call(Vec::new()).unwrap_err();
    assert!(
        matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::PeerDisconnected | ProtocolError::Timeout { .. }
            }
        ),
        "unexpected error: {err}"
    );
}
