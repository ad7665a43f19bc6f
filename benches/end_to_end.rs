use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use toy_he_transformer::{
    ConvolutionParams, ElementType, EncryptionParameters, ExecutorConfig, Graph, GraphBuilder,
    HeBackend, PoolParams, SimulatedCkks,
};

fn params() -> EncryptionParameters {
    EncryptionParameters::builder()
        .poly_modulus_degree(1024)
        .coeff_modulus_bits(vec![60, 40, 40, 60])
        .scale(2f64.powi(40))
        .build()
        .expect("benchmark parameters")
}

/// Conv, ReLU, average pool and a dense layer over an `side x side` image.
fn small_cnn(side: usize, rng: &mut ChaCha20Rng) -> Graph {
    let mut b = GraphBuilder::new();
    let x = b.parameter("image", vec![1, 1, side, side], ElementType::F32);
    let filters: Vec<f64> = (0..4 * 9).map(|_| rng.random_range(-1.0..1.0)).collect();
    let f = b
        .constant("filters", vec![4, 1, 3, 3], ElementType::F32, filters)
        .expect("filters");
    let conv = b
        .convolution(x, f, ConvolutionParams::unit(2))
        .expect("conv");
    let act = b.relu(conv).expect("relu");
    let pooled = b
        .avg_pool(act, PoolParams::new(vec![2, 2]), true)
        .expect("pool");
    let flat_len = 4 * ((side - 2) / 2) * ((side - 2) / 2);
    let flat = b
        .reshape(pooled, vec![0, 1, 2, 3], vec![1, flat_len])
        .expect("reshape");
    let weights: Vec<f64> = (0..flat_len * 10).map(|_| rng.random_range(-0.5..0.5)).collect();
    let w = b
        .constant("dense", vec![flat_len, 10], ElementType::F32, weights)
        .expect("dense");
    let logits = b.dot(flat, w, 1).expect("dot");
    b.result(logits).expect("result");
    b.build().expect("graph")
}

fn bench_inference(c: &mut Criterion) {
    let mut group = c.benchmark_group("inference");
    group.sample_size(10);

    for &side in &[6, 10] {
        for &lazy in &[true, false] {
            let mut rng = ChaCha20Rng::seed_from_u64(123);
            let graph = small_cnn(side, &mut rng);
            let config = ExecutorConfig::builder()
                .encrypt_data(true)
                .lazy_rescaling(lazy)
                .build()
                .expect("config");
            let backend = HeBackend::<SimulatedCkks>::new(params(), config).expect("backend");
            let mut exe = backend.compile(graph).expect("compile");
            let image: Vec<f64> = (0..side * side).map(|_| rng.random_range(0.0..1.0)).collect();

            let name = format!("cnn_{side}x{side}_{}", if lazy { "lazy" } else { "eager" });
            group.bench_function(name, |b| {
                b.iter(|| {
                    let input = exe.input_tensor(0, black_box(&image)).expect("input");
                    exe.call(vec![input]).expect("call")
                })
            });
        }
    }
    group.finish();
}

fn bench_encrypt_decrypt(c: &mut Criterion) {
    use toy_he_transformer::HeScheme;

    let scheme = SimulatedCkks::from_parameters(params()).expect("scheme");
    scheme.generate_keys().expect("keys");
    let mut rng = ChaCha20Rng::seed_from_u64(123);
    let values: Vec<f64> = (0..scheme.slot_count())
        .map(|_| rng.random_range(-10.0..10.0))
        .collect();

    c.bench_function("encrypt_decrypt_full_slots", |b| {
        b.iter(|| {
            let ct = scheme.encrypt(black_box(&values), false).expect("encrypt");
            scheme.decrypt(&ct, values.len(), false).expect("decrypt")
        })
    });
}

criterion_group!(benches, bench_inference, bench_encrypt_decrypt);
criterion_main!(benches);
