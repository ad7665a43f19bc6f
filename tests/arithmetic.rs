mod common;

use common::{assert_close, params};
use paste::paste;
use toy_he_transformer::precision::{match_scale, rescale_tensor, rescale_values};
use toy_he_transformer::{
    ElementType, ExecutorConfig, GraphBuilder, HeBackend, HeError, HeScheme, HeTensor, HeValue,
    PrecisionError, SimulatedCkks,
};

fn add_zero(encrypt_data: bool, encrypt_model: bool) {
    let mut b = GraphBuilder::new();
    let x = b.parameter("x", vec![4], ElementType::F64);
    let zero = b
        .constant("zero", vec![4], ElementType::F64, vec![0.0; 4])
        .unwrap();
    let sum = b.add(x, zero).unwrap();
    b.result(sum).unwrap();

    let config = ExecutorConfig::builder()
        .encrypt_data(encrypt_data)
        .encrypt_model(encrypt_model)
        .pack_data(false)
        .build()
        .unwrap();
    let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
    let mut exe = backend.compile(b.build().unwrap()).unwrap();
    let input = exe.input_tensor(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let out = exe.call(vec![input]).unwrap();

    assert_eq!(out[0].is_plaintext(), !encrypt_data && !encrypt_model);
    assert_close(&out[0].read(exe.scheme()).unwrap(), &[1.0, 2.0, 3.0, 4.0], 1e-4);
}

macro_rules! add_zero_cases {
    ($($name:ident: $data:expr, $model:expr;)*) => {
        paste! {
            $(
                #[test]
                fn [<add_zero_ $name>]() {
                    add_zero($data, $model);
                }
            )*
        }
    };
}

add_zero_cases! {
    plain_plain: false, false;
    cipher_plain: true, false;
    plain_cipher: false, true;
    cipher_cipher: true, true;
}

#[test]
fn batched_dot_with_plain_weight() {
    let mut b = GraphBuilder::new();
    let x = b.parameter("x", vec![2, 1], ElementType::F64);
    let w = b.constant("w", vec![1, 1], ElementType::F64, vec![3.0]).unwrap();
    let y = b.dot(x, w, 1).unwrap();
    b.result(y).unwrap();

    let config = ExecutorConfig::builder().encrypt_data(true).build().unwrap();
    let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
    let mut exe = backend.compile(b.build().unwrap()).unwrap();
    let input = exe.input_tensor(0, &[1.0, 2.0]).unwrap();
    let out = exe.call(vec![input]).unwrap();

    assert!(out[0].is_packed());
    assert_eq!(out[0].batch_size(), 2);
    assert!(!out[0].pending_rescale());
    assert_close(&out[0].read(exe.scheme()).unwrap(), &[3.0, 6.0], 1e-3);
}

#[test]
fn eager_and_lazy_rescaling_agree() {
    let run = |lazy: bool| {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 3], ElementType::F64);
        let w = b
            .constant("w", vec![3, 1], ElementType::F64, vec![0.5, -1.0, 2.0])
            .unwrap();
        let y = b.dot(x, w, 1).unwrap();
        let z = b.add(y, y).unwrap();
        b.result(z).unwrap();
        let config = ExecutorConfig::builder()
            .encrypt_data(true)
            .lazy_rescaling(lazy)
            .build()
            .unwrap();
        let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
        let mut exe = backend.compile(b.build().unwrap()).unwrap();
        let input = exe
            .input_tensor(0, &[1.0, 2.0, 3.0, -1.0, 0.0, 4.0])
            .unwrap();
        let out = exe.call(vec![input]).unwrap();
        out[0].read(exe.scheme()).unwrap()
    };
    assert_close(&run(true), &[9.0, 15.0], 1e-3);
    assert_close(&run(false), &[9.0, 15.0], 1e-3);
}

fn scheme() -> SimulatedCkks {
    let s = SimulatedCkks::from_parameters(params()).unwrap();
    s.generate_keys().unwrap();
    s
}

#[test]
fn rescale_is_idempotent_and_stops_at_the_floor() {
    let s = scheme();
    let ct = s.encrypt(&[1.5], false).unwrap();
    let product = s.multiply_plain(&ct, &[2.0], false).unwrap();
    let top = s.chain_index(&product);

    let mut tensor = HeTensor::from_values(
        "p",
        ElementType::F64,
        vec![1],
        false,
        false,
        vec![HeValue::encrypted(product, false)],
    )
    .unwrap();
    tensor.set_pending_rescale(true);
    rescale_tensor(&s, &mut tensor).unwrap();
    rescale_tensor(&s, &mut tensor).unwrap();
    let HeValue::Ciphertext(c) = &tensor.data()[0] else {
        panic!("expected a ciphertext");
    };
    let rescaled = c.as_encrypted().unwrap();
    assert_eq!(s.chain_index(rescaled), top - 1);
    assert_close(&tensor.read(&s).unwrap(), &[3.0], 1e-3);

    // Nothing left to rescale at nominal scale.
    assert_eq!(rescale_values(&s, tensor.data_mut()).unwrap(), 0);

    let mut bottom = s.encrypt(&[1.0], false).unwrap();
    s.mod_switch_to(&mut bottom, 0).unwrap();
    let err = s.rescale_to_next(&mut bottom).unwrap_err();
    assert!(matches!(
        err,
        HeError::Precision {
            source: PrecisionError::RescaleBelowFloor
        }
    ));
}

#[test]
fn unmatched_scales_are_reported() {
    let s = scheme();
    let a = s.encrypt(&[1.0], false).unwrap();
    let mut product = s.multiply_plain(&a, &[2.0], false).unwrap();
    let err = match_scale(&s, &a, &mut product).unwrap_err();
    assert!(matches!(
        err,
        HeError::Precision {
            source: PrecisionError::ScaleMismatch { .. }
        }
    ));
    assert!(s.add(&a, &product).is_err());
}

#[test]
fn oversized_values_are_refused() {
    let s = scheme();
    let err = s.encrypt(&[1e40], false).unwrap_err();
    assert!(matches!(
        err,
        HeError::Precision {
            source: PrecisionError::ValueTooLarge { .. }
        }
    ));
}

#[test]
fn constants_follow_the_model_policy_under_packing() {
    let graph = || {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 2], ElementType::F64);
        let c = b
            .constant("c", vec![2, 2], ElementType::F64, vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let y = b.add(x, c).unwrap();
        b.result(y).unwrap();
        b.build().unwrap()
    };

    // A plaintext constant is packed on the fly to meet the packed input.
    let config = ExecutorConfig::builder().encrypt_data(true).build().unwrap();
    let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
    let mut exe = backend.compile(graph()).unwrap();
    let input = exe.input_tensor(0, &[10.0, 20.0, 30.0, 40.0]).unwrap();
    let out = exe.call(vec![input]).unwrap();
    assert!(out[0].is_packed() && out[0].is_ciphertext());
    assert_close(&out[0].read(exe.scheme()).unwrap(), &[11.0, 22.0, 33.0, 44.0], 1e-3);

    // An encrypted constant stays unpacked and cannot meet a packed operand.
    let config = ExecutorConfig::builder()
        .encrypt_data(true)
        .encrypt_model(true)
        .build()
        .unwrap();
    let backend = HeBackend::<SimulatedCkks>::new(params(), config).unwrap();
    let mut exe = backend.compile(graph()).unwrap();
    let input = exe.input_tensor(0, &[10.0, 20.0, 30.0, 40.0]).unwrap();
    let err = exe.call(vec![input]).unwrap_err();
    assert!(matches!(err, HeError::UnsupportedCombination { .. }));
}
