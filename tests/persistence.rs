//! Integration tests for saving and loading weights.

use rustyunit::nn::{input_with, Dense, DenseConfig};
use rustyunit::serialization::{load_weights, save_weights, MemoryStore, SafeTensorsStore, WeightKey, WeightStore};
use rustyunit::{DType, Graph, Invoke, Shape, Tensor, Unit, UnitOptions, UnitRegistry};

use ndarray::{ArrayD, IxDyn};
use std::path::PathBuf;
use std::sync::Arc;

fn mlp(prefix: &str, use_bias: bool) -> Arc<Graph> {
    let options = |suffix: &str| UnitOptions::new().with_name(&format!("{}_{}", prefix, suffix));
    let x = input_with(Shape::batched(&[3]), DType::F32, options("in")).unwrap();
    let h = Dense::new(DenseConfig::new(5).with_bias(use_bias).with_options(options("hidden")))
        .unwrap()
        .apply(&x)
        .unwrap();
    let y = Dense::new(DenseConfig::new(2).with_options(options("head")))
        .unwrap()
        .apply(&h)
        .unwrap();
    Graph::assemble(x, y, Some(prefix)).unwrap()
}

fn batch() -> Tensor {
    let data: Vec<f32> = (0..6).map(|i| i as f32 - 2.5).collect();
    Tensor::from(ArrayD::from_shape_vec(IxDyn(&[2, 3]), data).unwrap())
}

fn scratch_file(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rustyunit-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

#[test]
fn store_keys_follow_unit_names_and_positions() {
    let graph = mlp("keys", true);
    let mut store = MemoryStore::new();
    assert_eq!(save_weights(graph.as_ref(), &mut store).unwrap(), 4);

    let keys: Vec<String> = store.keys().map(WeightKey::to_string).collect();
    assert_eq!(keys, vec!["keys_head/0", "keys_head/1", "keys_hidden/0", "keys_hidden/1"]);
    assert_eq!(store.count_for("keys_in"), 0);
}

#[test]
fn safetensors_file_round_trip() {
    let graph = mlp("file", true);
    let path = scratch_file("file.safetensors");

    let mut store = SafeTensorsStore::new();
    save_weights(graph.as_ref(), &mut store).unwrap();
    store.save(&path).unwrap();

    let desc = graph.describe().unwrap();
    let copy = Graph::reconstruct(&desc, &UnitRegistry::with_builtins()).unwrap();
    let reopened = SafeTensorsStore::open(&path).unwrap();
    assert_eq!(load_weights(copy.as_ref(), &reopened).unwrap(), 4);

    let expected = graph.apply(&batch()).unwrap();
    let actual = copy.apply(&batch()).unwrap();
    assert_eq!(expected.value(), actual.value());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn weight_count_mismatch_is_state_error() {
    let with_bias = mlp("count", true);
    let without_bias = mlp("count", false);
    without_bias.apply(&batch()).unwrap();

    let mut store = MemoryStore::new();
    save_weights(with_bias.as_ref(), &mut store).unwrap();
    let err = load_weights(without_bias.as_ref(), &store).unwrap_err();
    assert!(err.is_state(), "{}", err);
    assert!(err.to_string().contains("count_hidden"));
}

#[test]
fn shape_mismatch_is_state_error() {
    let graph = mlp("shape", true);
    let mut store = MemoryStore::new();
    save_weights(graph.as_ref(), &mut store).unwrap();
    let before: Vec<_> = graph.core().get_weights().iter().map(|v| v.to_f64()).collect();

    // The hidden unit loads before the head, so its new kernel would be
    // written first if loading were not staged.
    store
        .put(
            WeightKey::new("shape_hidden", 0),
            rustyunit::Value::filled(&[3, 5], 4.0, DType::F32),
        )
        .unwrap();
    store
        .put(
            WeightKey::new("shape_head", 0),
            rustyunit::Value::zeros(&[7, 7], DType::F32),
        )
        .unwrap();
    let err = load_weights(graph.as_ref(), &store).unwrap_err();
    assert!(err.is_state());
    assert!(err.to_string().contains("shape_head"), "{}", err);

    let after: Vec<_> = graph.core().get_weights().iter().map(|v| v.to_f64()).collect();
    assert_eq!(before, after);
}

#[test]
fn loading_casts_to_the_parameter_dtype() {
    let graph = mlp("cast", true);
    let mut store = MemoryStore::new();
    save_weights(graph.as_ref(), &mut store).unwrap();
    let keys: Vec<WeightKey> = store.keys().cloned().collect();
    for key in keys {
        let wide = store.get(&key).unwrap().unwrap().cast(DType::F64);
        store.put(key, wide).unwrap();
    }
    load_weights(graph.as_ref(), &store).unwrap();
    for w in graph.core().weights() {
        assert_eq!(w.dtype(), DType::F32);
    }
}
