//! Integration tests for assembling, replaying and describing graphs.

use rustyunit::graph::{EdgeRef, InvocationEntry, UnitEntry};
use rustyunit::nn::{input, Add, Concatenate, Dense, DenseConfig, Dropout, DropoutConfig, Relu};
use rustyunit::serialization::{load_weights, save_weights, MemoryStore};
use rustyunit::{
    CallArgs, CallContext, Graph, GraphDescription, InputRef, Invoke, Nest, Result, Shape, Tensor,
    Unit, UnitCore, UnitOptions, UnitRegistry, TRAINING,
};

use approx::assert_abs_diff_eq;
use ndarray::{ArrayD, IxDyn};
use petgraph::algo::toposort;
use std::collections::HashMap;
use std::sync::Arc;

fn named(name: &str) -> UnitOptions {
    UnitOptions::new().with_name(name)
}

fn dense(units: usize, name: &str) -> Arc<Dense> {
    Dense::new(DenseConfig::new(units).with_seed(11).with_options(named(name))).unwrap()
}

fn ramp(dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| (i as f32) * 0.1 - 0.3).collect();
    Tensor::from(ArrayD::from_shape_vec(IxDyn(dims), data).unwrap())
}

fn values(t: &Tensor) -> Vec<f64> {
    t.value().unwrap().to_f64().iter().copied().collect()
}

/// `x -> stem -> (left, right) -> sum`
fn diamond(prefix: &str) -> Arc<Graph> {
    let x = rustyunit::nn::input_with(
        Shape::batched(&[4]),
        rustyunit::DType::F32,
        named(&format!("{}_in", prefix)),
    )
    .unwrap();
    let h = dense(6, &format!("{}_stem", prefix)).apply(&x).unwrap();
    let left = dense(3, &format!("{}_left", prefix)).apply(&h).unwrap();
    let right = dense(3, &format!("{}_right", prefix)).apply(&h).unwrap();
    let sum = Add::new(named(&format!("{}_sum", prefix)))
        .unwrap()
        .invoke(vec![left, right])
        .unwrap();
    Graph::assemble(x, sum, Some(prefix)).unwrap()
}

/// `(a, b) -> shared x applied to each -> concatenate -> y`
fn shared_diamond(prefix: &str) -> Arc<Graph> {
    let input_named = |suffix: &str| {
        rustyunit::nn::input_with(
            Shape::batched(&[4]),
            rustyunit::DType::F32,
            named(&format!("{}_{}", prefix, suffix)),
        )
        .unwrap()
    };
    let a = input_named("a");
    let b = input_named("b");
    let x = dense(5, &format!("{}_x", prefix));
    let xa = x.apply(&a).unwrap();
    let xb = x.apply(&b).unwrap();
    let joined = Concatenate::new(-1, named(&format!("{}_cat", prefix)))
        .unwrap()
        .invoke(vec![xa, xb])
        .unwrap();
    let y = dense(2, &format!("{}_y", prefix))
        .invoke(joined)
        .unwrap();
    Graph::assemble(vec![a, b], y, Some(prefix)).unwrap()
}

fn execution_order(graph: &Graph) -> Vec<(String, usize)> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    graph
        .nodes()
        .iter()
        .map(|n| {
            let name = n.unit().core().name().to_string();
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            (name, *count - 1)
        })
        .collect()
}

/// Adds the mean of its input as a loss on every call; has no shape rule.
struct MeanPenalty {
    core: UnitCore,
}

impl Unit for MeanPenalty {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        "MeanPenalty"
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        for t in inputs.flatten() {
            self.core.add_loss(rustyunit::ops::mean_all(t));
        }
        Ok(inputs.clone())
    }
}

#[test]
fn records_are_in_dependency_order() {
    let graph = diamond("order");
    let mut position = HashMap::new();
    for (i, node) in graph.nodes().iter().enumerate() {
        position.insert(node.id(), i);
    }
    for (i, node) in graph.nodes().iter().enumerate() {
        for (upstream, _) in node.upstream() {
            assert!(position[&upstream.id()] < i, "{:?} runs before its input", node);
        }
    }
    assert!(toposort(&graph.to_petgraph(), None).is_ok());

    let names: Vec<&str> = graph.units().iter().map(|u| u.core().name()).collect();
    assert_eq!(names, vec!["order_in", "order_stem", "order_left", "order_right", "order_sum"]);
    assert_eq!(graph.depths()["order_sum"], 3);
}

#[test]
fn graph_replays_like_the_units() {
    let x = input(&[4]).unwrap();
    let a = dense(3, "replay_a");
    let relu = Relu::new(UnitOptions::new()).unwrap();
    let y = relu.apply(&a.apply(&x).unwrap()).unwrap();
    let graph = Graph::assemble(x, y, None).unwrap();

    let batch = ramp(&[2, 4]);
    let direct = relu.apply(&a.apply(&batch).unwrap()).unwrap();
    let replayed = graph.apply(&batch).unwrap();
    for (p, q) in values(&direct).iter().zip(values(&replayed)) {
        assert_abs_diff_eq!(*p, q, epsilon = 1e-6);
    }
    assert_eq!(graph.core().count_params(), 4 * 3 + 3);
}

#[test]
fn output_shape_matches_execution() {
    let x1 = input(&[4]).unwrap();
    let x2 = input(&[6]).unwrap();
    let joined = Concatenate::new(-1, UnitOptions::new())
        .unwrap()
        .invoke(vec![x1.clone(), x2.clone()])
        .unwrap()
        .into_flat()
        .remove(0);
    let o1 = dense(3, "shape_o1").apply(&joined).unwrap();
    let activated = Relu::new(UnitOptions::new()).unwrap().apply(&joined).unwrap();
    let o2 = dense(2, "shape_o2").apply(&activated).unwrap();
    let graph = Graph::assemble(vec![x1, x2], vec![o1, o2], None).unwrap();

    let predicted = graph
        .output_shape(&Nest::list(vec![Shape::known(&[5, 4]), Shape::known(&[5, 6])]))
        .unwrap();
    let outputs = graph.invoke(vec![ramp(&[5, 4]), ramp(&[5, 6])]).unwrap();
    let actual = outputs.map(Tensor::shape);
    assert_eq!(predicted, actual);
    assert_eq!(actual, Nest::list(vec![Shape::known(&[5, 3]), Shape::known(&[5, 2])]));

    let symbolic = graph
        .output_shape(&Nest::list(vec![Shape::batched(&[4]), Shape::batched(&[6])]))
        .unwrap();
    assert_eq!(symbolic, Nest::list(vec![Shape::batched(&[3]), Shape::batched(&[2])]));
}

#[test]
fn output_shape_does_not_add_losses() {
    let x = input(&[3]).unwrap();
    let penalty = Arc::new(MeanPenalty {
        core: UnitCore::new("MeanPenalty", UnitOptions::new()).unwrap().prebuilt(),
    });
    let y = penalty.apply(&x).unwrap();
    let graph = Graph::assemble(x, y, None).unwrap();
    let before = penalty.core().loss_origins();
    assert_eq!(before.len(), 1);

    for _ in 0..3 {
        let shape = graph.output_shape(&Nest::Leaf(Shape::batched(&[3]))).unwrap();
        assert_eq!(shape, Nest::Leaf(Shape::batched(&[3])));
    }
    assert_eq!(penalty.core().loss_origins(), before);
    assert_eq!(graph.core().losses().len(), 1);
}

#[test]
fn redundant_inputs_are_rejected() {
    let x = input(&[2]).unwrap();
    let y = dense(2, "redundant_d").apply(&x).unwrap();
    let err = Graph::assemble(vec![x.clone(), x], y, None).err().unwrap();
    assert!(err.is_usage());
    assert!(err.to_string().contains("redundant"));
}

#[test]
fn unused_input_is_disconnected() {
    let x1 = input(&[2]).unwrap();
    let x2 = input(&[2]).unwrap();
    let y = dense(2, "unused_d").apply(&x1).unwrap();
    let err = Graph::assemble(vec![x1, x2], y, None).err().unwrap();
    assert!(err.is_usage());
    assert!(err.to_string().contains("graph disconnected"));
}

#[test]
fn missing_input_is_disconnected() {
    let x1 = input(&[2]).unwrap();
    let x2 = input(&[2]).unwrap();
    let y = Add::new(UnitOptions::new())
        .unwrap()
        .invoke(vec![x1.clone(), x2])
        .unwrap();
    let err = Graph::assemble(x1, y, None).err().unwrap();
    assert!(err.to_string().contains("graph disconnected"), "{}", err);
}

#[test]
fn duplicate_unit_names_are_rejected() {
    let x = input(&[2]).unwrap();
    let h = dense(2, "twin").apply(&x).unwrap();
    let y = dense(2, "twin").apply(&h).unwrap();
    let err = Graph::assemble(x, y, None).err().unwrap();
    assert!(err.is_usage());
    assert!(err.to_string().contains("twin"));
}

#[test]
fn unit_lookup_errors_name_the_problem() {
    let graph = diamond("lookup");
    assert_eq!(graph.get_unit("lookup_left").unwrap().class_name(), "Dense");
    let err = graph.get_unit("nope").err().unwrap();
    assert!(err.to_string().contains("No such unit: nope"));
    assert!(graph.unit_at(1).is_ok());
    let err = graph.unit_at(99).err().unwrap();
    assert!(err.to_string().contains("99"));
}

#[test]
fn graphs_nest_inside_graphs() {
    let inner = diamond("inner");
    let x = input(&[4]).unwrap();
    let y = inner.apply(&x).unwrap();
    let z = dense(1, "outer_head").apply(&y).unwrap();
    let outer = Graph::assemble(x, z, Some("outer")).unwrap();

    assert_eq!(outer.units().len(), 3);
    let out = outer.apply(&ramp(&[2, 4])).unwrap();
    assert_eq!(out.shape(), Shape::known(&[2, 1]));
    assert_eq!(
        outer.core().count_params(),
        inner.core().count_params() + 3 + 1
    );
}

#[test]
fn training_flag_reaches_units_inside_a_graph() {
    let x = input(&[64]).unwrap();
    let dropout = Dropout::new(DropoutConfig::new(0.5).with_seed(5)).unwrap();
    let y = dropout.apply(&x).unwrap();
    let graph = Graph::assemble(x, y, None).unwrap();

    let batch = Tensor::from(ArrayD::<f32>::ones(IxDyn(&[1, 64])));
    let inference = graph.apply(&batch).unwrap();
    assert!(values(&inference).iter().all(|&v| v == 1.0));

    let args = CallArgs::new().with_keyword(TRAINING, true);
    let training = graph.invoke_with(batch, &args).unwrap();
    let v = values(training.as_leaf().unwrap());
    assert!(v.iter().any(|&x| x == 0.0));
    assert!(v.iter().all(|&x| x == 0.0 || x == 2.0));
}

#[test]
fn description_round_trip() {
    let graph = diamond("rt");
    let desc = graph.describe().unwrap();
    assert_eq!(desc.units.len(), 5);
    assert_eq!(desc.outputs, vec![EdgeRef("rt_sum".into(), 0, 0)]);

    let text = desc.to_json().unwrap();
    let parsed = GraphDescription::from_json(&text).unwrap();
    let rebuilt = Graph::reconstruct(&parsed, &UnitRegistry::with_builtins()).unwrap();
    assert_eq!(rebuilt.describe().unwrap(), desc);

    let mut store = MemoryStore::new();
    save_weights(graph.as_ref(), &mut store).unwrap();
    load_weights(rebuilt.as_ref(), &store).unwrap();
    let batch = ramp(&[3, 4]);
    assert_eq!(
        values(&graph.apply(&batch).unwrap()),
        values(&rebuilt.apply(&batch).unwrap())
    );
}

#[test]
fn shared_unit_round_trip_keeps_wiring_and_order() {
    let graph = shared_diamond("sh");
    let desc = graph.describe().unwrap();

    let cat = desc.units.iter().find(|u| u.unit_name == "sh_cat").unwrap();
    assert_eq!(
        cat.inbound[0].edges,
        vec![EdgeRef("sh_x".into(), 0, 0), EdgeRef("sh_x".into(), 1, 0)]
    );
    let shared = desc.units.iter().find(|u| u.unit_name == "sh_x").unwrap();
    assert_eq!(shared.inbound.len(), 2);

    let parsed = GraphDescription::from_json(&desc.to_json().unwrap()).unwrap();
    let rebuilt = Graph::reconstruct(&parsed, &UnitRegistry::with_builtins()).unwrap();
    let names = |g: &Graph| -> Vec<String> {
        g.units().iter().map(|u| u.core().name().to_string()).collect()
    };
    assert_eq!(names(&graph), vec!["sh_a", "sh_b", "sh_x", "sh_cat", "sh_y"]);
    assert_eq!(names(&rebuilt), names(&graph));
    assert_eq!(execution_order(&rebuilt), execution_order(&graph));
    assert_eq!(rebuilt.describe().unwrap(), desc);

    let mut store = MemoryStore::new();
    save_weights(graph.as_ref(), &mut store).unwrap();
    load_weights(rebuilt.as_ref(), &store).unwrap();
    let batch = Nest::List(vec![Nest::Leaf(ramp(&[2, 4])), Nest::Leaf(ramp(&[2, 4]))]);
    let expected = graph.invoke(batch.clone()).unwrap();
    let actual = rebuilt.invoke(batch).unwrap();
    assert_eq!(
        values(expected.as_leaf().unwrap()),
        values(actual.as_leaf().unwrap())
    );
}

#[test]
fn constant_inputs_replay_but_cannot_be_described() {
    let x = input(&[3]).unwrap();
    let offset = Tensor::from(ArrayD::<f32>::ones(IxDyn(&[1, 3])));
    let sum = Add::new(named("const_sum"))
        .unwrap()
        .invoke(vec![x.clone(), offset])
        .unwrap();

    let node = sum.as_leaf().unwrap().history().unwrap().node.clone();
    let refs = node.input_refs().unwrap();
    assert!(matches!(&refs[0], InputRef::Upstream { slot: 0, .. }));
    assert!(matches!(&refs[1], InputRef::Constant(v) if v.dims() == vec![1, 3]));

    let graph = Graph::assemble(x, sum, None).unwrap();
    let out = graph.apply(&ramp(&[2, 3])).unwrap();
    assert_eq!(out.shape().dims(), &[Some(2), Some(3)]);
    let err = graph.describe().unwrap_err();
    assert!(err.is_usage());
    assert!(err.to_string().contains("constant"), "{}", err);
}

#[test]
fn nested_graph_description_round_trip() {
    let inner = diamond("nested_inner");
    let x = rustyunit::nn::input_with(Shape::batched(&[4]), rustyunit::DType::F32, named("nested_x"))
        .unwrap();
    let y = inner.apply(&x).unwrap();
    let outer = Graph::assemble(x, y, Some("nested_outer")).unwrap();

    let config = outer.config().unwrap();
    let rebuilt = Graph::from_config(&config, &UnitRegistry::with_builtins()).unwrap();
    assert_eq!(rebuilt.config().unwrap(), config);
}

#[test]
fn cyclic_description_is_rejected() {
    let edge = |unit: &str| InvocationEntry {
        edges: vec![EdgeRef(unit.into(), 0, 0)],
        structure: Nest::Leaf(()),
        args: serde_json::json!({ "positional": [], "keyword": {} }),
    };
    let dense_entry = |name: &str, from: &str| UnitEntry {
        unit_name: name.into(),
        unit_class: "Dense".into(),
        unit_config: dense(2, name).config().unwrap(),
        inbound: vec![edge(from)],
    };
    let input_entry = {
        let x = rustyunit::nn::input_with(Shape::batched(&[2]), rustyunit::DType::F32, named("cyc_in"))
            .unwrap();
        let unit = x.history().unwrap().node.unit().clone();
        UnitEntry {
            unit_name: "cyc_in".into(),
            unit_class: "Input".into(),
            unit_config: unit.config().unwrap(),
            inbound: Vec::new(),
        }
    };
    let desc = GraphDescription {
        name: "cyclic".into(),
        units: vec![input_entry, dense_entry("cyc_a", "cyc_b"), dense_entry("cyc_b", "cyc_a")],
        inputs: vec![EdgeRef("cyc_in".into(), 0, 0)],
        outputs: vec![EdgeRef("cyc_b".into(), 0, 0)],
        input_structure: Nest::Leaf(()),
        output_structure: Nest::Leaf(()),
    };
    let err = Graph::reconstruct(&desc, &UnitRegistry::with_builtins()).err().unwrap();
    assert!(err.is_usage(), "{}", err);
    assert!(err.to_string().contains("cyclic"));
}

#[test]
fn reconstruction_failures_name_the_unit() {
    let mut desc = diamond("broken").describe().unwrap();
    desc.units[1].unit_config.insert("units".into(), serde_json::json!(0));
    let err = Graph::reconstruct(&desc, &UnitRegistry::with_builtins()).err().unwrap();
    match err {
        rustyunit::UnitError::Serialization { class_name, unit, .. } => {
            assert_eq!(class_name, "Dense");
            assert_eq!(unit, "broken_stem");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn dot_export_lists_every_record() {
    let graph = diamond("dot");
    let dot = graph.to_dot();
    assert!(dot.starts_with("digraph"));
    for name in ["dot_in", "dot_stem", "dot_left", "dot_right", "dot_sum"] {
        assert!(dot.contains(name), "{} missing from {}", name, dot);
    }
}
