use super::*;
use approx::assert_relative_eq;
use ndarray::{arr1, arr2, Array2, Array3, Axis, IxDyn};
use std::str::FromStr;

fn conv(name: &str) -> LayerSpec {
    LayerSpec::conv2d(name, Array4::zeros((1, 1, 1, 1)), None, (1, 1), (0, 0), (1, 1))
}

fn dense(name: &str) -> LayerSpec {
    LayerSpec::linear(name, Array2::zeros((1, 1)), None)
}

fn reshape_of(specs: &[LayerSpec]) -> Option<usize> {
    ConvertedModel::from_layers(specs, &[1, 1, 1], true)
        .unwrap()
        .reshape_index()
}

fn tiny_model() -> ConvertedModel {
    ConvertedModel::from_layers(&tiny_cnn(), &[1, 4, 4], true).unwrap()
}

fn sample() -> ndarray::ArrayD<f32> {
    Array3::from_shape_fn((1, 4, 4), |(_, i, j)| (i * 4 + j) as f32 / 16.0).into_dyn()
}

#[test]
fn test_reshape_after_conv_relu() {
    let specs = [conv("c"), LayerSpec::relu("r"), dense("d")];
    assert_eq!(reshape_of(&specs), Some(2));
}

#[test]
fn test_reshape_directly_after_conv() {
    assert_eq!(reshape_of(&[conv("c"), dense("d")]), Some(1));
}

#[test]
fn test_no_reshape_without_conv() {
    let mlp = [dense("d1"), LayerSpec::relu("r"), dense("d2")];
    assert_eq!(reshape_of(&mlp), None);
    assert_eq!(reshape_of(&[LayerSpec::relu("r"), dense("d")]), None);
    // the first layer must not look back past the start
    assert_eq!(reshape_of(&[dense("d"), conv("c")]), None);
}

#[test]
fn test_reshape_picks_first_dense_after_conv() {
    let specs = [
        conv("c1"),
        LayerSpec::relu("r1"),
        conv("c2"),
        LayerSpec::relu("r2"),
        dense("d1"),
        LayerSpec::relu("r3"),
        dense("d2"),
    ];
    assert_eq!(reshape_of(&specs), Some(4));
}

#[test]
fn test_conversion_rejects_unsupported_layer() {
    let specs = [conv("c"), LayerSpec::new("pool", LayerType::MaxPool2d), dense("d")];
    let err = ConvertedModel::from_layers(&specs, &[1, 1, 1], true).unwrap_err();
    assert!(matches!(err, ZetaError::UnsupportedLayer(ref msg) if msg.contains("pool")));
}

#[test]
fn test_conversion_rejects_channels_last_and_empty_shape() {
    assert!(matches!(
        ConvertedModel::from_layers(&tiny_cnn(), &[4, 4, 1], false),
        Err(ZetaError::InvalidConfig(_))
    ));
    assert!(matches!(
        ConvertedModel::from_layers(&tiny_cnn(), &[], true),
        Err(ZetaError::InvalidInput(_))
    ));
}

#[test]
fn test_from_network() {
    let model = ConvertedModel::from_network(&TinyNet::new()).unwrap();
    assert_eq!(model.len(), 3);
    assert_eq!(model.input_shape(), &[1, 4, 4]);
    assert_eq!(model.reshape_index(), Some(2));
    let kinds: Vec<_> = model.layers().iter().map(|l| l.kind()).collect();
    assert_eq!(kinds, ["ZonoConv2d", "ZonoReLU", "ZonoDense"]);
}

#[test]
fn test_forward_mode_parsing() {
    assert_eq!(ForwardMode::from_str("concrete").unwrap(), ForwardMode::Concrete);
    assert_eq!(ForwardMode::from_str("abstract").unwrap(), ForwardMode::Abstract);
    assert!(matches!(
        ForwardMode::from_str("Abstract"),
        Err(ZetaError::InvalidForwardMode(_))
    ));
    assert_eq!(ForwardMode::default(), ForwardMode::Abstract);
    assert_eq!(ForwardMode::Concrete.to_string(), "concrete");
}

#[test]
fn test_abstract_forward_needs_error_terms() {
    let model = tiny_model();
    let batch = sample().insert_axis(Axis(0));
    assert!(matches!(
        model.forward(batch.view(), None),
        Err(ZetaError::InvalidForwardMode(_))
    ));
}

#[test]
fn test_concrete_mode_forward() {
    let mut model = tiny_model();
    model.set_forward_mode(ForwardMode::Concrete);
    let batch = ndarray::stack![Axis(0), sample(), sample().mapv(|v| 1.0 - v)];
    let out = model
        .forward(batch.view(), None)
        .unwrap()
        .into_concrete()
        .unwrap();
    assert_eq!(out.shape(), &[2, 3]);
    let direct = model.concrete_forward(batch.view()).unwrap();
    assert_eq!(out, direct);
}

#[test]
fn test_abstract_center_without_noise_matches_concrete() {
    let model = tiny_model();
    let x = sample();
    let ball = Zonotope::from_linf_ball(x.view(), 0.0).unwrap();
    let center = x.view().insert_axis(Axis(0));
    let out = model
        .forward(center.view(), Some(ball.error_terms()))
        .unwrap()
        .into_zonotope()
        .unwrap();
    // no dimension crosses zero, so no fresh terms
    assert_eq!(out.num_error_terms(), 16);
    let concrete = model.concrete_forward(center).unwrap();
    for (a, c) in out.center().iter().zip(concrete.iter()) {
        assert_relative_eq!(*a, *c, epsilon = 1e-5);
    }
}

#[test]
fn test_abstract_forward_rejects_wrong_shape() {
    let model = tiny_model();
    let x = ndarray::ArrayD::<f32>::zeros(IxDyn(&[1, 5, 5]));
    let z = Zonotope::from_linf_ball(x.view(), 0.1).unwrap();
    assert!(matches!(
        model.abstract_forward(&z),
        Err(ZetaError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_layer_failure_is_wrapped() {
    let mut specs = tiny_cnn();
    specs[2] = LayerSpec::linear("fc1", Array2::zeros((3, 7)), None);
    let model = ConvertedModel::from_layers(&specs, &[1, 4, 4], true).unwrap();
    let batch = sample().insert_axis(Axis(0));
    match model.concrete_forward(batch.view()) {
        Err(ZetaError::LayerError {
            layer_index,
            layer_type,
            source,
        }) => {
            assert_eq!(layer_index, 2);
            assert_eq!(layer_type, "ZonoDense");
            assert!(matches!(*source, ZetaError::ShapeMismatch { .. }));
        }
        other => panic!("expected a layer error, got {:?}", other),
    }
}

#[test]
fn test_predict_class() {
    let identity = [LayerSpec::linear("fc", arr2(&[[1.0, 0.0], [0.0, 1.0]]), None)];
    let model = ConvertedModel::from_layers(&identity, &[2], true).unwrap();
    assert_eq!(model.predict_class(arr1(&[0.1_f32, 0.9]).into_dyn().view()).unwrap(), 1);
    assert_eq!(model.predict_class(arr1(&[0.7_f32, 0.2]).into_dyn().view()).unwrap(), 0);
    assert!(model.predict_class(arr1(&[0.1_f32, 0.2, 0.3]).into_dyn().view()).is_err());

    let cnn = tiny_model();
    let x = sample();
    let logits = cnn.concrete_forward(x.view().insert_axis(Axis(0))).unwrap();
    let expected = logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(cnn.predict_class(x.view()).unwrap(), expected);
}

#[test]
fn test_layer_summary_marks_reshape() {
    let summary = tiny_model().layer_summary();
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("  0  ZonoConv2d"));
    assert!(lines[0].ends_with("conv1"));
    assert!(lines[2].contains("reshape"));
    assert!(lines[3].starts_with("  2  ZonoDense"));
}
