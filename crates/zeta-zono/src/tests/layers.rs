use super::*;
use approx::assert_relative_eq;
use ndarray::{arr1, arr2, Array3, ArrayD, Axis, IxDyn};

fn naive_conv(x: &Array4<f32>, layer: &ZonoConv2d) -> Array4<f32> {
    let (n, c_in, h, w) = x.dim();
    let (c_out, _, kh, kw) = layer.weight.dim();
    let (oh, ow) = layer.output_hw(h, w).unwrap();
    Array4::from_shape_fn((n, c_out, oh, ow), |(b, o, y, xx)| {
        let mut acc = layer.bias[o];
        for c in 0..c_in {
            for ky in 0..kh {
                for kx in 0..kw {
                    let iy = (y * layer.stride.0 + ky * layer.dilation.0) as isize
                        - layer.padding.0 as isize;
                    let ix = (xx * layer.stride.1 + kx * layer.dilation.1) as isize
                        - layer.padding.1 as isize;
                    if iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w {
                        acc += layer.weight[[o, c, ky, kx]] * x[[b, c, iy as usize, ix as usize]];
                    }
                }
            }
        }
        acc
    })
}

fn strided_conv() -> ZonoConv2d {
    let weight = Array4::from_shape_fn((3, 2, 3, 2), |(o, c, i, j)| {
        (o as f32 - 1.0) * 0.3 + c as f32 * 0.2 - i as f32 * 0.1 + j as f32 * 0.05
    });
    ZonoConv2d::new(weight, Some(arr1(&[0.1, 0.0, -0.1])), (2, 1), (1, 2), (2, 1)).unwrap()
}

#[test]
fn test_dense_concrete() {
    let dense = ZonoDense::new(arr2(&[[1.0, 2.0], [-1.0, 0.5]]), Some(arr1(&[0.5, -0.5]))).unwrap();
    let x = arr2(&[[1.0_f32, 1.0], [0.0, 2.0]]).into_dyn();
    let y = dense.concrete_forward(x.view()).unwrap();
    assert_eq!(y, arr2(&[[3.5_f32, -1.0], [4.5, 0.5]]).into_dyn());
}

#[test]
fn test_dense_bias_only_on_center() {
    let dense = ZonoDense::new(arr2(&[[2.0, 0.0]]), Some(arr1(&[10.0]))).unwrap();
    let z = Zonotope::new(arr2(&[[1.0_f32, 1.0], [0.5, 0.0], [0.0, 3.0]]).into_dyn()).unwrap();
    let out = dense.abstract_forward(&z).unwrap();
    assert_eq!(out.stacked(), &arr2(&[[12.0_f32], [1.0], [0.0]]).into_dyn());
}

#[test]
fn test_dense_rejects_wrong_width() {
    let dense = ZonoDense::new(Array2::zeros((2, 3)), None).unwrap();
    let x = Array2::<f32>::zeros((1, 4)).into_dyn();
    assert!(matches!(
        dense.concrete_forward(x.view()),
        Err(ZetaError::ShapeMismatch { .. })
    ));
    let x = Array3::<f32>::zeros((1, 1, 3)).into_dyn();
    assert!(matches!(
        dense.concrete_forward(x.view()),
        Err(ZetaError::InvalidInput(_))
    ));
    assert!(ZonoDense::new(Array2::zeros((2, 3)), Some(arr1(&[1.0]))).is_err());
}

#[test]
fn test_conv_matches_direct_loop() {
    let layer = strided_conv();
    let x = Array4::from_shape_fn((2, 2, 7, 6), |(n, c, i, j)| {
        ((n * 13 + c * 7 + i * 3 + j) % 9) as f32 / 9.0 - 0.4
    });
    let got = layer.concrete_forward(x.view().into_dyn()).unwrap();
    let expected = naive_conv(&x, &layer).into_dyn();
    assert_eq!(got.shape(), expected.shape());
    for (g, e) in got.iter().zip(expected.iter()) {
        assert_relative_eq!(*g, *e, epsilon = 1e-5);
    }
}

#[test]
fn test_conv_output_size() {
    let layer = strided_conv();
    // h: (7 + 2 - 5) / 2 + 1 = 3, w: (6 + 4 - 2) / 1 + 1 = 9
    assert_eq!(layer.output_hw(7, 6).unwrap(), (3, 9));
    let big = ZonoConv2d::new(Array4::zeros((1, 1, 5, 5)), None, (1, 1), (0, 0), (1, 1)).unwrap();
    assert!(big.output_hw(3, 3).is_err());
    assert!(ZonoConv2d::new(Array4::zeros((1, 1, 1, 1)), None, (0, 1), (0, 0), (1, 1)).is_err());
}

#[test]
fn test_conv_rejects_zero_step_set_after_construction() {
    let mut layer = strided_conv();
    layer.stride = (0, 1);
    assert!(matches!(layer.output_hw(7, 6), Err(ZetaError::InvalidConfig(_))));
    let x = Array4::<f32>::zeros((1, 2, 7, 6)).into_dyn();
    assert!(matches!(
        layer.concrete_forward(x.view()),
        Err(ZetaError::InvalidConfig(_))
    ));

    let mut layer = strided_conv();
    layer.dilation = (1, 0);
    let ball = Zonotope::from_linf_ball(
        Array3::<f32>::zeros((2, 7, 6)).insert_axis(Axis(0)).view().into_dyn(),
        0.1,
    )
    .unwrap();
    assert!(layer.abstract_forward(&ball).is_err());
}

#[test]
fn test_conv_rejects_channel_mismatch() {
    let layer = strided_conv();
    let x = Array4::<f32>::zeros((1, 3, 7, 6)).into_dyn();
    assert!(matches!(
        layer.concrete_forward(x.view()),
        Err(ZetaError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_linear_layers_center_matches_concrete() {
    let conv = strided_conv();
    let center = Array3::from_shape_fn((2, 7, 6), |(c, i, j)| (c + i * j) as f32 / 20.0).into_dyn();
    let z = Zonotope::from_linf_ball(center.view(), 0.05).unwrap();

    let abstract_out = conv.abstract_forward(&z).unwrap();
    let concrete_out = conv
        .concrete_forward(center.view().insert_axis(Axis(0)))
        .unwrap();
    assert_eq!(abstract_out.num_error_terms(), z.num_error_terms());
    for (a, c) in abstract_out.center().iter().zip(concrete_out.iter()) {
        assert_relative_eq!(*a, *c, epsilon = 1e-5);
    }

    let flat = abstract_out.reshape_rows().unwrap();
    let width = flat.value_shape()[0];
    let dense = ZonoDense::new(
        Array2::from_shape_fn((4, width), |(r, c)| ((r + c) % 3) as f32 - 1.0),
        Some(arr1(&[1.0, 2.0, 3.0, 4.0])),
    )
    .unwrap();
    let dense_abstract = dense.abstract_forward(&flat).unwrap();
    let flat_concrete = concrete_out.to_shape(IxDyn(&[1, width])).unwrap().into_owned();
    let dense_concrete = dense.concrete_forward(flat_concrete.view()).unwrap();
    for (a, c) in dense_abstract.center().iter().zip(dense_concrete.iter()) {
        assert_relative_eq!(*a, *c, epsilon = 1e-4);
    }
}

#[test]
fn test_conv_error_terms_have_no_bias() {
    let conv = strided_conv();
    let center = ArrayD::<f32>::zeros(IxDyn(&[2, 7, 6]));
    let error_terms = ArrayD::<f32>::zeros(IxDyn(&[3, 2, 7, 6]));
    let z = Zonotope::from_parts(center.view(), error_terms.view()).unwrap();
    let out = conv.abstract_forward(&z).unwrap();
    assert!(out.error_terms().iter().all(|v| *v == 0.0));
    assert_relative_eq!(out.center()[[0, 1, 1]], 0.1);
    assert_relative_eq!(out.center()[[2, 1, 1]], -0.1);
}

#[test]
fn test_relu_concrete() {
    let x = arr2(&[[-1.0_f32, 0.0, 2.5]]).into_dyn();
    let y = ZonoReLU.concrete_forward(x.view()).unwrap();
    assert_eq!(y, arr2(&[[0.0_f32, 0.0, 2.5]]).into_dyn());
}

#[test]
fn test_relu_three_cases() {
    // dims: stably positive, stably negative, crossing
    let z = Zonotope::new(
        arr2(&[[2.0_f32, -2.0, 0.0], [0.5, 0.5, 1.0], [0.5, -1.0, 0.0]]).into_dyn(),
    )
    .unwrap();
    let out = ZonoReLU.abstract_forward(&z).unwrap();
    assert_eq!(out.num_error_terms(), 3);

    let s = out.stacked();
    // positive: untouched
    assert_eq!(s[[0, 0]], 2.0);
    assert_eq!(s[[1, 0]], 0.5);
    assert_eq!(s[[3, 0]], 0.0);
    // negative: zeroed
    assert!((0..4).all(|r| s[[r, 1]] == 0.0));
    // crossing with l = -1, u = 1: lambda = 0.5, mu = -lambda * l / 2 = 0.25
    assert_relative_eq!(s[[0, 2]], 0.25);
    assert_relative_eq!(s[[1, 2]], 0.5);
    assert_relative_eq!(s[[3, 2]], 0.25);
}

#[test]
fn test_relu_unit_interval_is_covered() {
    let z = Zonotope::new(arr2(&[[0.0_f32], [1.0]]).into_dyn()).unwrap();
    let out = ZonoReLU.abstract_forward(&z).unwrap();
    let bound = out.interval_bounds()[0];
    assert!(bound.lower <= 0.0);
    assert!(bound.upper >= 1.0);
    // 0.25 + 0.5 e1 + 0.25 e2
    assert_relative_eq!(bound.lower, -0.5);
    assert_relative_eq!(bound.upper, 1.0);
}

#[test]
fn test_relu_keeps_value_shape_and_term_order() {
    let center = Array3::from_shape_fn((2, 2, 2), |(c, i, j)| {
        if (c + i + j) % 2 == 0 {
            0.1
        } else {
            3.0
        }
    })
    .into_dyn();
    let z = Zonotope::from_linf_ball(center.view(), 0.5).unwrap();
    let out = ZonoReLU.abstract_forward(&z).unwrap();
    assert_eq!(out.value_shape(), &[2, 2, 2]);
    // 4 crossing dims get fresh terms after the 8 existing ones
    assert_eq!(out.num_error_terms(), 12);
    let fresh = out.error_terms().index_axis(Axis(0), 8).to_owned();
    assert!(fresh[[0, 0, 0]] > 0.0);
    assert_eq!(fresh.iter().filter(|v| **v != 0.0).count(), 1);
}

#[test]
fn test_from_spec_copies_weights() {
    let specs = tiny_cnn();
    match AbstractLayer::from_spec(&specs[2]).unwrap() {
        AbstractLayer::Dense(d) => {
            assert_eq!(Some(d.weight.clone().into_dyn()), specs[2].weight);
            assert_eq!(d.bias, arr1(&[0.0, 0.5, -0.5]));
        }
        other => panic!("expected dense layer, got {:?}", other.kind()),
    }
    match AbstractLayer::from_spec(&specs[0]).unwrap() {
        AbstractLayer::Conv2d(c) => {
            assert_eq!(Some(c.weight.clone().into_dyn()), specs[0].weight);
            assert_eq!(c.stride, (1, 1));
            assert_eq!(c.padding, (0, 0));
        }
        other => panic!("expected conv layer, got {:?}", other.kind()),
    }
}

#[test]
fn test_from_spec_missing_bias_defaults_to_zero() {
    let spec = LayerSpec::linear("fc", arr2(&[[1.0, 1.0]]), None);
    match AbstractLayer::from_spec(&spec).unwrap() {
        AbstractLayer::Dense(d) => assert_eq!(d.bias, arr1(&[0.0])),
        other => panic!("expected dense layer, got {:?}", other.kind()),
    }
}

#[test]
fn test_from_spec_rejects_unsupported() {
    for layer_type in [LayerType::MaxPool2d, LayerType::Flatten, LayerType::Other("Lstm".into())] {
        let spec = LayerSpec::new("x", layer_type);
        assert!(matches!(
            AbstractLayer::from_spec(&spec),
            Err(ZetaError::UnsupportedLayer(_))
        ));
    }
    let no_weight = LayerSpec::new("fc", LayerType::Linear);
    assert!(AbstractLayer::from_spec(&no_weight).is_err());
}
