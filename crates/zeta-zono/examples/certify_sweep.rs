//! Example: sweep the L-inf radius around one input and report where DeepZ
//! stops certifying the prediction.
//!
//! Usage: RUST_LOG=debug cargo run -p zeta-zono --example certify_sweep

use ndarray::{Array1, Array2, Array3, Array4};
use zeta_zono::{ConvertedModel, DeepZCertifier, LayerSpec, Result};

fn edge_detector() -> Vec<LayerSpec> {
    // vertical and horizontal Sobel-like kernels
    let mut kernel = Array4::<f32>::zeros((2, 1, 3, 3));
    for i in 0..3 {
        let w = if i == 1 { 2.0 } else { 1.0 };
        kernel[[0, 0, i, 0]] = -w;
        kernel[[0, 0, i, 2]] = w;
        kernel[[1, 0, 0, i]] = -w;
        kernel[[1, 0, 2, i]] = w;
    }
    let features = 2 * 4 * 4;
    let mut head = Array2::<f32>::zeros((3, features));
    head.row_mut(0).fill(-0.05);
    head.slice_mut(ndarray::s![1, ..16]).fill(0.1);
    head.slice_mut(ndarray::s![2, 16..]).fill(0.1);
    vec![
        LayerSpec::conv2d("edges", kernel, None, (1, 1), (0, 0), (1, 1)),
        LayerSpec::relu("relu"),
        LayerSpec::linear("head", head, Some(Array1::from(vec![0.5, 0.0, 0.0]))),
    ]
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let model = ConvertedModel::from_layers(&edge_detector(), &[1, 6, 6], true)?;
    println!("=== Converted Model ===");
    println!("{}", model.layer_summary());

    // a vertical step edge
    let image = Array3::from_shape_fn((1, 6, 6), |(_, _, j)| if j < 3 { 0.0 } else { 1.0 }).into_dyn();
    let certifier = DeepZCertifier::new(model, 3)?;

    println!("\n=== Radius Sweep ===");
    for eps in [0.0, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2] {
        let report = certifier.certify_linf(image.view(), eps)?;
        let weakest = report
            .weakest()
            .map(|m| format!("class {} margin {:+.4}", m.class, m.lower_bound))
            .unwrap_or_else(|| "no other classes".to_string());
        println!(
            "eps {:<6} class {} {:<14} weakest: {}",
            eps,
            report.predicted_class,
            if report.certified { "certified" } else { "not certified" },
            weakest
        );
    }
    Ok(())
}
