//! Whole-pipeline runs on synthetic skies.

#![allow(clippy::unwrap_used)]

use dustfree_pipeline::{
    DustFreeConfig, Image, Monitor, PipelineError, ReconstructResult, reconstruct,
};

fn config(downsample: u32) -> DustFreeConfig {
    DustFreeConfig {
        star_detection_sensitivity: 4.0,
        star_diffusion_distance: 5,
        smoothness: 2.0,
        downsample,
        max_workers: Some(4),
        ..DustFreeConfig::default()
    }
}

fn square_mask(size: usize, from: usize, to: usize) -> Image<f32> {
    Image::from_fn(size, size, 1, |x, y, _| {
        if (from..to).contains(&x) && (from..to).contains(&y) {
            1.0
        } else {
            0.0
        }
    })
}

#[test]
fn uniform_sky_without_dust_is_unchanged() {
    let mut image = Image::<f32>::filled(512, 512, 1, 1.0);
    let dust = Image::<f32>::zeros(512, 512, 1);
    let result = reconstruct(&mut image, Some(&dust), &config(1), &Monitor::new()).unwrap();
    assert_eq!(result, ReconstructResult::Restored);
    assert!(image.as_slice().iter().all(|&v| (v - 1.0).abs() < 1e-5));
}

#[test]
fn dust_region_is_filled_from_surrounding_sky() {
    let mut image = Image::<f32>::filled(512, 512, 1, 1.0);
    let dust = square_mask(512, 250, 260);
    reconstruct(&mut image, Some(&dust), &config(1), &Monitor::new()).unwrap();
    for y in 250..260 {
        for x in 250..260 {
            let v = image.get(x, y, 0);
            assert!((v - 1.0).abs() < 1e-4, "({x}, {y}) = {v}");
        }
    }
}

#[test]
fn dust_shadow_is_lifted_to_surrounding_sky() {
    let size = 256;
    let center = 128.0f32;
    let in_mote = |x: usize, y: usize, radius: f32| {
        let dx = x as f32 - center;
        let dy = y as f32 - center;
        dx * dx + dy * dy <= radius * radius
    };
    let mut image = Image::<f32>::from_fn(size, size, 1, |x, y, _| {
        if in_mote(x, y, 60.0) { 0.35 } else { 0.5 }
    });
    let dust = Image::<f32>::from_fn(size, size, 1, |x, y, _| {
        if in_mote(x, y, 70.0) { 1.0 } else { 0.0 }
    });

    reconstruct(&mut image, Some(&dust), &config(2), &Monitor::new()).unwrap();

    let v = image.get(128, 128, 0);
    assert!((v - 0.5).abs() < 0.02, "center of mote = {v}");
    let far = image.get(5, 5, 0);
    assert!((far - 0.5).abs() < 1e-3, "clean sky = {far}");
}

#[test]
fn single_channel_mask_applies_to_every_channel() {
    let mut image = Image::<f32>::from_fn(96, 96, 3, |_, _, c| 0.3 + 0.1 * c as f32);
    let dust = square_mask(96, 40, 50);
    reconstruct(&mut image, Some(&dust), &config(1), &Monitor::new()).unwrap();
    assert_eq!(image.channels(), 3);
    for c in 0..3 {
        let expected = 0.3 + 0.1 * c as f32;
        let v = image.get(45, 45, c);
        assert!((v - expected).abs() < 1e-4, "channel {c}: {v}");
    }
}

#[test]
fn resized_dust_mask_is_accepted() {
    let mut image = Image::<f64>::filled(64, 48, 1, 0.75);
    let dust = Image::<f64>::from_fn(32, 24, 1, |x, y, _| {
        if (10..14).contains(&x) && (10..14).contains(&y) { 1.0 } else { 0.0 }
    });
    reconstruct(&mut image, Some(&dust), &config(1), &Monitor::new()).unwrap();
    assert!(image.as_slice().iter().all(|&v| (v - 0.75).abs() < 1e-9));
}

#[test]
fn non_finite_pixels_are_skipped_as_holes() {
    let mut image = Image::<f32>::filled(64, 64, 1, 0.5);
    image.set(10, 40, 0, f32::NAN);
    let dust = square_mask(64, 30, 36);
    reconstruct(&mut image, Some(&dust), &config(1), &Monitor::new()).unwrap();
    assert!(image.get(10, 40, 0).is_nan());
    for (i, &v) in image.as_slice().iter().enumerate() {
        if i != 40 * 64 + 10 {
            assert!((v - 0.5).abs() < 1e-5, "sample {i} = {v}");
        }
    }
}

#[test]
fn aborted_run_leaves_image_untouched() {
    let mut image = Image::<f32>::filled(300, 300, 1, 0.4);
    let before = image.clone();
    let dust = square_mask(300, 100, 120);
    let monitor = Monitor::new();
    monitor.signal().abort();
    let result = reconstruct(&mut image, Some(&dust), &config(1), &monitor);
    assert!(matches!(result, Err(PipelineError::Aborted)));
    assert_eq!(image, before);
}

#[test]
fn jitter_keeps_uniform_sky_uniform() {
    let mut image = Image::<f32>::filled(128, 128, 1, 0.6);
    let dust = square_mask(128, 60, 70);
    let config = DustFreeConfig {
        ray_jitter: true,
        ..config(1)
    };
    reconstruct(&mut image, Some(&dust), &config, &Monitor::new()).unwrap();
    assert!(image.as_slice().iter().all(|&v| (v - 0.6).abs() < 1e-4));
}
