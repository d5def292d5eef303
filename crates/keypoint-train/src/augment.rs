//! Training-time augmentation of an image and its keypoints.
//!
//! Images are `[1, H, W]` float tensors in `[0, 1]`; keypoints are `[K, 2]`
//! `(row, col)` arrays in image pixels. Every random draw comes from the
//! caller's [`StdRng`], in this fixed order:
//!
//! 1. gamma exponent in `[0.75, 4/3)`
//! 2. brightness shift in `[-0.1, 0.1)`; the image mean after this step is
//!    the fill value for rotation and padding
//! 3. resize scale in `[0.9375, 1.0625)`, to `round(S · scale)` square
//! 4. vertical flip, then horizontal flip, each with probability one half
//! 5. rotation in `[-45°, 45°)`, counter-clockwise, canvas expanded
//! 6. top then left padding offsets, up to the deficit to `S`
//! 7. vertical then horizontal crop offsets, up to the excess over `S`
//! 8. after rescaling into the output grid, per-keypoint wiggle: all angles,
//!    then all row scales, then all column scales
//!
//! Pixel noise (σ = 0.1) is added by [`add_pixel_noise`] once the image has
//! been standardized.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use tch::{Kind, Tensor};

/// Gamma exponent range.
pub const GAMMA_RANGE: (f64, f64) = (0.75, 4.0 / 3.0);
/// Additive brightness range.
pub const BRIGHTNESS_RANGE: (f64, f64) = (-0.1, 0.1);
/// Isotropic resize range.
pub const SCALE_RANGE: (f64, f64) = (0.9375, 1.0625);
/// Rotation range in degrees.
pub const ROTATION_DEGREES: f64 = 45.0;
/// Maximum wiggle radius per axis, in output pixels.
pub const WIGGLE_RADIUS: f32 = 0.25;
/// Standard deviation of the additive pixel noise.
pub const PIXEL_NOISE_STD: f32 = 0.1;

// ---------------------------------------------------------------------------
// Geometric primitives
// ---------------------------------------------------------------------------

/// Antialiased bilinear resize of a `[1, H, W]` image to `[1, height, width]`.
///
/// When shrinking, the filter footprint widens with the scale factor; when
/// enlarging it reduces to plain bilinear interpolation.
pub fn resize(image: &Tensor, height: i64, width: i64) -> Tensor {
    image
        .unsqueeze(0)
        .internal_upsample_bilinear2d_aa([height, width], false, None::<f64>, None::<f64>)
        .squeeze_dim(0)
}

fn expanded_extent(half: f64) -> i64 {
    // Ignore float noise below 1e-4 before rounding up.
    let truncated = (half / 1.0e-4).trunc() * 1.0e-4;
    2 * truncated.ceil() as i64
}

/// Canvas `(height, width)` holding an `height × width` image rotated by
/// `degrees`.
pub fn expanded_size(height: i64, width: i64, degrees: f64) -> (i64, i64) {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (h, w) = (height as f64, width as f64);
    let half_h = 0.5 * (w * sin.abs() + h * cos.abs());
    let half_w = 0.5 * (w * cos.abs() + h * sin.abs());
    (expanded_extent(half_h), expanded_extent(half_w))
}

/// Rotate a `[1, H, W]` image counter-clockwise by `degrees` about its
/// center onto an expanded canvas, filling uncovered pixels with `fill`.
pub fn rotate_expand(image: &Tensor, degrees: f64, fill: f64) -> Tensor {
    let size = image.size();
    let (h, w) = (size[1], size[2]);
    let (nh, nw) = expanded_size(h, w, degrees);
    let (sin, cos) = degrees.to_radians().sin_cos();
    let opts = (Kind::Float, image.device());

    // Destination pixel centers relative to the new canvas center.
    let ys = (Tensor::arange(nh, opts) + 0.5 - nh as f64 / 2.0).view([nh, 1]);
    let xs = (Tensor::arange(nw, opts) + 0.5 - nw as f64 / 2.0).view([1, nw]);

    // Inverse rotation back into source pixels.
    let src_y = &ys * cos + &xs * sin + h as f64 / 2.0;
    let src_x = &ys * (-sin) + &xs * cos + w as f64 / 2.0;
    let grid_x = src_x * (2.0 / w as f64) - 1.0;
    let grid_y = src_y * (2.0 / h as f64) - 1.0;
    let grid = Tensor::stack(&[grid_x, grid_y], -1).unsqueeze(0);

    // Zero padding of the centered image is `fill` once the offset returns.
    let centered = (image - fill).unsqueeze(0);
    centered.grid_sampler(&grid, 0, 0, false).squeeze_dim(0) + fill
}

/// Apply the rotation of [`rotate_expand`] to keypoints.
///
/// `from` is the `(height, width)` before rotation, `to` the expanded canvas.
pub fn rotate_coords(coords: &mut Array2<f32>, degrees: f64, from: (i64, i64), to: (i64, i64)) {
    let (sin, cos) = degrees.to_radians().sin_cos();
    for mut point in coords.rows_mut() {
        let y = point[0] as f64 - from.0 as f64 / 2.0;
        let x = point[1] as f64 - from.1 as f64 / 2.0;
        point[0] = (cos * y - sin * x + to.0 as f64 / 2.0) as f32;
        point[1] = (sin * y + cos * x + to.1 as f64 / 2.0) as f32;
    }
}

/// Place a `[1, H, W]` image on a `fill` canvas of `[1, height, width]` at
/// offset `(top, left)`.
pub fn pad(image: &Tensor, height: i64, width: i64, top: i64, left: i64, fill: f64) -> Tensor {
    let size = image.size();
    let canvas = Tensor::full([1, height, width], fill, (image.kind(), image.device()));
    let mut window = canvas.narrow(1, top, size[1]).narrow(2, left, size[2]);
    window.copy_(image);
    canvas
}

/// Cut a `[1, height, width]` window starting at `(top, left)`.
pub fn crop(image: &Tensor, top: i64, left: i64, height: i64, width: i64) -> Tensor {
    image.narrow(1, top, height).narrow(2, left, width)
}

/// Multiply rows by `row_factor` and columns by `col_factor`.
pub fn scale_coords(coords: &mut Array2<f32>, row_factor: f32, col_factor: f32) {
    coords.column_mut(0).mapv_inplace(|r| r * row_factor);
    coords.column_mut(1).mapv_inplace(|c| c * col_factor);
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Augment `image` (`[1, H, W]`, values in `[0, 1]`) and its keypoints.
///
/// Returns the `[1, S, S]` image (not yet standardized) and the keypoints in
/// output-grid pixels (`S / 2` side), wiggle included.
pub fn augment(
    image: &Tensor,
    mut coords: Array2<f32>,
    input_size: usize,
    output_size: usize,
    rng: &mut StdRng,
) -> (Tensor, Array2<f32>) {
    let s = input_size as i64;
    let size = image.size();
    let (orig_h, orig_w) = (size[1], size[2]);

    let gamma = rng.gen_range(GAMMA_RANGE.0..GAMMA_RANGE.1);
    let brightness = rng.gen_range(BRIGHTNESS_RANGE.0..BRIGHTNESS_RANGE.1);
    let image = image.pow_tensor_scalar(gamma) + brightness;
    let fill = image.mean(Kind::Float).double_value(&[]);

    let scale = rng.gen_range(SCALE_RANGE.0..SCALE_RANGE.1);
    let resized = (input_size as f64 * scale).round_ties_even() as i64;
    let mut image = resize(&image, resized, resized);
    scale_coords(
        &mut coords,
        resized as f32 / orig_h as f32,
        resized as f32 / orig_w as f32,
    );

    if rng.gen_range(0..2) == 1 {
        image = image.flip([1]);
        let h = resized as f32;
        coords.column_mut(0).mapv_inplace(|r| h - r);
    }
    if rng.gen_range(0..2) == 1 {
        image = image.flip([2]);
        let w = resized as f32;
        coords.column_mut(1).mapv_inplace(|c| w - c);
    }

    let degrees = rng.gen_range(-ROTATION_DEGREES..ROTATION_DEGREES);
    let image = rotate_expand(&image, degrees, fill);
    let rotated = (image.size()[1], image.size()[2]);
    rotate_coords(&mut coords, degrees, (resized, resized), rotated);

    let pad_h = (s - rotated.0).max(0);
    let top = rng.gen_range(0..=pad_h);
    let pad_w = (s - rotated.1).max(0);
    let left = rng.gen_range(0..=pad_w);
    let image = if pad_h > 0 || pad_w > 0 {
        let padded = pad(&image, rotated.0 + pad_h, rotated.1 + pad_w, top, left, fill);
        coords.column_mut(0).mapv_inplace(|r| r + top as f32);
        coords.column_mut(1).mapv_inplace(|c| c + left as f32);
        padded
    } else {
        image
    };

    let (h, w) = (image.size()[1], image.size()[2]);
    let excess_h = (h - s).max(0);
    let crop_top = rng.gen_range(0..=excess_h);
    let excess_w = (w - s).max(0);
    let crop_left = rng.gen_range(0..=excess_w);
    let image = if excess_h > 0 || excess_w > 0 {
        coords.column_mut(0).mapv_inplace(|r| r - crop_top as f32);
        coords.column_mut(1).mapv_inplace(|c| c - crop_left as f32);
        crop(&image, crop_top, crop_left, s.min(h - crop_top), s.min(w - crop_left))
    } else {
        image
    };

    let to_output = output_size as f32 / input_size as f32;
    coords.mapv_inplace(|v| v * to_output);
    wiggle(&mut coords, rng);

    (image, coords)
}

/// Offset each keypoint by a random polar displacement with independent
/// row and column radii in `[0, 0.25)`.
pub fn wiggle(coords: &mut Array2<f32>, rng: &mut StdRng) {
    let n = coords.nrows();
    let thetas: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..360.0).to_radians()).collect();
    let row_scales: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..WIGGLE_RADIUS)).collect();
    let col_scales: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..WIGGLE_RADIUS)).collect();
    for (k, mut point) in coords.rows_mut().into_iter().enumerate() {
        point[0] += row_scales[k] * thetas[k].sin();
        point[1] += col_scales[k] * thetas[k].cos();
    }
}

/// Add `N(0, 0.1²)` noise to every pixel.
pub fn add_pixel_noise(image: &Tensor, rng: &mut StdRng) -> Tensor {
    let numel = image.numel() as usize;
    let noise: Vec<f32> = (0..numel)
        .map(|_| rng.sample::<f32, _>(StandardNormal) * PIXEL_NOISE_STD)
        .collect();
    image + Tensor::from_slice(&noise).view_as(image).to_device(image.device())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use tch::Device;

    fn ramp(h: i64, w: i64) -> Tensor {
        Tensor::arange(h * w, (Kind::Float, Device::Cpu)).view([1, h, w]) / (h * w) as f64
    }

    #[test]
    fn downscaling_smooths_a_checkerboard() {
        let idx = Tensor::arange(600, (Kind::Int64, Device::Cpu));
        let board = (idx.unsqueeze(1) + idx.unsqueeze(0)).remainder(2).to_kind(Kind::Float).unsqueeze(0);
        let out = resize(&board, 256, 256);
        assert_eq!(out.size(), vec![1, 256, 256]);
        // Point sampling would alias into bands reaching nearly 0 or 1.
        let deviation = (out - 0.5).abs().max().double_value(&[]);
        assert!(deviation < 0.05, "max deviation {deviation}");
    }

    #[test]
    fn upscaling_matches_plain_bilinear() {
        let image = ramp(6, 8);
        let plain = image
            .unsqueeze(0)
            .upsample_bilinear2d([12, 16], false, None::<f64>, None::<f64>)
            .squeeze_dim(0);
        let diff = (resize(&image, 12, 16) - plain).abs().max().double_value(&[]);
        assert!(diff < 1e-5, "max difference {diff}");
    }

    #[test]
    fn expanded_size_of_quarter_turn_swaps_axes() {
        assert_eq!(expanded_size(10, 20, 0.0), (10, 20));
        assert_eq!(expanded_size(10, 20, 90.0), (20, 10));
        let (h, w) = expanded_size(10, 10, 45.0);
        assert_eq!((h, w), (16, 16));
    }

    #[test]
    fn zero_rotation_is_identity() {
        let image = ramp(6, 8);
        let rotated = rotate_expand(&image, 0.0, 0.5);
        assert_eq!(rotated.size(), vec![1, 6, 8]);
        let diff = (&rotated - &image).abs().max().double_value(&[]);
        assert!(diff < 1e-5, "max abs diff {diff}");
    }

    #[test]
    fn rotation_fills_corners_with_mean() {
        let image = Tensor::ones([1, 8, 8], (Kind::Float, Device::Cpu));
        let rotated = rotate_expand(&image, 45.0, 0.25);
        assert_abs_diff_eq!(rotated.double_value(&[0, 0, 0]), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn quarter_turn_moves_right_edge_to_top() {
        let mut coords = array![[5.0f32, 9.0]];
        rotate_coords(&mut coords, 90.0, (10, 10), (10, 10));
        assert_abs_diff_eq!(coords[[0, 0]], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(coords[[0, 1]], 5.0, epsilon = 1e-4);
    }

    #[test]
    fn pad_then_crop_recovers_image() {
        let image = ramp(4, 5);
        let padded = pad(&image, 7, 9, 2, 3, -1.0);
        assert_eq!(padded.size(), vec![1, 7, 9]);
        assert_abs_diff_eq!(padded.double_value(&[0, 0, 0]), -1.0, epsilon = 1e-6);
        let back = crop(&padded, 2, 3, 4, 5);
        assert!(back.equal(&image));
    }

    #[test]
    fn augment_yields_exact_input_size() {
        let mut rng = StdRng::seed_from_u64(3);
        let image = ramp(40, 48);
        let coords = array![[10.0f32, 12.0], [30.0, 40.0]];
        let (out, coords) = augment(&image, coords, 32, 16, &mut rng);
        assert_eq!(out.size(), vec![1, 32, 32]);
        assert_eq!(coords.shape(), &[2, 2]);
    }

    #[test]
    fn augment_is_reproducible_under_a_seed() {
        let image = ramp(32, 32);
        let coords = array![[8.0f32, 8.0]];
        let (a, ca) = augment(&image, coords.clone(), 32, 16, &mut StdRng::seed_from_u64(9));
        let (b, cb) = augment(&image, coords, 32, 16, &mut StdRng::seed_from_u64(9));
        assert!(a.equal(&b));
        assert_eq!(ca, cb);
    }

    #[test]
    fn wiggle_stays_within_radius() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut coords = Array2::from_elem((50, 2), 4.0f32);
        wiggle(&mut coords, &mut rng);
        for v in coords.iter() {
            assert!((v - 4.0).abs() <= WIGGLE_RADIUS, "offset too large: {v}");
        }
    }
}
