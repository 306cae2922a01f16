//! Axis-aligned spatial transformer for attention crops.
//!
//! Maps between the image frame and the glimpse frame with a no-shear affine
//! transform over normalised `[-1, 1]` coordinates:
//!
//! ```text
//! x = sx * u + tx
//! y = sy * v + ty
//! ```
//!
//! where `(u, v)` are glimpse coordinates and `(x, y)` image coordinates.
//! Sampling is bilinear with zero padding outside the source, so pasting a
//! glimpse back into the image frame leaves the uncovered region at zero.

use std::marker::PhantomData;

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Spatial transformer between an image frame and a glimpse frame.
///
/// Pose parameters are `[sx, tx, sy, ty]` per sample: scales in `(0, 1]`
/// select the crop extent, shifts in `[-1, 1]` its centre.
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    img_h: usize,
    img_w: usize,
    crop_h: usize,
    crop_w: usize,
    phantom: PhantomData<B>,
}

impl<B: Backend> SpatialTransformer<B> {
    /// Creates a transformer for the given image and crop sizes, each given
    /// as `(height, width)`.
    pub fn new(img_size: (usize, usize), crop_size: (usize, usize)) -> Self {
        Self {
            img_h: img_size.0,
            img_w: img_size.1,
            crop_h: crop_size.0,
            crop_w: crop_size.1,
            phantom: PhantomData,
        }
    }

    /// Image size as `(height, width)`.
    pub fn img_size(&self) -> (usize, usize) {
        (self.img_h, self.img_w)
    }

    /// Crop size as `(height, width)`.
    pub fn crop_size(&self) -> (usize, usize) {
        (self.crop_h, self.crop_w)
    }

    /// Crops a glimpse from the image at the given pose.
    ///
    /// `images` is `[batch, img_h, img_w]`, `pose` is `[batch, 4]`; returns
    /// `[batch, crop_h, crop_w]`.
    pub fn forward(&self, images: Tensor<B, 3>, pose: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _, _] = images.dims();
        let device = images.device();
        let (sx, tx, sy, ty) = split_pose(pose, batch);

        // Glimpse pixel grid mapped into image coordinates.
        let u = coordinate_grid::<B>(self.crop_w, &device).reshape([1, 1, self.crop_w]);
        let v = coordinate_grid::<B>(self.crop_h, &device).reshape([1, self.crop_h, 1]);
        let xs = u * sx + tx;
        let ys = v * sy + ty;

        sample_bilinear(images, xs, ys)
    }

    /// Pastes a glimpse onto an image-sized field through the inverse map.
    ///
    /// `glimpses` is `[batch, crop_h, crop_w]`, `pose` is `[batch, 4]`;
    /// returns `[batch, img_h, img_w]` with zeros outside the pasted region.
    pub fn inverse(&self, glimpses: Tensor<B, 3>, pose: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _, _] = glimpses.dims();
        let device = glimpses.device();
        let (sx, tx, sy, ty) = split_pose(pose, batch);

        // Image pixel grid mapped into glimpse coordinates.
        let x = coordinate_grid::<B>(self.img_w, &device).reshape([1, 1, self.img_w]);
        let y = coordinate_grid::<B>(self.img_h, &device).reshape([1, self.img_h, 1]);
        let us = (x - tx) / sx;
        let vs = (y - ty) / sy;

        sample_bilinear(glimpses, us, vs)
    }
}

/// Splits pose `[batch, 4]` into broadcastable `[batch, 1, 1]` components.
fn split_pose<B: Backend>(
    pose: Tensor<B, 2>,
    batch: usize,
) -> (Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>) {
    let parts = pose.chunk(4, 1);
    let reshape = |t: Tensor<B, 2>| t.reshape([batch, 1, 1]);
    (
        reshape(parts[0].clone()),
        reshape(parts[1].clone()),
        reshape(parts[2].clone()),
        reshape(parts[3].clone()),
    )
}

/// Normalised pixel centre coordinates `[-1, 1]` for an axis of length `n`.
fn coordinate_grid<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 1> {
    debug_assert!(n >= 2, "spatial axes need at least two pixels");
    let coords: Vec<f32> = (0..n)
        .map(|i| 2.0 * i as f32 / (n - 1) as f32 - 1.0)
        .collect();
    Tensor::from_floats(coords.as_slice(), device)
}

/// Bilinearly samples `source` `[batch, src_h, src_w]` at normalised
/// coordinates `x` `[batch, 1, out_w]` and `y` `[batch, out_h, 1]`.
///
/// Coordinates outside `[-1, 1]` read zero. Returns `[batch, out_h, out_w]`.
fn sample_bilinear<B: Backend>(
    source: Tensor<B, 3>,
    x: Tensor<B, 3>,
    y: Tensor<B, 3>,
) -> Tensor<B, 3> {
    let [batch, src_h, src_w] = source.dims();
    let [_, _, out_w] = x.dims();
    let [_, out_h, _] = y.dims();

    // Denormalise to pixel coordinates with corners aligned.
    let px = (x + 1.0) * ((src_w - 1) as f64 / 2.0);
    let py = (y + 1.0) * ((src_h - 1) as f64 / 2.0);

    // Validity masks before clamping; out-of-source samples become zero.
    let x_valid = px.clone().greater_equal_elem(0.0).float()
        * px.clone().lower_equal_elem((src_w - 1) as f64).float();
    let y_valid = py.clone().greater_equal_elem(0.0).float()
        * py.clone().lower_equal_elem((src_h - 1) as f64).float();

    let x0 = px.clone().floor();
    let y0 = py.clone().floor();
    let wx = px - x0.clone();
    let wy = py - y0.clone();

    let max_x = (src_w - 1) as f64;
    let max_y = (src_h - 1) as f64;
    let x0c = x0.clone().clamp(0.0, max_x);
    let x1c = (x0 + 1.0).clamp(0.0, max_x);
    let y0c = y0.clone().clamp(0.0, max_y);
    let y1c = (y0 + 1.0).clamp(0.0, max_y);

    let source_flat = source.reshape([batch, src_h * src_w]);
    let gather_corner = |ix: Tensor<B, 3>, iy: Tensor<B, 3>| -> Tensor<B, 3> {
        // TEMP DEBUG
        eprintln!(
            "DBG ix min {:?} max {:?} | iy min {:?} max {:?}",
            ix.clone().min().into_scalar(),
            ix.clone().max().into_scalar(),
            iy.clone().min().into_scalar(),
            iy.clone().max().into_scalar(),
        );
        let index = (iy * src_w as f64 + ix).int().reshape([batch, out_h * out_w]);
        eprintln!(
            "DBG index min {:?} max {:?}",
            index.clone().min().into_scalar(),
            index.clone().max().into_scalar(),
        );
        source_flat
            .clone()
            .gather(1, index)
            .reshape([batch, out_h, out_w])
    };

    let v00 = gather_corner(x0c.clone(), y0c.clone());
    let v01 = gather_corner(x1c.clone(), y0c);
    let v10 = gather_corner(x0c, y1c.clone());
    let v11 = gather_corner(x1c, y1c);

    let wx0 = wx.clone().neg() + 1.0;
    let wy0 = wy.clone().neg() + 1.0;
    let top = v00 * wx0.clone() + v01 * wx.clone();
    let bottom = v10 * wx0 + v11 * wx;
    let sampled = top * wy0 + bottom * wy;

    sampled * x_valid * y_valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::backend::Backend as BurnBackend;

    type TestBackend = NdArray<f32>;
    type TestDevice = <TestBackend as BurnBackend>::Device;

    fn get_test_device() -> TestDevice {
        Default::default()
    }

    fn identity_pose(batch: usize, device: &TestDevice) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 1.0, 0.0], device)
            .reshape([1, 4])
            .expand([batch, 4])
    }

    #[test]
    fn test_identity_crop_reproduces_image() {
        let device = get_test_device();
        let stn = SpatialTransformer::<TestBackend>::new((5, 5), (5, 5));
        let images = Tensor::random([2, 5, 5], burn::tensor::Distribution::Uniform(0.0, 1.0), &device);

        let crops = stn.forward(images.clone(), identity_pose(2, &device));

        let diff = (crops - images).abs().sum().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_paste_places_glimpse_at_exact_pixels() {
        let device = get_test_device();
        let stn = SpatialTransformer::<TestBackend>::new((5, 5), (3, 3));
        let glimpses = Tensor::<TestBackend, 3>::ones([1, 3, 3], &device);
        let pose = Tensor::<TestBackend, 1>::from_floats([0.5, 0.0, 0.5, 0.0], &device)
            .reshape([1, 4]);

        let pasted = stn.inverse(glimpses, pose);

        // A half-scale centred paste covers the central 3x3 block exactly.
        assert_eq!(pasted.dims(), [1, 5, 5]);
        let data = pasted.to_data();
        let data = data.as_slice::<f32>().unwrap();
        for row in 0..5 {
            for col in 0..5 {
                let inside = (1..=3).contains(&row) && (1..=3).contains(&col);
                let expected = if inside { 1.0 } else { 0.0 };
                assert!(
                    (data[row * 5 + col] - expected).abs() < 1e-5,
                    "pixel ({}, {}) expected {}",
                    row,
                    col,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_crop_of_paste_round_trips_exactly() {
        let device = get_test_device();
        let stn = SpatialTransformer::<TestBackend>::new((5, 5), (3, 3));
        let glimpses = Tensor::<TestBackend, 1>::from_floats(
            [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9],
            &device,
        )
        .reshape([1, 3, 3]);
        // Scale 0.5 maps the 3x3 glimpse grid onto exact image pixels.
        let pose = Tensor::<TestBackend, 1>::from_floats([0.5, 0.0, 0.5, 0.0], &device)
            .reshape([1, 4]);

        let pasted = stn.inverse(glimpses.clone(), pose.clone());
        let recovered = stn.forward(pasted, pose);

        let diff = (recovered - glimpses).abs().sum().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_shifted_paste_moves_the_window() {
        let device = get_test_device();
        let stn = SpatialTransformer::<TestBackend>::new((5, 5), (3, 3));
        let glimpses = Tensor::<TestBackend, 3>::ones([1, 3, 3], &device);
        // Shift of half a frame moves the window right and down by two pixels.
        let pose = Tensor::<TestBackend, 1>::from_floats([0.5, 0.5, 0.5, 0.5], &device)
            .reshape([1, 4]);

        let pasted = stn.inverse(glimpses, pose);

        let data = pasted.to_data();
        let data = data.as_slice::<f32>().unwrap();
        for row in 0..5 {
            for col in 0..5 {
                let inside = (2..=4).contains(&row) && (2..=4).contains(&col);
                let expected = if inside { 1.0 } else { 0.0 };
                assert!((data[row * 5 + col] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_out_of_frame_crop_reads_zero() {
        let device = get_test_device();
        let stn = SpatialTransformer::<TestBackend>::new((5, 5), (3, 3));
        let images = Tensor::<TestBackend, 3>::ones([1, 5, 5], &device);
        // Fully outside the image on the right.
        let pose = Tensor::<TestBackend, 1>::from_floats([0.5, 4.0, 0.5, 0.0], &device)
            .reshape([1, 4]);

        let crops = stn.forward(images, pose);

        assert!(crops.abs().sum().into_scalar() < 1e-6);
    }

    #[test]
    fn test_batch_poses_are_independent() {
        let device = get_test_device();
        let stn = SpatialTransformer::<TestBackend>::new((5, 5), (3, 3));
        let glimpses = Tensor::<TestBackend, 3>::ones([2, 3, 3], &device);
        let pose = Tensor::<TestBackend, 2>::from_floats(
            [[0.5, 0.0, 0.5, 0.0], [0.5, 4.0, 0.5, 4.0]],
            &device,
        );

        let pasted = stn.inverse(glimpses, pose);

        let per_sample = pasted.sum_dim(1).sum_dim(2).reshape([2]).to_data();
        let per_sample = per_sample.as_slice::<f32>().unwrap();
        // First sample pastes the full 3x3 block, second lands off-frame.
        assert!((per_sample[0] - 9.0).abs() < 1e-4);
        assert!(per_sample[1].abs() < 1e-6);
    }
}
