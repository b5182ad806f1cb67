use ndarray::{Array, Array1, Array2, Array4, ArrayView4, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// 2D convolution with stride 1 and no padding, computed with img2col.
///
/// Kernels are stored flattened as [out_channels, in_channels * k * k] so that the
/// convolution of one sample is a single matmul against its patch matrix
/// [locations, in_channels * k * k].
#[derive(Debug, Clone)]
pub struct Conv2D {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub kernels: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Conv2D {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Conv2D {
        let fan_in = in_channels * kernel_size * kernel_size;
        let scale = (6f64 / fan_in.max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-scale, scale);
        let kernels = Array::zeros((out_channels, fan_in)).map(|_: &f64| dist.sample(&mut *rng));

        Conv2D {
            in_channels,
            out_channels,
            kernel_size,
            kernels,
            bias: Array1::zeros(out_channels),
        }
    }

    /// Spatial size of the output for a (height, width) input
    pub fn output_shape(&self, height: usize, width: usize) -> (usize, usize) {
        (
            (height + 1).saturating_sub(self.kernel_size),
            (width + 1).saturating_sub(self.kernel_size),
        )
    }

    /// Input: [batch, in_channels, height, width]
    /// Output: [batch, out_channels, height-k+1, width-k+1], plus the patch matrix of every
    /// sample, which backward needs.
    pub fn forward(&self, input: &ArrayView4<f64>) -> (Array4<f64>, Vec<Array2<f64>>) {
        let (batch_size, in_channels, height, width) = input.dim();
        assert_eq!(in_channels, self.in_channels, "conv input channels");

        let k = self.kernel_size;
        let (out_height, out_width) = self.output_shape(height, width);
        let locations = out_height * out_width;
        let mut out = Array4::zeros((batch_size, self.out_channels, out_height, out_width));
        let mut all_patches = Vec::with_capacity(batch_size);

        for (batch_idx, sample) in input.outer_iter().enumerate() {
            // One row per kernel location, windows come out in row-major order
            let mut patches = Array2::zeros((locations, in_channels * k * k));
            for (mut row, window) in patches
                .rows_mut()
                .into_iter()
                .zip(sample.windows((in_channels, k, k)))
            {
                row.iter_mut()
                    .zip(window.iter())
                    .for_each(|(dst, &src)| *dst = src);
            }

            // (out_channels, locations) = (out_channels, in_channels*k^2) dot (locations, in_channels*k^2)^T
            let mut maps = self.kernels.dot(&patches.t());
            maps += &self.bias.view().insert_axis(Axis(1));

            let maps = maps
                .into_shape((self.out_channels, out_height, out_width))
                .expect("one feature map value per location");
            out.index_axis_mut(Axis(0), batch_idx).assign(&maps);
            all_patches.push(patches);
        }

        (out, all_patches)
    }

    /// Kernel and bias gradients, summed over the batch.
    /// The conv stage sits directly on the pixels, so no input gradient is produced.
    pub fn backward(
        &self,
        patches: &[Array2<f64>],
        dz: &ArrayView4<f64>,
    ) -> (Array2<f64>, Array1<f64>) {
        let (_, out_channels, out_height, out_width) = dz.dim();
        let locations = out_height * out_width;

        let mut d_kernels = Array2::zeros(self.kernels.raw_dim());
        let mut d_bias = Array1::zeros(out_channels);

        for (sample_dz, sample_patches) in dz.outer_iter().zip(patches) {
            let sample_dz =
                Array2::from_shape_vec((out_channels, locations), sample_dz.iter().copied().collect())
                    .expect("dz holds out_channels * locations values");

            // (out_channels, in_channels*k^2) = (out_channels, locations) dot (locations, in_channels*k^2)
            d_kernels += &sample_dz.dot(sample_patches);
            d_bias += &sample_dz.sum_axis(Axis(1));
        }

        (d_kernels, d_bias)
    }
}

/// Non-overlapping max pooling. Rows and columns that do not fill a whole window are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool2D {
    pub pool_size: usize,
}

impl MaxPool2D {
    pub fn new(pool_size: usize) -> MaxPool2D {
        MaxPool2D { pool_size }
    }

    pub fn output_shape(&self, height: usize, width: usize) -> (usize, usize) {
        let p = self.pool_size.max(1);
        (height / p, width / p)
    }

    /// Returns the pooled maps and, for every pooled cell, the flat (row * width + col)
    /// position of the winning input
    pub fn forward(&self, input: &ArrayView4<f64>) -> (Array4<f64>, Array4<usize>) {
        let (batch_size, channels, height, width) = input.dim();
        let p = self.pool_size.max(1);
        let (out_height, out_width) = self.output_shape(height, width);

        let mut pooled = Array4::zeros((batch_size, channels, out_height, out_width));
        let mut argmax = Array4::zeros((batch_size, channels, out_height, out_width));

        for b in 0..batch_size {
            for c in 0..channels {
                for i in 0..out_height {
                    for j in 0..out_width {
                        let mut best = f64::NEG_INFINITY;
                        let mut best_at = (i * p) * width + j * p;
                        for row in i * p..(i + 1) * p {
                            for col in j * p..(j + 1) * p {
                                let value = input[[b, c, row, col]];
                                if value > best {
                                    best = value;
                                    best_at = row * width + col;
                                }
                            }
                        }
                        pooled[[b, c, i, j]] = best;
                        argmax[[b, c, i, j]] = best_at;
                    }
                }
            }
        }

        (pooled, argmax)
    }

    /// Route each pooled gradient back to the input that won its window
    pub fn backward(
        &self,
        argmax: &Array4<usize>,
        dz: &ArrayView4<f64>,
        input_shape: (usize, usize),
    ) -> Array4<f64> {
        let (batch_size, channels, _, _) = dz.dim();
        let (height, width) = input_shape;
        let mut d_input = Array4::zeros((batch_size, channels, height, width));

        for ((b, c, i, j), &grad) in dz.indexed_iter() {
            let at = argmax[[b, c, i, j]];
            d_input[[b, c, at / width, at % width]] += grad;
        }

        d_input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixed_conv() -> Conv2D {
        let mut conv = Conv2D::new(1, 1, 2, &mut StdRng::seed_from_u64(0));
        conv.kernels = array![[1.0, 0.0, 0.0, -1.0]];
        conv.bias = array![0.5];
        conv
    }

    #[test]
    fn convolves_valid_windows() {
        let conv = fixed_conv();
        let input = Array4::from_shape_vec((1, 1, 3, 3), (1..=9).map(f64::from).collect()).unwrap();

        let (out, patches) = conv.forward(&input.view());

        // every window computes top_left - bottom_right + 0.5 = -4 + 0.5
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert!(out.iter().all(|&v| (v + 3.5).abs() < 1e-12));
        assert_eq!(patches[0].row(1).to_vec(), vec![2.0, 3.0, 5.0, 6.0]);
    }

    #[test]
    fn conv_gradients_match_finite_differences() {
        let mut conv = Conv2D::new(2, 3, 2, &mut StdRng::seed_from_u64(5));
        let input = Array4::from_shape_fn((2, 2, 4, 3), |(b, c, i, j)| {
            ((b * 7 + c * 5 + i * 3 + j) as f64 * 0.37).sin()
        });
        // loss = sum(out * weights) for a fixed weighting, so dL/dout = weights
        let weights = Array4::from_shape_fn((2, 3, 3, 2), |(b, c, i, j)| {
            ((b + 2 * c + 3 * i + j) as f64 * 0.21).cos()
        });
        let loss = |conv: &Conv2D| (conv.forward(&input.view()).0 * &weights).sum();

        let (_, patches) = conv.forward(&input.view());
        let (d_kernels, d_bias) = conv.backward(&patches, &weights.view());

        let eps = 1e-6;
        for (o, f) in [(0, 0), (1, 5), (2, 7)] {
            conv.kernels[[o, f]] += eps;
            let up = loss(&conv);
            conv.kernels[[o, f]] -= 2.0 * eps;
            let down = loss(&conv);
            conv.kernels[[o, f]] += eps;
            assert!(((up - down) / (2.0 * eps) - d_kernels[[o, f]]).abs() < 1e-5);
        }

        conv.bias[2] += eps;
        let up = loss(&conv);
        conv.bias[2] -= 2.0 * eps;
        let down = loss(&conv);
        assert!(((up - down) / (2.0 * eps) - d_bias[2]).abs() < 1e-5);
    }

    #[test]
    fn pools_and_routes_gradients_to_the_max() {
        let pool = MaxPool2D::new(2);
        let plane: Array3<f64> = array![[
            [1.0, 5.0, 2.0, 0.0, 9.0],
            [3.0, 4.0, 8.0, 1.0, 9.0],
            [0.0, 0.0, 0.0, 7.0, 9.0],
            [6.0, 0.0, 0.0, 0.0, 9.0],
            [9.0, 9.0, 9.0, 9.0, 9.0]
        ]];
        let input = plane.insert_axis(Axis(0));

        let (pooled, argmax) = pool.forward(&input.view());

        assert_eq!(pooled.shape(), &[1, 1, 2, 2]);
        assert_eq!(pooled.slice(s![0, 0, .., ..]), array![[5.0, 8.0], [6.0, 7.0]]);

        let dz = Array4::from_elem((1, 1, 2, 2), 1.0);
        let d_input = pool.backward(&argmax, &dz.view(), (5, 5));

        assert_eq!(d_input.sum(), 4.0);
        assert_eq!(d_input[[0, 0, 0, 1]], 1.0);
        assert_eq!(d_input[[0, 0, 1, 2]], 1.0);
        assert_eq!(d_input[[0, 0, 3, 0]], 1.0);
        assert_eq!(d_input[[0, 0, 2, 3]], 1.0);
        assert_eq!(d_input[[0, 0, 4, 4]], 0.0);
    }
}
