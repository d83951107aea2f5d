//! The linear forward model of a lensless camera: convolution of the scene with
//! the point-spread function, computed as a product in the frequency domain.
//!
//! The PSF is zero-padded to a 2/3/5-smooth size of at least `2n - 1` per spatial
//! axis so that the circular convolution on the padded grid equals the linear
//! convolution inside the crop window. The PSF is placed at offset
//! `(Hp - h) / 2` (floor) and the padded array is `ifftshift`ed. When `Hp - h` is
//! odd the PSF centre lands at `Hp / 2 - 1` and ends up one pixel off the origin
//! on that axis. `adjoint` is the exact transpose of `forward` either way.
//!
//! The 2-D real FFT is separable: `realfft` along the width (half spectrum), then a
//! complex `rustfft` transform along the height of every spectral column.

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::math_tools::{ifftshift_2d, next_fast_len};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView4, Axis, Zip};
use num_complex::Complex;
use num_traits::Zero;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// FFT-based convolution operator built once from a PSF and shared read-only.
pub struct ForwardModel<T: ReconFloat> {
    /// `(D, H, W, C)` of the PSF and of every reconstruction
    psf_shape: [usize; 4],
    padded_shape: [usize; 2],
    start: [usize; 2],
    r2c: Arc<dyn RealToComplex<T>>,
    c2r: Arc<dyn ComplexToReal<T>>,
    column_forward: Arc<dyn Fft<T>>,
    column_inverse: Arc<dyn Fft<T>>,
    /// `Ĥ`, shape `(D, Hp, Wp/2 + 1, C)`
    transfer: Array4<Complex<T>>,
    /// `Σ_d |Ĥ_d|²`, shape `(Hp, Wp/2 + 1, C)`
    power: Array3<T>,
    /// eigenvalues of `ΨᵀΨ` for circular forward differences, shape `(Hp, Wp/2 + 1)`
    laplacian: Array2<T>,
    /// `CᵀC·1`: ones inside the crop window, zeros in the padding
    crop_mask: Array2<T>,
    /// per channel `(max + min) / 2` of the PSF, the default initial estimate
    midrange: Array1<T>,
    lipschitz: T,
}

impl<T: ReconFloat> Debug for ForwardModel<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardModel")
            .field("psf_shape", &self.psf_shape)
            .field("padded_shape", &self.padded_shape)
            .field("lipschitz", &self.lipschitz)
            .finish_non_exhaustive()
    }
}

impl<T: ReconFloat> ForwardModel<T> {
    /// Builds the forward model and its frequency-domain cache.
    ///
    /// # Arguments
    /// - `psf`: PSF of shape `(D, H, W, C)` with `C` equal to 1 or 3.
    /// - `normalize`: scale the PSF to unit sum before transforming it.
    ///
    /// # Errors
    /// `InvalidPsf` if the PSF is empty, all zero, not finite, or has an unsupported
    /// channel count.
    pub fn new(psf: ArrayView4<T>, normalize: bool) -> Result<Self> {
        let (depth, height, width, channels) = psf.dim();
        if depth == 0 || height == 0 || width == 0 {
            return Err(ReconError::InvalidPsf(format!(
                "empty PSF of shape {:?}",
                psf.shape()
            )));
        }
        if channels != 1 && channels != 3 {
            return Err(ReconError::InvalidPsf(format!(
                "PSF must have 1 or 3 channels, got {channels}"
            )));
        }
        if psf.iter().any(|x| !x.is_finite()) {
            return Err(ReconError::InvalidPsf("PSF contains NaN or Inf".to_string()));
        }
        if psf.iter().all(|x| x.is_zero()) {
            return Err(ReconError::InvalidPsf("PSF is all zeros".to_string()));
        }

        let psf = if normalize {
            let total = psf.sum();
            if total <= T::zero() {
                return Err(ReconError::InvalidPsf(
                    "PSF must have positive total energy to be normalized".to_string(),
                ));
            }
            psf.mapv(|x| x / total)
        } else {
            psf.to_owned()
        };

        let padded_h = next_fast_len(2 * height - 1);
        let padded_w = next_fast_len(2 * width - 1);
        // floor offset; odd margins leave the centre one pixel short of Hp/2
        let start = [(padded_h - height) / 2, (padded_w - width) / 2];
        let half_w = padded_w / 2 + 1;

        let mut real_planner = RealFftPlanner::<T>::new();
        let r2c = real_planner.plan_fft_forward(padded_w);
        let c2r = real_planner.plan_fft_inverse(padded_w);
        let mut planner = FftPlanner::<T>::new();
        let column_forward = planner.plan_fft_forward(padded_h);
        let column_inverse = planner.plan_fft_inverse(padded_h);

        let mut model = ForwardModel {
            psf_shape: [depth, height, width, channels],
            padded_shape: [padded_h, padded_w],
            start,
            r2c,
            c2r,
            column_forward,
            column_inverse,
            transfer: Array4::zeros((depth, padded_h, half_w, channels)),
            power: Array3::zeros((padded_h, half_w, channels)),
            laplacian: Array2::zeros((padded_h, half_w)),
            crop_mask: Array2::zeros((padded_h, padded_w)),
            midrange: Array1::zeros(channels),
            lipschitz: T::zero(),
        };

        // transfer function of every depth plane and channel
        let padded_psf = model.pad(psf.view())?;
        for d in 0..depth {
            for c in 0..channels {
                let centred = ifftshift_2d(padded_psf.slice(s![d, .., .., c]));
                let spectrum = model.rfft2(centred.view())?;
                model.transfer.slice_mut(s![d, .., .., c]).assign(&spectrum);
            }
        }
        model.power = model
            .transfer
            .map(|h| h.norm_sqr())
            .sum_axis(Axis(0));
        model.lipschitz = model
            .power
            .iter()
            .fold(T::zero(), |acc, &p| if p > acc { p } else { acc });

        let two = T::cast(2.0);
        let two_pi = T::cast(2.0 * std::f64::consts::PI);
        let (ph, pw) = (T::cast(padded_h as f64), T::cast(padded_w as f64));
        model.laplacian = Array2::from_shape_fn((padded_h, half_w), |(k, l)| {
            let ky = two_pi * T::cast(k as f64) / ph;
            let kx = two_pi * T::cast(l as f64) / pw;
            (two - two * ky.cos()) + (two - two * kx.cos())
        });

        model
            .crop_mask
            .slice_mut(s![start[0]..start[0] + height, start[1]..start[1] + width])
            .fill(T::one());

        for (c, value) in model.midrange.iter_mut().enumerate() {
            let channel = psf.slice(s![.., .., .., c]);
            let max = channel.fold(T::neg_infinity(), |acc, &x| acc.max(x));
            let min = channel.fold(T::infinity(), |acc, &x| acc.min(x));
            *value = (max + min) / two;
        }

        log::debug!(
            "forward model: PSF {:?}, padded to {}x{}, lipschitz constant {:e}",
            model.psf_shape,
            padded_h,
            padded_w,
            model.lipschitz.as_f64()
        );
        Ok(model)
    }

    /// `(D, H, W, C)`
    pub fn psf_shape(&self) -> [usize; 4] {
        self.psf_shape
    }

    pub fn depth(&self) -> usize {
        self.psf_shape[0]
    }

    pub fn channels(&self) -> usize {
        self.psf_shape[3]
    }

    /// Spatial size of the padded grid.
    pub fn padded_shape(&self) -> [usize; 2] {
        self.padded_shape
    }

    /// Shape of a measurement: `(1, H, W, C)`.
    pub fn measurement_shape(&self) -> [usize; 4] {
        let [_, h, w, c] = self.psf_shape;
        [1, h, w, c]
    }

    /// Largest eigenvalue of `AᵀA`, the Lipschitz constant of the data-term gradient.
    pub fn lipschitz(&self) -> T {
        self.lipschitz
    }

    /// `CᵀC·1` on the padded grid.
    pub fn crop_mask(&self) -> &Array2<T> {
        &self.crop_mask
    }

    /// Default starting image for the gradient family: every pixel at the
    /// mid-range of the PSF values of its channel.
    pub fn half_intensity_image(&self) -> Array4<T> {
        let [d, h, w, c] = self.psf_shape;
        Array4::from_shape_fn((d, h, w, c), |(_, _, _, ch)| self.midrange[ch])
    }

    /// Zero-pads `(N, H, W, C)` to `(N, Hp, Wp, C)`, placing the input in the crop window.
    pub fn pad(&self, x: ArrayView4<T>) -> Result<Array4<T>> {
        let [_, h, w, c] = self.psf_shape;
        let (n, xh, xw, xc) = x.dim();
        if (xh, xw, xc) != (h, w, c) {
            return Err(ReconError::shape("pad", &[n, h, w, c], x.shape()));
        }
        let [ph, pw] = self.padded_shape;
        let [sh, sw] = self.start;
        let mut padded = Array4::zeros((n, ph, pw, c));
        padded
            .slice_mut(s![.., sh..sh + h, sw..sw + w, ..])
            .assign(&x);
        Ok(padded)
    }

    /// Extracts the crop window from `(N, Hp, Wp, C)`.
    pub fn crop(&self, x: ArrayView4<T>) -> Result<Array4<T>> {
        let [_, h, w, c] = self.psf_shape;
        let [ph, pw] = self.padded_shape;
        let (n, xh, xw, xc) = x.dim();
        if (xh, xw, xc) != (ph, pw, c) {
            return Err(ReconError::shape("crop", &[n, ph, pw, c], x.shape()));
        }
        let [sh, sw] = self.start;
        Ok(x.slice(s![.., sh..sh + h, sw..sw + w, ..]).to_owned())
    }

    /// `A x`: `(D, H, W, C) → (1, H, W, C)`.
    pub fn forward(&self, x: ArrayView4<T>) -> Result<Array4<T>> {
        self.check_image("forward", x, self.depth())?;
        let padded = self.pad(x)?;
        let convolved = self.convolve_padded(padded.view())?;
        self.crop(convolved.view())
    }

    /// `Aᵀ y`: `(1, H, W, C) → (D, H, W, C)`.
    pub fn adjoint(&self, y: ArrayView4<T>) -> Result<Array4<T>> {
        self.check_image("adjoint", y, 1)?;
        let padded = self.pad(y)?;
        let correlated = self.correlate_padded(padded.view())?;
        self.crop(correlated.view())
    }

    /// `H v` on the padded grid: `(D, Hp, Wp, C) → (1, Hp, Wp, C)`, summed over depth.
    pub fn convolve_padded(&self, v: ArrayView4<T>) -> Result<Array4<T>> {
        self.check_padded("convolve_padded", v, self.depth())?;
        let [ph, pw] = self.padded_shape;
        let channels = self.channels();
        let mut out = Array4::zeros((1, ph, pw, channels));
        for c in 0..channels {
            let mut acc = Array2::<Complex<T>>::zeros((ph, pw / 2 + 1));
            for d in 0..self.depth() {
                let spectrum = self.rfft2(v.slice(s![d, .., .., c]))?;
                Zip::from(&mut acc)
                    .and(&spectrum)
                    .and(self.transfer.slice(s![d, .., .., c]))
                    .for_each(|a, &x, &h| *a = *a + x * h);
            }
            out.slice_mut(s![0, .., .., c]).assign(&self.irfft2(acc)?);
        }
        Ok(out)
    }

    /// `Hᵀ y` on the padded grid: `(1, Hp, Wp, C) → (D, Hp, Wp, C)`.
    pub fn correlate_padded(&self, y: ArrayView4<T>) -> Result<Array4<T>> {
        self.check_padded("correlate_padded", y, 1)?;
        let [ph, pw] = self.padded_shape;
        let (depth, channels) = (self.depth(), self.channels());
        let mut out = Array4::zeros((depth, ph, pw, channels));
        for c in 0..channels {
            let spectrum = self.rfft2(y.slice(s![0, .., .., c]))?;
            for d in 0..depth {
                let mut product = spectrum.clone();
                Zip::from(&mut product)
                    .and(self.transfer.slice(s![d, .., .., c]))
                    .for_each(|p, &h| *p = *p * h.conj());
                out.slice_mut(s![d, .., .., c])
                    .assign(&self.irfft2(product)?);
            }
        }
        Ok(out)
    }

    /// Solves `(μ1·HᵀH + μ2·ΨᵀΨ + μ3·I) v = r` on the padded grid.
    ///
    /// Every frequency couples the `D` depth planes only through the rank-one term
    /// `μ1·h̄ hᵀ`, so with `a = μ2·λ + μ3` the Sherman–Morrison formula gives
    /// `v̂_d = (r̂_d − μ1·h̄_d·(Σ_e h_e r̂_e) / (a + μ1·Σ_e |h_e|²)) / a`.
    pub fn solve_normal(&self, r: ArrayView4<T>, mu1: T, mu2: T, mu3: T) -> Result<Array4<T>> {
        self.check_padded("solve_normal", r, self.depth())?;
        let [ph, pw] = self.padded_shape;
        let half_w = pw / 2 + 1;
        let (depth, channels) = (self.depth(), self.channels());
        let mut out = Array4::zeros((depth, ph, pw, channels));
        for c in 0..channels {
            let mut spectra = (0..depth)
                .map(|d| self.rfft2(r.slice(s![d, .., .., c])))
                .collect::<Result<Vec<_>>>()?;
            for k in 0..ph {
                for l in 0..half_w {
                    let a = mu2 * self.laplacian[[k, l]] + mu3;
                    let denom = a + mu1 * self.power[[k, l, c]];
                    let coupled = spectra.iter().enumerate().fold(
                        Complex::<T>::zero(),
                        |acc, (d, spectrum)| acc + self.transfer[[d, k, l, c]] * spectrum[[k, l]],
                    );
                    let coupled = coupled * (mu1 / denom);
                    for (d, spectrum) in spectra.iter_mut().enumerate() {
                        let h = self.transfer[[d, k, l, c]];
                        spectrum[[k, l]] = (spectrum[[k, l]] - h.conj() * coupled) / a;
                    }
                }
            }
            for (d, spectrum) in spectra.into_iter().enumerate() {
                out.slice_mut(s![d, .., .., c])
                    .assign(&self.irfft2(spectrum)?);
            }
        }
        Ok(out)
    }

    /// Measurement check used by `set_data`: shape must be `(1, H, W, C)`.
    pub fn check_measurement(&self, y: ArrayView4<T>) -> Result<()> {
        self.check_image("set_data", y, 1)
    }

    fn check_image(&self, context: &'static str, x: ArrayView4<T>, depth: usize) -> Result<()> {
        let [_, h, w, c] = self.psf_shape;
        let expected = [depth, h, w, c];
        if x.shape() != expected {
            return Err(ReconError::shape(context, &expected, x.shape()));
        }
        Ok(())
    }

    fn check_padded(&self, context: &'static str, x: ArrayView4<T>, depth: usize) -> Result<()> {
        let [ph, pw] = self.padded_shape;
        let expected = [depth, ph, pw, self.channels()];
        if x.shape() != expected {
            return Err(ReconError::shape(context, &expected, x.shape()));
        }
        Ok(())
    }

    /// 2-D real FFT of one padded plane, `(Hp, Wp) → (Hp, Wp/2 + 1)`.
    fn rfft2(&self, plane: ArrayView2<T>) -> Result<Array2<Complex<T>>> {
        let [ph, pw] = self.padded_shape;
        let mut spectrum = Array2::<Complex<T>>::zeros((ph, pw / 2 + 1));
        let mut row_in = self.r2c.make_input_vec();
        let mut row_out = self.r2c.make_output_vec();
        for (row, mut out) in plane.outer_iter().zip(spectrum.outer_iter_mut()) {
            row_in
                .iter_mut()
                .zip(row.iter())
                .for_each(|(dst, &src)| *dst = src);
            self.r2c.process(&mut row_in, &mut row_out)?;
            out.iter_mut()
                .zip(row_out.iter())
                .for_each(|(dst, &src)| *dst = src);
        }
        let mut column = vec![Complex::<T>::zero(); ph];
        for mut col in spectrum.columns_mut() {
            column
                .iter_mut()
                .zip(col.iter())
                .for_each(|(dst, &src)| *dst = src);
            self.column_forward.process(&mut column);
            col.iter_mut()
                .zip(column.iter())
                .for_each(|(dst, &src)| *dst = src);
        }
        Ok(spectrum)
    }

    /// Inverse of [`Self::rfft2`], including the `1 / (Hp·Wp)` normalisation.
    fn irfft2(&self, mut spectrum: Array2<Complex<T>>) -> Result<Array2<T>> {
        let [ph, pw] = self.padded_shape;
        let mut column = vec![Complex::<T>::zero(); ph];
        for mut col in spectrum.columns_mut() {
            column
                .iter_mut()
                .zip(col.iter())
                .for_each(|(dst, &src)| *dst = src);
            self.column_inverse.process(&mut column);
            col.iter_mut()
                .zip(column.iter())
                .for_each(|(dst, &src)| *dst = src);
        }

        let scale = T::one() / T::cast((ph * pw) as f64);
        let mut plane = Array2::<T>::zeros((ph, pw));
        let mut row_in = self.c2r.make_input_vec();
        let mut row_out = self.c2r.make_output_vec();
        let last = pw / 2;
        for (row, mut out) in spectrum.outer_iter().zip(plane.outer_iter_mut()) {
            row_in
                .iter_mut()
                .zip(row.iter())
                .for_each(|(dst, &src)| *dst = src);
            // DC and Nyquist bins of a real row are real, c2r rejects rounding noise there
            row_in[0].im = T::zero();
            if pw % 2 == 0 {
                row_in[last].im = T::zero();
            }
            self.c2r.process(&mut row_in, &mut row_out)?;
            out.iter_mut()
                .zip(row_out.iter())
                .for_each(|(dst, &src)| *dst = src * scale);
        }
        Ok(plane)
    }
}
