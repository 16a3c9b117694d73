//! Stokes parameter computation.

use crate::dispatch::StokesParam;

/// One Stokes parameter as a zero-sized type, so detection kernels
/// monomorphize per parameter.
pub(crate) trait StokesOp: Copy + Send + Sync + 'static {
    const PARAM: StokesParam;

    fn compute(quad: [f32; 4]) -> f32;
}

#[derive(Clone, Copy)]
pub(crate) struct StokesI;

#[derive(Clone, Copy)]
pub(crate) struct StokesQ;

#[derive(Clone, Copy)]
pub(crate) struct StokesU;

#[derive(Clone, Copy)]
pub(crate) struct StokesV;

impl StokesOp for StokesI {
    const PARAM: StokesParam = StokesParam::I;

    #[inline]
    fn compute([xr, xi, yr, yi]: [f32; 4]) -> f32 {
        xr * xr + xi * xi + yr * yr + yi * yi
    }
}

impl StokesOp for StokesQ {
    const PARAM: StokesParam = StokesParam::Q;

    #[inline]
    fn compute([xr, xi, yr, yi]: [f32; 4]) -> f32 {
        xr * xr + xi * xi - yr * yr - yi * yi
    }
}

impl StokesOp for StokesU {
    const PARAM: StokesParam = StokesParam::U;

    #[inline]
    fn compute([xr, xi, yr, yi]: [f32; 4]) -> f32 {
        2.0 * (xr * yr + xi * yi)
    }
}

impl StokesOp for StokesV {
    const PARAM: StokesParam = StokesParam::V;

    #[inline]
    fn compute([xr, xi, yr, yi]: [f32; 4]) -> f32 {
        2.0 * (xr * yi - xi * yr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarimetric_identity() {
        // I^2 = Q^2 + U^2 + V^2 for a pure dual-pol sample.
        for quad in [
            [3.0f32, -1.0, 2.0, 0.5],
            [1.0, 0.0, 0.0, 0.0],
            [-2.5, 4.0, 1.25, -3.0],
        ] {
            let i = StokesI::compute(quad);
            let q = StokesQ::compute(quad);
            let u = StokesU::compute(quad);
            let v = StokesV::compute(quad);
            assert!((i * i - (q * q + u * u + v * v)).abs() < 1e-3 * i * i);
        }
    }

    #[test]
    fn pure_polarizations() {
        // X-only power: Q = +I, U = V = 0.
        let quad = [3.0f32, 4.0, 0.0, 0.0];
        assert_eq!(StokesI::compute(quad), 25.0);
        assert_eq!(StokesQ::compute(quad), 25.0);
        assert_eq!(StokesU::compute(quad), 0.0);
        assert_eq!(StokesV::compute(quad), 0.0);

        // Y-only power: Q = -I.
        let quad = [0.0f32, 0.0, 3.0, 4.0];
        assert_eq!(StokesQ::compute(quad), -25.0);
    }
}
