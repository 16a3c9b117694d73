//! Sample quadruple sources
//!
//! Layouts consume `(Xr, Xi, Yr, Yi)` quadruples; where the values come
//! from is abstracted so every layout exists in a raw-conversion and a
//! Jones-calibrated flavour without duplicating the loop bodies.

use std::marker::PhantomData;

use rsp::InputFormat;

use crate::calibration::apply_jones;
use crate::output::{FromSample, OutSample};

/// Supplies one sample quadruple per (beamlet, time slice).
///
/// `off` is the byte offset of the packet payload within `data`; `beamlet`
/// is the on-wire beamlet index; `channel` is the processed channel index
/// (used to pick calibration coefficients).
pub(crate) trait QuadSource<O: OutSample>: Sync {
    fn quad(&self, data: &[u8], off: usize, beamlet: usize, ts: usize, channel: usize) -> [O; 4];
}

/// Decode and widen, no calibration.
pub(crate) struct RawQuads<F>(PhantomData<F>);

impl<F> RawQuads<F> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<F, O> QuadSource<O> for RawQuads<F>
where
    F: InputFormat,
    O: FromSample<F::Sample>,
{
    #[inline]
    fn quad(&self, data: &[u8], off: usize, beamlet: usize, ts: usize, _channel: usize) -> [O; 4] {
        let at = off + F::sample_offset(beamlet, ts);
        F::quad(&data[at..at + F::QUAD_BYTES]).map(O::from_sample)
    }
}

/// Decode, then multiply by the channel's Jones matrix for the current
/// calibration step.
pub(crate) struct CalQuads<'a, F> {
    /// Flattened per-channel matrices of one step: `channels × 8` floats.
    jones: &'a [f32],
    _format: PhantomData<F>,
}

impl<'a, F> CalQuads<'a, F> {
    pub(crate) fn new(jones: &'a [f32]) -> Self {
        Self {
            jones,
            _format: PhantomData,
        }
    }
}

impl<F> QuadSource<f32> for CalQuads<'_, F>
where
    F: InputFormat,
    f32: FromSample<F::Sample>,
{
    #[inline]
    fn quad(&self, data: &[u8], off: usize, beamlet: usize, ts: usize, channel: usize) -> [f32; 4] {
        let at = off + F::sample_offset(beamlet, ts);
        let raw = F::quad(&data[at..at + F::QUAD_BYTES]).map(f32::from_sample);
        let matrix: &[f32; 8] = self.jones[channel * 8..channel * 8 + 8].try_into().unwrap();
        apply_jones(matrix, raw)
    }
}
