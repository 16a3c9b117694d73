//! Per-packet emit layouts
//!
//! Each layout places one aligned packet's samples into the iteration's
//! output arrays. The layouts are pure index arithmetic over the shared
//! output blocks; gap handling happens in the port loop, which feeds them a
//! replayed or zeroed source region for missing packets.
//!
//! Axis conventions, with `M` packets per iteration, `T` processed channels
//! and 16 time slices per packet:
//!
//! - channel-major: `[packet, ts, channel, pol]`, the channel index varies
//!   fastest across the polarization axis;
//! - reversed channel-major: as above with channel `T - 1 - c` (radio
//!   convention, highest frequency first);
//! - time-major: `[channel, packet, ts, pol]`, each channel's samples for
//!   the whole iteration are contiguous.

use rsp::TIME_SLICES;

use super::quads::QuadSource;
use super::stokes::StokesOp;
use crate::output::OutSample;

/// Per-port kernel geometry.
#[derive(Debug, Clone)]
pub(crate) struct Geom {
    /// First on-wire beamlet this port contributes.
    pub base: usize,
    /// One past the last contributed beamlet.
    pub upper: usize,
    /// Processed channels contributed by earlier ports.
    pub cumulative: usize,
    /// Processed channels across all ports.
    pub total: usize,
    /// Packets in this iteration.
    pub m: usize,
    /// Elements one packet contributes per output array.
    pub packet_out_elems: usize,
    /// This port's index (selects the output array for copy modes).
    pub port: usize,
}

/// A layout writes one packet into the outputs.
pub(crate) trait Layout<O: OutSample>: Sync {
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize);
}

/// Shared view of one output block for the parallel port region.
///
/// Every port writes a disjoint index set (the arithmetic in this module
/// partitions all layouts by the port's channel range, and for copy modes
/// by the port-indexed output array), so concurrent `write` calls never
/// alias. `write` bounds-checks the index; the disjointness itself is the
/// layouts' invariant.
pub(crate) struct SharedOut<'a, O> {
    ptr: *mut O,
    len: usize,
    _life: std::marker::PhantomData<&'a mut [O]>,
}

// Safety: see the type docs. Writers target disjoint indices, and the
// blocks outlive the parallel region through the borrow held by `_life`.
unsafe impl<O: Send> Send for SharedOut<'_, O> {}
unsafe impl<O: Send> Sync for SharedOut<'_, O> {}

impl<'a, O: OutSample> SharedOut<'a, O> {
    pub(crate) fn new(slice: &'a mut [O]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _life: std::marker::PhantomData,
        }
    }

    #[inline]
    pub(crate) fn write(&self, idx: usize, value: O) {
        assert!(idx < self.len, "output write out of bounds");
        // Safety: in-bounds per the assert; disjoint across threads per the
        // type invariant.
        unsafe { self.ptr.add(idx).write(value) }
    }

    #[inline]
    pub(crate) fn write_from(&self, at: usize, src: &[O]) {
        assert!(at + src.len() <= self.len, "output write out of bounds");
        // Safety: in-bounds per the assert; disjoint across threads per the
        // type invariant; src borrows the input buffer, never an output.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(at), src.len()) }
    }
}

/// Modes 0/1: verbatim byte copy into the port's own output.
pub(crate) struct RawCopy;

impl Layout<u8> for RawCopy {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, u8>], data: &[u8], slot: usize, off: usize) {
        let len = geom.packet_out_elems;
        outs[geom.port].write_from(slot * len, &data[off..off + len]);
    }
}

/// Mode 2: one output per polarization component, `[packet, channel, ts]`.
pub(crate) struct SplitPols<Q> {
    pub src: Q,
}

impl<O: OutSample, Q: QuadSource<O>> Layout<O> for SplitPols<Q> {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize) {
        let slot_off = slot * geom.packet_out_elems;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = slot_off + channel * TIME_SLICES;
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                outs[0].write(out, q[0]);
                outs[1].write(out, q[1]);
                outs[2].write(out, q[2]);
                outs[3].write(out, q[3]);
                out += 1;
            }
        }
    }
}

/// Modes 10/20: single output, `[packet, ts, channel, pol]`, optionally
/// with the channel axis reversed.
pub(crate) struct ChannelMajor<Q, const REVERSED: bool> {
    pub src: Q,
}

impl<O: OutSample, Q: QuadSource<O>, const REVERSED: bool> Layout<O> for ChannelMajor<Q, REVERSED> {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize) {
        let slot_off = slot * geom.packet_out_elems;
        let row = geom.total * 4;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let placed = if REVERSED {
                geom.total - 1 - channel
            } else {
                channel
            };
            let mut out = slot_off + placed * 4;
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                outs[0].write(out, q[0]);
                outs[0].write(out + 1, q[1]);
                outs[0].write(out + 2, q[2]);
                outs[0].write(out + 3, q[3]);
                out += row;
            }
        }
    }
}

/// Modes 11/21: four outputs, `[packet, ts, channel]` each, optionally
/// reversed.
pub(crate) struct ChannelMajorSplit<Q, const REVERSED: bool> {
    pub src: Q,
}

impl<O: OutSample, Q: QuadSource<O>, const REVERSED: bool> Layout<O>
    for ChannelMajorSplit<Q, REVERSED>
{
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize) {
        let slot_off = slot * geom.packet_out_elems;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let placed = if REVERSED {
                geom.total - 1 - channel
            } else {
                channel
            };
            let mut out = slot_off + placed;
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                outs[0].write(out, q[0]);
                outs[1].write(out, q[1]);
                outs[2].write(out, q[2]);
                outs[3].write(out, q[3]);
                out += geom.total;
            }
        }
    }
}

/// Mode 30: single output, `[channel, packet, ts, pol]`.
pub(crate) struct TimeMajor<Q> {
    pub src: Q,
}

impl<O: OutSample, Q: QuadSource<O>> Layout<O> for TimeMajor<Q> {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize) {
        let iteration_samples = geom.m * TIME_SLICES;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = 4 * (channel * iteration_samples + slot * TIME_SLICES);
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                outs[0].write(out, q[0]);
                outs[0].write(out + 1, q[1]);
                outs[0].write(out + 2, q[2]);
                outs[0].write(out + 3, q[3]);
                out += 4;
            }
        }
    }
}

/// Mode 31: four outputs (X-re, X-im, Y-re, Y-im), `[channel, packet, ts]`
/// each.
pub(crate) struct TimeMajorSplit<Q> {
    pub src: Q,
}

impl<O: OutSample, Q: QuadSource<O>> Layout<O> for TimeMajorSplit<Q> {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize) {
        let iteration_samples = geom.m * TIME_SLICES;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = channel * iteration_samples + slot * TIME_SLICES;
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                outs[0].write(out, q[0]);
                outs[1].write(out, q[1]);
                outs[2].write(out, q[2]);
                outs[3].write(out, q[3]);
                out += 1;
            }
        }
    }
}

/// Modes 32/35: two outputs, X and Y each as interleaved re/im pairs,
/// `[channel, packet, ts, re/im]`.
pub(crate) struct TimeMajorDual<Q> {
    pub src: Q,
}

impl<O: OutSample, Q: QuadSource<O>> Layout<O> for TimeMajorDual<Q> {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, O>], data: &[u8], slot: usize, off: usize) {
        let iteration_samples = geom.m * TIME_SLICES;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = 2 * (channel * iteration_samples + slot * TIME_SLICES);
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                outs[0].write(out, q[0]);
                outs[0].write(out + 1, q[1]);
                outs[1].write(out, q[2]);
                outs[1].write(out + 1, q[3]);
                out += 2;
            }
        }
    }
}

/// Modes 100-134: one Stokes parameter, reversed channel-major, summed over
/// `FACTOR` consecutive time slices.
pub(crate) struct StokesSingle<Q, S, const FACTOR: usize> {
    pub src: Q,
    pub _op: std::marker::PhantomData<S>,
}

impl<Q, S, const FACTOR: usize> StokesSingle<Q, S, FACTOR> {
    pub(crate) fn new(src: Q) -> Self {
        Self {
            src,
            _op: std::marker::PhantomData,
        }
    }
}

impl<Q: QuadSource<f32>, S: StokesOp, const FACTOR: usize> Layout<f32>
    for StokesSingle<Q, S, FACTOR>
{
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, f32>], data: &[u8], slot: usize, off: usize) {
        let slot_off = slot * geom.packet_out_elems;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = slot_off + geom.total - 1 - channel;
            let mut acc = 0.0f32;
            for ts in 0..TIME_SLICES {
                acc += S::compute(self.src.quad(data, off, beamlet, ts, channel));
                if (ts + 1) % FACTOR == 0 {
                    outs[0].write(out, acc);
                    acc = 0.0;
                    out += geom.total;
                }
            }
        }
    }
}

/// Modes 150-154: I, Q, U and V as four outputs.
pub(crate) struct StokesFull<Q, const FACTOR: usize> {
    pub src: Q,
}

impl<Q: QuadSource<f32>, const FACTOR: usize> Layout<f32> for StokesFull<Q, FACTOR> {
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, f32>], data: &[u8], slot: usize, off: usize) {
        use super::stokes::{StokesI, StokesQ, StokesU, StokesV};

        let slot_off = slot * geom.packet_out_elems;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = slot_off + geom.total - 1 - channel;
            let mut acc = [0.0f32; 4];
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                acc[0] += StokesI::compute(q);
                acc[1] += StokesQ::compute(q);
                acc[2] += StokesU::compute(q);
                acc[3] += StokesV::compute(q);
                if (ts + 1) % FACTOR == 0 {
                    outs[0].write(out, acc[0]);
                    outs[1].write(out, acc[1]);
                    outs[2].write(out, acc[2]);
                    outs[3].write(out, acc[3]);
                    acc = [0.0; 4];
                    out += geom.total;
                }
            }
        }
    }
}

/// Modes 160-164: a configured pair of Stokes parameters as two outputs.
pub(crate) struct StokesDual<Q, A, B, const FACTOR: usize> {
    pub src: Q,
    pub _ops: std::marker::PhantomData<(A, B)>,
}

impl<Q, A, B, const FACTOR: usize> StokesDual<Q, A, B, FACTOR> {
    pub(crate) fn new(src: Q) -> Self {
        Self {
            src,
            _ops: std::marker::PhantomData,
        }
    }
}

impl<Q: QuadSource<f32>, A: StokesOp, B: StokesOp, const FACTOR: usize> Layout<f32>
    for StokesDual<Q, A, B, FACTOR>
{
    #[inline]
    fn emit(&self, geom: &Geom, outs: &[SharedOut<'_, f32>], data: &[u8], slot: usize, off: usize) {
        let slot_off = slot * geom.packet_out_elems;
        for beamlet in geom.base..geom.upper {
            let channel = geom.cumulative + beamlet - geom.base;
            let mut out = slot_off + geom.total - 1 - channel;
            let mut acc = [0.0f32; 2];
            for ts in 0..TIME_SLICES {
                let q = self.src.quad(data, off, beamlet, ts, channel);
                acc[0] += A::compute(q);
                acc[1] += B::compute(q);
                if (ts + 1) % FACTOR == 0 {
                    outs[0].write(out, acc[0]);
                    outs[1].write(out, acc[1]);
                    acc = [0.0; 2];
                    out += geom.total;
                }
            }
        }
    }
}
