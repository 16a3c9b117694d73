//! Transform kernels
//!
//! One iteration walks every port's buffered packets in parallel, repairs
//! the packet sequence (out-of-order discards, replay or zero gap-fill) and
//! hands each aligned packet to the selected layout. Ports write disjoint
//! regions of the shared output arrays, so the port region needs no locks.

pub(crate) mod layouts;
pub(crate) mod quads;
pub(crate) mod stokes;

use rayon::prelude::*;
use rsp::{BitMode, Bit4, Bit8, Bit16, HEADER_LEN, InputFormat, SyntheticHeader};
use tracing::{debug, trace, warn};

use crate::ReaderError;
use crate::buffer::GUARD_PACKETS;
use crate::dispatch::{ProcessingMode, StokesParam};
use crate::meta::{ObsMeta, PortState};
use crate::output::{FromSample, OutSample, OutputBlock};

use layouts::{
    ChannelMajor, ChannelMajorSplit, Geom, Layout, RawCopy, SharedOut, SplitPols, StokesDual,
    StokesFull, StokesSingle, TimeMajor, TimeMajorDual, TimeMajorSplit,
};
use quads::{CalQuads, QuadSource, RawQuads};
use stokes::{StokesI, StokesOp, StokesQ, StokesU, StokesV};

/// Per-port outcome of one iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PortRun {
    /// Net dropped packets: gaps filled minus out-of-order discards.
    pub net_dropped: i64,
    /// Whether any output slot was synthesized.
    pub synthesized: bool,
}

struct LoopCtx {
    m: usize,
    last_packet: i64,
    replay: bool,
    /// Rewrite synthetic headers into the pad guard (header-carrying
    /// layouts only).
    patch_headers: bool,
    /// Bytes to skip from the packet start when emitting (0 when the layout
    /// wants the header too).
    header_offset: usize,
}

/// Walk one port's buffer for an iteration, dispatching every output slot
/// to `emit(raw, slot, offset)` with `offset` pointing into `raw` at the
/// packet region to read.
fn port_loop<E: FnMut(&[u8], usize, usize)>(
    ctx: &LoopCtx,
    port: &mut PortState,
    mut emit: E,
) -> PortRun {
    let ppl = port.packet_len as isize;
    let guard = (GUARD_PACKETS as isize) * ppl;
    let hdr = ctx.header_offset as isize;

    let mut last_packet = ctx.last_packet;
    let mut net_dropped: i64 = 0;
    let mut synthesized = false;

    // Input cursor (packet index) and the byte offsets of the candidate
    // packet and the last good packet's data region, both logical.
    let mut iwork = 0usize;
    let mut input: isize = 0;
    let mut last_input: isize = if ctx.replay { -ppl } else { -2 * ppl } + hdr;

    // Sequence continuation for runs of synthesized headers.
    let mut synth_ref: Option<[u8; HEADER_LEN]> = None;

    let mut current = port.buffer.packet_number_at(0);
    let mut slot = 0usize;

    while slot < ctx.m {
        let expected = last_packet + 1;
        if current != expected {
            if current < expected {
                // A packet from the past: it was already counted as missing
                // when its slot went by, so discard it and balance the drop
                // counter without touching the output cursor.
                trace!(packet = current, expected, "out-of-order packet discarded");
                net_dropped -= 1;
                iwork += 1;
                if iwork >= ctx.m {
                    break;
                }
                input = iwork as isize * ppl;
                current = port.buffer.packet_number_at(iwork as isize);
                continue;
            }

            // The expected packet is missing: synthesize this slot.
            net_dropped += 1;
            synthesized = true;
            last_packet = expected;

            let src = if ctx.replay {
                last_input
            } else {
                if ctx.patch_headers {
                    // Continue the timestamp/sequence progression from the
                    // previous header (real or synthetic) and mark the slot.
                    let base = synth_ref.unwrap_or_else(|| {
                        let at = (last_input - hdr + guard) as usize;
                        port.buffer.raw()[at..at + HEADER_LEN].try_into().unwrap()
                    });
                    let mut header = base;
                    SyntheticHeader::following(&base).write_into(&mut header);
                    port.buffer.slot_mut(-2)[..HEADER_LEN].copy_from_slice(&header);
                    synth_ref = Some(header);
                }
                -2 * ppl + hdr
            };
            emit(port.buffer.raw(), slot, (src + guard) as usize);
            slot += 1;
            continue;
        }

        // The expected packet: emit it and peek at the next buffered one.
        last_packet = current;
        last_input = input + hdr;
        synth_ref = None;
        emit(port.buffer.raw(), slot, (last_input + guard) as usize);
        slot += 1;

        iwork += 1;
        if slot >= ctx.m {
            break;
        }
        if iwork >= ctx.m {
            // Out-of-order discards consumed the whole read; the remaining
            // slots cannot be reconstructed this iteration.
            break;
        }
        input = iwork as isize * ppl;

        // Fast path: a direct successor advances the sequence by 16 within
        // the same second. Anything else (rollover, loss) re-derives.
        let raw = port.buffer.raw();
        let cand = (input + guard) as usize;
        let prev = (last_input - hdr + guard) as usize;
        let cand_seq = u32::from_le_bytes(raw[cand + 12..cand + 16].try_into().unwrap());
        let prev_seq = u32::from_le_bytes(raw[prev + 12..prev + 16].try_into().unwrap());
        if cand_seq == prev_seq.wrapping_add(16) {
            current += 1;
        } else {
            current = port.buffer.packet_number_at(iwork as isize);
        }
    }

    PortRun {
        net_dropped,
        synthesized,
    }
}

/// Run one layout over all ports in parallel.
fn run_ports<O: OutSample, L: Layout<O>>(
    meta: &ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    layout: &L,
    patch_headers: bool,
    header_offset: usize,
    per_port_outputs: bool,
) -> Vec<PortRun> {
    let elem = std::mem::size_of::<O>();
    let mut views: Vec<&mut [O]> = outputs.iter_mut().map(|b| O::slice_mut(b)).collect();
    let shared: Vec<SharedOut<'_, O>> = views.iter_mut().map(|v| SharedOut::new(v)).collect();
    let shared = &shared;

    let total = meta.total_proc_beamlets;
    let m = meta.packets_per_iteration;
    let last_packet = meta.last_packet;
    let replay = meta.replay_dropped_packets;
    let out_bytes = &meta.packet_output_bytes;

    ports
        .par_iter_mut()
        .enumerate()
        .map(|(p, port)| {
            let geom = Geom {
                base: port.base_beamlet,
                upper: port.upper_beamlet,
                cumulative: port.cumulative_beamlets,
                total,
                m,
                packet_out_elems: out_bytes[if per_port_outputs { p } else { 0 }] / elem,
                port: p,
            };
            let ctx = LoopCtx {
                m,
                last_packet,
                replay,
                patch_headers,
                header_offset,
            };
            port_loop(&ctx, port, |data, slot, off| {
                layout.emit(&geom, shared, data, slot, off)
            })
        })
        .collect()
}

/// Select the Stokes decimation specialization.
macro_rules! with_factor {
    ($decimation:expr, $factor:ident => $body:expr) => {
        match $decimation {
            0 => {
                const $factor: usize = 1;
                $body
            }
            1 => {
                const $factor: usize = 2;
                $body
            }
            2 => {
                const $factor: usize = 4;
                $body
            }
            3 => {
                const $factor: usize = 8;
                $body
            }
            _ => {
                const $factor: usize = 16;
                $body
            }
        }
    };
}

fn run_stokes_single<Q, S>(
    meta: &ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    src: impl Fn() -> Q,
    decimation: u8,
    _op: S,
) -> Vec<PortRun>
where
    Q: QuadSource<f32>,
    S: StokesOp,
{
    with_factor!(decimation, FACTOR => {
        let layout = StokesSingle::<Q, S, FACTOR>::new(src());
        run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
    })
}

fn run_stokes_full<Q: QuadSource<f32>>(
    meta: &ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    src: impl Fn() -> Q,
    decimation: u8,
) -> Vec<PortRun> {
    with_factor!(decimation, FACTOR => {
        let layout = StokesFull::<Q, FACTOR> { src: src() };
        run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
    })
}

fn run_stokes_dual<Q, A, B>(
    meta: &ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    src: impl Fn() -> Q,
    decimation: u8,
    _ops: (A, B),
) -> Vec<PortRun>
where
    Q: QuadSource<f32>,
    A: StokesOp,
    B: StokesOp,
{
    with_factor!(decimation, FACTOR => {
        let layout = StokesDual::<Q, A, B, FACTOR>::new(src());
        run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
    })
}

/// Dispatch a dual-Stokes pair through its zero-sized operators.
fn dual_pair<Q: QuadSource<f32>>(
    meta: &ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    src: impl Fn() -> Q,
    decimation: u8,
    pair: (StokesParam, StokesParam),
) -> Vec<PortRun> {
    macro_rules! second {
        ($a:expr) => {
            match pair.1 {
                StokesParam::I => run_stokes_dual(meta, ports, outputs, src, decimation, ($a, StokesI)),
                StokesParam::Q => run_stokes_dual(meta, ports, outputs, src, decimation, ($a, StokesQ)),
                StokesParam::U => run_stokes_dual(meta, ports, outputs, src, decimation, ($a, StokesU)),
                StokesParam::V => run_stokes_dual(meta, ports, outputs, src, decimation, ($a, StokesV)),
            }
        };
    }
    match pair.0 {
        StokesParam::I => second!(StokesI),
        StokesParam::Q => second!(StokesQ),
        StokesParam::U => second!(StokesU),
        StokesParam::V => second!(StokesV),
    }
}

/// Instantiate the mode's layout over one input format and run it.
fn run_format<F>(
    meta: &ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    jones: Option<&[f32]>,
) -> Vec<PortRun>
where
    F: InputFormat,
    F::Sample: OutSample + FromSample<F::Sample>,
    f32: FromSample<F::Sample>,
{
    macro_rules! layout_arm {
        ($layout:ident) => {
            match jones {
                None => {
                    let layout = $layout {
                        src: RawQuads::<F>::new(),
                    };
                    run_ports::<F::Sample, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
                }
                Some(row) => {
                    let layout = $layout {
                        src: CalQuads::<F>::new(row),
                    };
                    run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
                }
            }
        };
        ($layout:ident < $rev:literal >) => {
            match jones {
                None => {
                    let layout = $layout::<_, $rev> {
                        src: RawQuads::<F>::new(),
                    };
                    run_ports::<F::Sample, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
                }
                Some(row) => {
                    let layout = $layout::<_, $rev> {
                        src: CalQuads::<F>::new(row),
                    };
                    run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
                }
            }
        };
    }

    macro_rules! stokes_arm {
        ($call:expr) => {
            match jones {
                None => {
                    let src = || RawQuads::<F>::new();
                    $call(src)
                }
                Some(row) => {
                    let src = || CalQuads::<F>::new(row);
                    $call(src)
                }
            }
        };
    }

    match meta.processing_mode {
        ProcessingMode::PacketCopy => {
            run_ports::<u8, _>(meta, ports, outputs, &RawCopy, true, 0, true)
        }
        ProcessingMode::PayloadCopy => {
            run_ports::<u8, _>(meta, ports, outputs, &RawCopy, false, HEADER_LEN, true)
        }
        ProcessingMode::SplitPols => layout_arm!(SplitPols),
        ProcessingMode::ChannelMajor => layout_arm!(ChannelMajor<false>),
        ProcessingMode::ChannelMajorSplit => layout_arm!(ChannelMajorSplit<false>),
        ProcessingMode::ReversedChannelMajor => layout_arm!(ChannelMajor<true>),
        ProcessingMode::ReversedChannelMajorSplit => layout_arm!(ChannelMajorSplit<true>),
        ProcessingMode::TimeMajor => layout_arm!(TimeMajor),
        ProcessingMode::TimeMajorSplit => layout_arm!(TimeMajorSplit),
        ProcessingMode::TimeMajorDual => layout_arm!(TimeMajorDual),
        ProcessingMode::TimeMajorDualFloat => match jones {
            None => {
                let layout = TimeMajorDual {
                    src: RawQuads::<F>::new(),
                };
                run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
            }
            Some(row) => {
                let layout = TimeMajorDual {
                    src: CalQuads::<F>::new(row),
                };
                run_ports::<f32, _>(meta, ports, outputs, &layout, false, HEADER_LEN, false)
            }
        },
        ProcessingMode::Stokes { param, decimation } => stokes_arm!(|src| match param {
            StokesParam::I => run_stokes_single(meta, ports, outputs, src, decimation, StokesI),
            StokesParam::Q => run_stokes_single(meta, ports, outputs, src, decimation, StokesQ),
            StokesParam::U => run_stokes_single(meta, ports, outputs, src, decimation, StokesU),
            StokesParam::V => run_stokes_single(meta, ports, outputs, src, decimation, StokesV),
        }),
        ProcessingMode::StokesFull { decimation } => {
            stokes_arm!(|src| run_stokes_full(meta, ports, outputs, src, decimation))
        }
        ProcessingMode::StokesDual { decimation } => stokes_arm!(|src| dual_pair(
            meta,
            ports,
            outputs,
            src,
            decimation,
            meta.dual_stokes_pair
        )),
    }
}

/// Process one iteration's aligned buffers into the outputs.
///
/// Returns whether any packet had to be synthesized. Fatal drop imbalances
/// surface as [`ReaderError::DataIntegrity`]; the per-port counters are
/// updated either way.
pub(crate) fn run(
    meta: &mut ObsMeta,
    ports: &mut [PortState],
    outputs: &mut [OutputBlock],
    jones: Option<&[f32]>,
) -> Result<bool, ReaderError> {
    let runs = match meta.input_bit_mode {
        BitMode::Bits4 => run_format::<Bit4>(meta, ports, outputs, jones),
        BitMode::Bits8 => run_format::<Bit8>(meta, ports, outputs, jones),
        BitMode::Bits16 => run_format::<Bit16>(meta, ports, outputs, jones),
    };

    let m = meta.packets_per_iteration;
    let mut drops_occurred = false;
    let mut fatal = None;
    for (p, (run, port)) in runs.iter().zip(ports.iter_mut()).enumerate() {
        port.last_dropped = run.net_dropped;
        port.total_dropped += run.net_dropped;
        drops_occurred |= run.synthesized || run.net_dropped != 0;
        if run.net_dropped != 0 {
            debug!(
                port = p,
                dropped = run.net_dropped,
                total = port.total_dropped,
                "packet loss during iteration"
            );
        }
        if (run.net_dropped as f64) < -0.001 * m as f64 && fatal.is_none() {
            warn!(
                port = p,
                excess = -run.net_dropped,
                "large out-of-order packet balance; data integrity is compromised"
            );
            fatal = Some(ReaderError::DataIntegrity {
                port: p,
                excess: -run.net_dropped,
            });
        }
    }
    if let Some(err) = fatal {
        return Err(err);
    }

    meta.last_packet += m as i64;
    meta.input_ready = false;
    meta.output_ready = true;
    Ok(drops_occurred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PortBuffer;

    const PPL: usize = 16 + 64; // one beamlet, 8-bit

    fn header_into(slot: &mut [u8], seq: u32) {
        slot[0] = 3;
        slot[1] = 0x80;
        slot[2] = 0x01;
        slot[6] = 1;
        slot[7] = 16;
        slot[8..12].copy_from_slice(&1_600_000_000u32.to_le_bytes());
        slot[12..16].copy_from_slice(&seq.to_le_bytes());
    }

    fn port_with_sequences(seqs: &[u32], m: usize) -> PortState {
        let mut buffer = PortBuffer::new(PPL, m);
        for (i, &seq) in seqs.iter().enumerate() {
            let slot = buffer.slot_mut(i as isize);
            header_into(slot, seq);
            slot[16..].fill(seq as u8);
        }
        PortState {
            packet_len: PPL,
            raw_beamlets: 1,
            base_beamlet: 0,
            upper_beamlet: 1,
            cumulative_beamlets: 0,
            raw_cumulative_beamlets: 0,
            last_dropped: 0,
            total_dropped: 0,
            data_offset: 0,
            buffer,
        }
    }

    fn first_packet(seq: u32) -> i64 {
        let mut h = [0u8; 16];
        header_into(&mut h, seq);
        rsp::packet_number(&h)
    }

    #[test]
    fn contiguous_packets_emit_in_order() {
        let m = 4;
        let mut port = port_with_sequences(&[0, 16, 32, 48], m);
        let ctx = LoopCtx {
            m,
            last_packet: first_packet(0) - 1,
            replay: false,
            patch_headers: false,
            header_offset: HEADER_LEN,
        };
        let mut slots = Vec::new();
        let run = port_loop(&ctx, &mut port, |data, slot, off| {
            slots.push((slot, data[off]));
        });
        assert_eq!(run.net_dropped, 0);
        assert!(!run.synthesized);
        assert_eq!(slots, vec![(0, 0), (1, 16), (2, 32), (3, 48)]);
    }

    #[test]
    fn missing_packet_zero_pads_from_the_guard() {
        let m = 4;
        // Sequence 32 is missing; 48 and 64 close the iteration.
        let mut port = port_with_sequences(&[0, 16, 48, 64], m);
        let ctx = LoopCtx {
            m,
            last_packet: first_packet(0) - 1,
            replay: false,
            patch_headers: false,
            header_offset: HEADER_LEN,
        };
        let mut values = Vec::new();
        let run = port_loop(&ctx, &mut port, |data, _slot, off| {
            values.push(data[off]);
        });
        assert_eq!(run.net_dropped, 1);
        assert!(run.synthesized);
        // Slot 2 read zeroed guard bytes.
        assert_eq!(values, vec![0, 16, 0, 48]);
    }

    #[test]
    fn missing_packet_replays_the_previous_one() {
        let m = 4;
        let mut port = port_with_sequences(&[0, 16, 48, 64], m);
        let ctx = LoopCtx {
            m,
            last_packet: first_packet(0) - 1,
            replay: true,
            patch_headers: false,
            header_offset: HEADER_LEN,
        };
        let mut values = Vec::new();
        let run = port_loop(&ctx, &mut port, |data, _slot, off| {
            values.push(data[off]);
        });
        assert_eq!(run.net_dropped, 1);
        assert_eq!(values, vec![0, 16, 16, 48]);
    }

    #[test]
    fn out_of_order_packet_is_discarded() {
        let m = 4;
        // Sequence 16 arrives again after 32.
        let mut port = port_with_sequences(&[0, 16, 32, 16], m);
        let ctx = LoopCtx {
            m,
            last_packet: first_packet(0) - 1,
            replay: false,
            patch_headers: false,
            header_offset: HEADER_LEN,
        };
        let mut slots = Vec::new();
        let run = port_loop(&ctx, &mut port, |data, slot, off| {
            slots.push((slot, data[off]));
        });
        // Three slots filled from input, the duplicate balanced the counter
        // and the input ran dry before slot 3.
        assert_eq!(run.net_dropped, -1);
        assert_eq!(slots, vec![(0, 0), (1, 16), (2, 32)]);
    }

    #[test]
    fn synthetic_headers_progress_monotonically() {
        let m = 4;
        // Sequences 32 and 48 are missing; slots 2 and 3 must both be
        // synthesized, the second continuing from the first synthetic
        // header rather than the last real one.
        let mut port = port_with_sequences(&[0, 16, 64, 80], m);
        let ctx = LoopCtx {
            m,
            last_packet: first_packet(0) - 1,
            replay: false,
            patch_headers: true,
            header_offset: 0,
        };
        let mut headers = Vec::new();
        let run = port_loop(&ctx, &mut port, |data, slot, off| {
            headers.push((slot, rsp::packet_number(&data[off..off + HEADER_LEN])));
        });
        assert_eq!(run.net_dropped, 2);
        let base = first_packet(0);
        assert_eq!(
            headers,
            vec![(0, base), (1, base + 1), (2, base + 2), (3, base + 3)]
        );
        // The synthesized slots carry the marker.
        let guard = port.buffer.slot(-2);
        assert!(SyntheticHeader::is_marked(guard));
    }
}
