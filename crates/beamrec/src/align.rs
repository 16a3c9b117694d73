//! Multi-stream alignment
//!
//! Brings every port's first buffered packet onto the same target packet
//! number. Streams may start at different times and lose different
//! packets, so each port is caught up with extra reads, then searched for
//! the exact target: a no-loss guess first, a bounded binary search with a
//! widen-on-miss loop when packets are missing.

use tracing::{debug, trace, warn};

use crate::error::ReaderError;
use crate::reader::{Progress, Reader};

/// Widen-on-miss attempts before declaring the target unreachable.
const MAX_WIDEN_ATTEMPTS: usize = 16;

impl Reader {
    /// Align every port's slot 0 onto `meta.last_packet`.
    ///
    /// On success every port buffer starts at the target packet and is
    /// completely filled.
    pub(crate) fn skip_to_packet(&mut self) -> Result<(), ReaderError> {
        let m = self.meta.packets_per_iteration;
        let last_slot = (m - 1) as isize;
        let target = self.meta.last_packet;

        debug!(target, "scanning streams towards the target packet");

        // The target must not lie before any stream's first packet.
        for p in 0..self.meta.num_ports {
            let first = self.ports[p].buffer.packet_number_at(0);
            if first > target {
                warn!(
                    port = p,
                    first, target, "requested packet precedes the capture on this port"
                );
                return Err(ReaderError::AlignmentImpossible { port: p, target });
            }
        }

        // Seed the per-port read skips from the current de-sync.
        self.update_scan_skips(target, None);

        // Catch every port up until its buffer covers the target.
        for p in 0..self.meta.num_ports {
            let mut current = self.ports[p].buffer.packet_number_at(last_slot);
            while current < self.meta.last_packet {
                trace!(port = p, current, "reading ahead towards the target");
                let progress = self.read_step()?;
                current = self.ports[p].buffer.packet_number_at(last_slot);
                self.update_scan_skips(self.meta.last_packet, Some(current));
                if current < self.meta.last_packet
                    && matches!(progress, Progress::EndOfData | Progress::PacketCapReached)
                {
                    return Err(ReaderError::AlignmentImpossible {
                        port: p,
                        target: self.meta.last_packet,
                    });
                }
            }

            if self.ports[p].buffer.packet_number_at(0) > self.meta.last_packet {
                warn!(
                    port = p,
                    target = self.meta.last_packet,
                    start = self.ports[p].buffer.packet_number_at(0),
                    "scanned beyond the target packet"
                );
                return Err(ReaderError::AlignmentImpossible {
                    port: p,
                    target: self.meta.last_packet,
                });
            }
        }

        // Locate the target inside each port and shift it to slot 0.
        for p in 0..self.meta.num_ports {
            let shift = self.locate_target(p)?;

            let mut shifts = vec![0i64; self.meta.num_ports];
            shifts[p] = shift;
            self.shift_remainder(&shifts, false);

            let offset = self.ports[p].data_offset;
            let want = m * self.ports[p].packet_len - offset;
            if want > 0 {
                let region = &mut self.ports[p].buffer.fill_region(offset)[..want];
                let got = self.inputs[p].read(region)?;
                if got < want {
                    warn!(port = p, "unable to refill the buffer after alignment");
                    return Err(ReaderError::AlignmentImpossible {
                        port: p,
                        target: self.meta.last_packet,
                    });
                }
            }
            self.ports[p].data_offset = 0;
        }

        Ok(())
    }

    /// Mark ports that are already at or past the target so the next read
    /// skips them (wholly or partially).
    fn update_scan_skips(&mut self, target: i64, reference: Option<i64>) {
        let m = self.meta.packets_per_iteration;
        let last_slot = (m - 1) as isize;

        for p in 0..self.meta.num_ports {
            let port_last = self.ports[p].buffer.packet_number_at(last_slot);
            let skip = if port_last >= target {
                m as i64
            } else {
                let reference =
                    reference.unwrap_or_else(|| self.ports[p].buffer.packet_number_at(0));
                (port_last - (reference + m as i64)).max(0)
            };
            if skip > m as i64 {
                warn!(
                    port = p,
                    lost = skip,
                    "large packet loss during the alignment scan"
                );
            }
            self.ports[p].last_dropped = skip;
        }
    }

    /// Find the slot holding `meta.last_packet` on `port` and return the
    /// tail shift that brings it to slot 0.
    fn locate_target(&mut self, port: usize) -> Result<i64, ReaderError> {
        let m = self.meta.packets_per_iteration as i64;
        let buffer = &self.ports[port].buffer;

        let current = buffer.packet_number_at(0);
        let mut target = self.meta.last_packet;

        // No-loss guess: the target sits exactly its distance from the
        // first packet.
        let delta = (target - current).clamp(0, m - 1);
        if target - current != delta {
            warn!(
                port,
                target, current, "target out of window, clamping the first probe"
            );
        }
        let mut guess = buffer.packet_number_at(delta as isize);
        if guess == target {
            trace!(port, shift = m - delta, "no-loss alignment hit");
            return Ok(m - delta);
        }

        // Packet loss shifted everything: binary search, widening the
        // window (and advancing the target) when the search collapses.
        if guess > target {
            guess = current;
        }
        let mut start = guess - current;
        let mut end = m;
        let mut next = start;
        let mut widens = 0usize;

        while guess != target {
            start = start.clamp(0, m);
            end = end.clamp(0, m);
            next = (start + end) / 2;
            if next >= m {
                return Err(ReaderError::AlignmentImpossible { port, target });
            }

            guess = self.ports[port].buffer.packet_number_at(next as isize);
            trace!(port, next, guess, target, "alignment probe");

            if guess > target {
                end = next - 1;
            } else if guess < target {
                start = next + 1;
            } else {
                break;
            }

            if start > end {
                widens += 1;
                if widens > MAX_WIDEN_ATTEMPTS {
                    return Err(ReaderError::AlignmentImpossible { port, target });
                }
                warn!(
                    port,
                    target,
                    retry = target + 1,
                    "target packet absent from the stream, trying its successor"
                );
                self.meta.last_packet += 1;
                target += 1;
                start -= 10;
                end += 10;
            }
        }

        Ok(m - next)
    }

    /// Establish the common first packet across all ports: the highest
    /// first-buffered packet number wins, everyone else skips forward.
    pub(crate) fn first_packet_alignment(&mut self) -> Result<(), ReaderError> {
        for p in 0..self.meta.num_ports {
            self.ports[p].last_dropped = 0;
            self.ports[p].total_dropped = 0;
            let first = self.ports[p].buffer.packet_number_at(0);
            if first > self.meta.last_packet {
                self.meta.last_packet = first;
            }
        }

        debug!(
            first_packet = self.meta.last_packet,
            "aligning all ports onto the common first packet"
        );
        self.skip_to_packet()?;

        // The kernels expect `last_packet` to name the packet before the
        // iteration's first slot.
        self.meta.last_packet -= 1;
        Ok(())
    }
}
