use std::sync::Arc;

use anyhow::{Context, Result, bail};
use embedded_can::StandardId;

use virtcan::proto::frame::{CAN_MAX_DLEN, FdFlags, is_valid_fd_len};
use virtcan::sim::SimHost;
use virtcan::{CanFrame, VirtCanDevice};

use crate::cli::LoopbackOpts;
use crate::console::ConsoleNet;

/// Frame `seq`: identifier and payload both derived from the sequence number.
fn build_frame(seq: u32, len: usize, fd: bool) -> Option<CanFrame> {
    let id = StandardId::new((seq % 0x800) as u16)?;
    let data: Vec<u8> = (0..len).map(|i| seq.wrapping_add(i as u32) as u8).collect();
    if fd {
        CanFrame::new_fd(id, &data, FdFlags::BRS)
    } else {
        CanFrame::new(id, &data)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    ok: usize,
    bad: usize,
    lost: usize,
}

fn verify(sent: &[CanFrame], received: &[CanFrame], debug: bool) -> Tally {
    let mut t = Tally::default();
    for (i, (want, got)) in sent.iter().zip(received).enumerate() {
        if want == got {
            t.ok += 1;
        } else {
            t.bad += 1;
            if debug {
                log::warn!("[BAD ] #{} got={:?} want={:?}", i, got, want);
            }
        }
    }
    t.lost = sent.len().saturating_sub(received.len());
    if debug && t.lost > 0 {
        log::warn!("[LOST] {} frames never came back", t.lost);
    }
    t
}

pub fn run(opts: LoopbackOpts) -> Result<()> {
    let config = opts.dev.config()?;
    let fd = opts.dev.fd;
    let len_ok = if fd {
        is_valid_fd_len(opts.len)
    } else {
        opts.len <= CAN_MAX_DLEN
    };
    if !len_ok {
        bail!("len {} is not a valid {} payload", opts.len, if fd { "FD" } else { "classic" });
    }

    let host = Arc::new(
        SimHost::builder()
            .features(opts.dev.host_features())
            .queue_size(opts.dev.queue_size)
            .loopback(true)
            .build(),
    );
    let net = Arc::new(ConsoleNet::default());
    let dev = VirtCanDevice::probe(host.clone(), net.clone(), config).context("probe")?;
    dev.open().context("open")?;

    // Never more in flight than the receive queue can take back.
    let burst = u32::from(opts.dev.queue_size.max(1));
    let mut sent = Vec::with_capacity(opts.frames as usize);
    let mut cycles = 0u64;
    let mut seq = 0u32;
    while seq < opts.frames {
        let end = seq.saturating_add(burst).min(opts.frames);
        for s in seq..end {
            let frame = build_frame(s, opts.len, fd).context("build frame")?;
            dev.transmit(&frame)
                .with_context(|| format!("transmit #{s}"))?;
            sent.push(frame);
        }
        seq = end;

        loop {
            cycles += 1;
            if !dev.poll().context("poll")?.reschedule {
                break;
            }
        }
    }

    let received = net.take_received();
    let tally = verify(&sent, &received, opts.debug);
    log::info!(
        "[loopback] sent={} ok={} bad={} lost={} poll_cycles={} undeliverable={}",
        sent.len(),
        tally.ok,
        tally.bad,
        tally.lost,
        cycles,
        host.tx_undeliverable()
    );

    dev.close().context("close")?;
    dev.remove();
    if tally.bad > 0 || tally.lost > 0 {
        bail!("{} bad, {} lost", tally.bad, tally.lost);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_follow_sequence() {
        let f = build_frame(0x801, 3, false).unwrap();
        assert_eq!(f.data(), &[0x01, 0x02, 0x03]);
        assert!(build_frame(0, 9, false).is_none());
        assert!(build_frame(0, 12, true).unwrap().is_fd());
    }

    #[test]
    fn verify_counts_bad_and_lost() {
        let sent: Vec<CanFrame> = (0..4).filter_map(|s| build_frame(s, 2, false)).collect();
        let mut received = sent[..3].to_vec();
        received[1] = build_frame(9, 2, false).unwrap();
        assert_eq!(
            verify(&sent, &received, false),
            Tally {
                ok: 2,
                bad: 1,
                lost: 1
            }
        );
    }
}
