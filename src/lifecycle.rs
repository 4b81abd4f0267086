use std::sync::Arc;

use anyhow::{Context, Result};
use embedded_can::StandardId;

use virtcan::proto::command::{ChipOp, CtrlCommand, VIRTIO_CAN_ERR};
use virtcan::sim::{HostAck, SimHost};
use virtcan::{CanFrame, Features, VirtCanDevice};

use crate::cli::LifecycleOpts;
use crate::console::ConsoleNet;

pub fn run(opts: LifecycleOpts) -> Result<()> {
    log::info!("lifecycle: {:?}", opts);
    let config = opts.dev.config()?;

    let mut features = opts.dev.host_features();
    if opts.no_ctrl_vq {
        features.remove(Features::CTRL_VQ);
    }
    let host = Arc::new(
        SimHost::builder()
            .features(features)
            .queue_size(opts.dev.queue_size)
            .build(),
    );
    for _ in 0..opts.fail_enable {
        host.script_ack(
            CtrlCommand::Chip(ChipOp::Enable),
            HostAck::Write(VIRTIO_CAN_ERR),
        );
    }
    let net = Arc::new(ConsoleNet::default());

    let dev = VirtCanDevice::probe(host.clone(), net, config).context("probe")?;
    log::info!("state {:?}, chip {:?}", dev.state(), dev.chip_state());

    let result = walk(&dev);
    dev.remove();
    log::info!("host saw: {:?}", host.commands());
    result
}

fn walk(dev: &VirtCanDevice<SimHost, ConsoleNet>) -> Result<()> {
    let id = StandardId::new(0x123).context("frame id")?;
    let frame = CanFrame::new(id, &[0xDE, 0xAD, 0xBE, 0xEF]).context("frame")?;

    dev.open().context("open")?;
    dev.transmit(&frame).context("transmit")?;
    log::info!("open: state {:?}, chip {:?}", dev.state(), dev.chip_state());

    dev.freeze().context("freeze (open)")?;
    log::info!("frozen: chip {:?}", dev.chip_state());
    dev.restore().context("restore (open)")?;
    log::info!("restored: state {:?}, chip {:?}", dev.state(), dev.chip_state());

    dev.close().context("close")?;
    dev.freeze().context("freeze (closed)")?;
    dev.restore().context("restore (closed)")?;
    log::info!("restored: state {:?}, chip {:?}", dev.state(), dev.chip_state());
    Ok(())
}
