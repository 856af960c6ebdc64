// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint stream tests: transmit packetization and the boundary ZLP,
//! receive ordering and NAK throttling, blocking rules and timeout
//! recovery.

mod common;

use common::*;
use usbd_core::device::{DeviceConfig, TransferFlags, UsbDevice};
use usbd_core::endpoint::EndpointConfig;
use usbd_core::setup::UsbDir;
use usbd_core::{UsbError, USB_EP_SIZE};

const EP_OUT: u8 = 1;
const EP_IN: u8 = 2;
const EP_IN_ADDR: u8 = 0x82;

fn endpoints() -> [EndpointConfig; 2] {
    [EndpointConfig::bulk_out(EP_OUT), EndpointConfig::bulk_in(EP_IN)]
}

fn build<'a>(
    mock: &'a MockTransport,
    ctx: &'a MockContext,
    eps: &'a [EndpointConfig],
) -> UsbDevice<'a, MockTransport> {
    let config = DeviceConfig {
        endpoints: eps,
        ..DeviceConfig::new(0x2341, 0x8036)
    };
    UsbDevice::new(mock, ctx, config, &[]).unwrap()
}

fn frame_lengths(frames: &[Vec<u8>]) -> Vec<usize> {
    frames.iter().map(Vec::len).collect()
}

#[test]
fn scenario_c_130_bytes_becomes_64_64_2_without_zlp() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    let data = [0xA5u8; 130];
    assert_eq!(dev.send(EP_IN, &data).unwrap(), 130);
    pump_in(&dev, &mock, EP_IN_ADDR);

    let frames = mock.take_frames(EP_IN_ADDR);
    assert_eq!(frame_lengths(&frames), vec![64, 64, 2]);
    assert_eq!(frames.concat(), &data[..]);
}

#[test]
fn scenario_d_128_bytes_is_terminated_by_a_zlp() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    let data = [0x5Au8; 128];
    assert_eq!(dev.send(EP_IN, &data).unwrap(), 128);
    pump_in(&dev, &mock, EP_IN_ADDR);

    let frames = mock.take_frames(EP_IN_ADDR);
    assert_eq!(frame_lengths(&frames), vec![64, 64, 0]);
    assert_eq!(frames.concat(), &data[..]);
}

#[test]
fn zlp_boundary_is_exactly_at_packet_multiples() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    assert_eq!(dev.send(EP_IN, &[1; USB_EP_SIZE]).unwrap(), USB_EP_SIZE);
    pump_in(&dev, &mock, EP_IN_ADDR);
    assert_eq!(frame_lengths(&mock.take_frames(EP_IN_ADDR)), vec![64, 0]);

    assert_eq!(dev.send(EP_IN, &[1; USB_EP_SIZE - 1]).unwrap(), USB_EP_SIZE - 1);
    pump_in(&dev, &mock, EP_IN_ADDR);
    assert_eq!(frame_lengths(&mock.take_frames(EP_IN_ADDR)), vec![63]);
}

#[test]
fn bytes_leave_in_write_order_with_commit_boundaries() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    assert_eq!(dev.send(EP_IN, b"AAA").unwrap(), 3);
    assert_eq!(dev.send(EP_IN, b"BB").unwrap(), 2);
    pump_in(&dev, &mock, EP_IN_ADDR);

    let frames = mock.take_frames(EP_IN_ADDR);
    assert_eq!(frames, vec![b"AAA".to_vec(), b"BB".to_vec()]);
}

#[test]
fn zero_flag_sends_zero_filled_payload() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    let garbage = [0xFFu8; 10];
    let flags = TransferFlags { zero: true, release: true };
    assert_eq!(dev.write(EP_IN, &garbage, flags).unwrap(), 10);
    pump_in(&dev, &mock, EP_IN_ADDR);

    assert_eq!(mock.take_frames(EP_IN_ADDR), vec![vec![0u8; 10]]);
}

#[test]
fn send_before_configuration_is_refused() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    dev.handle_reset();

    assert_eq!(dev.send(EP_IN, b"xy"), Err(UsbError::NotConfigured));
    let mut buf = [0u8; 4];
    assert_eq!(dev.read(EP_OUT, &mut buf), Err(UsbError::NotConfigured));
}

#[test]
fn received_packets_are_read_in_arrival_order() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    let packet_a: Vec<u8> = (0..64).collect();
    mock.set_rx(0x01, &packet_a);
    dev.ep_out_complete(0x01, 64);

    let packet_b: Vec<u8> = (64..128).collect();
    mock.set_rx(0x01, &packet_b);
    dev.ep_out_complete(0x01, 64);

    let mut buf = [0u8; 200];
    let n = dev.read(EP_OUT, &mut buf).unwrap();
    assert_eq!(n, 128);
    let expected: Vec<u8> = (0..128).collect();
    assert_eq!(&buf[..n], &expected[..]);
}

#[test]
fn full_receive_queue_defers_rearming_until_read() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    // Armed once when the configuration was applied.
    assert_eq!(mock.armed_count(0x01), 1);

    // First packet fits the queue whole: reception re-arms at once.
    mock.set_rx(0x01, &[1u8; 64]);
    dev.ep_out_complete(0x01, 64);
    assert_eq!(mock.armed_count(0x01), 2);
    assert_eq!(dev.available(EP_OUT), 64);

    // Second packet no longer fits whole: the remainder parks in the
    // staging buffer and the endpoint stays un-armed, NAKing the host
    // instead of dropping data.
    mock.set_rx(0x01, &[2u8; 64]);
    dev.ep_out_complete(0x01, 64);
    assert_eq!(mock.armed_count(0x01), 2);

    // Draining hands out every byte, in order, and re-arms.
    let mut buf = [0u8; 200];
    let n = dev.read(EP_OUT, &mut buf).unwrap();
    assert_eq!(n, 128);
    assert!(buf[..64].iter().all(|&b| b == 1));
    assert!(buf[64..128].iter().all(|&b| b == 2));
    assert_eq!(mock.armed_count(0x01), 3);
}

#[test]
fn zero_length_out_packet_parks_nothing() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    dev.ep_out_complete(0x01, 0);
    assert_eq!(dev.available(EP_OUT), 0);

    // The next read finds nothing and re-arms reception.
    let mut buf = [0u8; 16];
    assert_eq!(dev.read(EP_OUT, &mut buf).unwrap(), 0);
    assert_eq!(mock.armed_count(0x01), 2);
}

#[test]
fn scenario_e_blocking_send_fails_immediately_when_blocking_is_unsafe() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = [
        EndpointConfig::bulk_in(EP_IN),
        EndpointConfig {
            number: 3,
            direction: UsbDir::In,
            kind: usbd_core::descriptor::UsbTransferType::Bulk,
            buffered: false,
        },
    ];
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    // Model a caller running at the transport interrupt's priority.
    ctx.blockable.set(false);

    // An unbuffered endpoint's send is inherently blocking: it must
    // refuse outright instead of deadlocking.
    assert_eq!(
        dev.send(3, &[0u8; 10]),
        Err(UsbError::WouldBlock)
    );

    // A buffered send accepts what fits and returns instead of waiting
    // for the queue to drain.
    let start = ctx.now.get();
    let written = dev.send(EP_IN, &[0u8; 300]).unwrap();
    assert!(written < 300);
    assert_eq!(ctx.now.get(), start); // no waiting happened
}

#[test]
fn blocked_transmitter_times_out_and_reattaches() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    // Nothing ever completes: the queue fills, the bounded wait runs
    // out, and the device detaches and reattaches rather than hanging.
    let written = dev.send(EP_IN, &[7u8; 300]).unwrap();
    assert!(written < 300);
    assert_eq!(mock.log.borrow().detach_count, 1);
    assert_eq!(mock.log.borrow().attach_count, 1);
    assert!(!dev.configured());
}

#[test]
fn direct_read_times_out_and_reattaches() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = [EndpointConfig {
        number: 3,
        direction: UsbDir::Out,
        kind: usbd_core::descriptor::UsbTransferType::Bulk,
        buffered: false,
    }];
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    let mut buf = [0u8; 32];
    assert_eq!(dev.read(3, &mut buf).unwrap(), 0);
    assert_eq!(mock.log.borrow().detach_count, 1);
    assert_eq!(mock.log.borrow().attach_count, 1);
}

#[test]
fn flush_commits_and_reports_a_wedged_endpoint() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    // Nothing buffered: flush is a no-op success.
    assert_eq!(dev.flush(EP_IN), Ok(()));

    // Buffer without releasing: nothing is on the wire yet.
    assert_eq!(
        dev.write(EP_IN, b"stuck", TransferFlags::NONE).unwrap(),
        5
    );
    assert!(mock.take_frames(EP_IN_ADDR).is_empty());

    // Flush seals the partial block and hands it to the driver; with no
    // completion ever arriving the bounded wait expires.
    assert_eq!(dev.flush(EP_IN), Err(UsbError::Timeout));
    assert_eq!(frame_lengths(&mock.take_frames(EP_IN_ADDR)), vec![5]);
    assert_eq!(mock.log.borrow().detach_count, 1);
}

#[test]
fn available_for_write_tracks_queue_space() {
    let mock = MockTransport::new();
    let ctx = MockContext::new();
    let eps = endpoints();
    let dev = build(&mock, &ctx, &eps);
    enumerate(&dev, &mock);

    let initial = dev.available_for_write(EP_IN);
    assert_eq!(initial, 4 * USB_EP_SIZE - 1);
    dev.write(EP_IN, &[0u8; 10], TransferFlags::NONE).unwrap();
    assert_eq!(dev.available_for_write(EP_IN), initial - 10);
}
