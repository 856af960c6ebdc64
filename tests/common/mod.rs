// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted packet-transport mock and execution-context stub shared by
//! the integration tests. The mock records every driver call; tests
//! deliver completions by calling the device's completion entry points,
//! playing the role of the interrupt glue.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use usbd_core::descriptor::UsbTransferType;
use usbd_core::device::UsbDevice;
use usbd_core::transport::{ExecutionContext, PacketTransport};

#[derive(Default)]
pub struct TransportLog {
    /// Per endpoint address: the data chunk of every accepted
    /// submission, in order. A zero-length entry is a ZLP.
    pub transmits: HashMap<u8, Vec<Vec<u8>>>,
    /// Per endpoint address: how many of those submissions the test has
    /// already completed back into the device.
    pub acked: HashMap<u8, usize>,
    /// Every `receive` arming, in order.
    pub armed: Vec<(u8, usize)>,
    /// Next packet `read_packet` will hand out, per endpoint address.
    pub rx_packets: HashMap<u8, Vec<u8>>,
    pub stalls: Vec<u8>,
    pub clear_stalls: Vec<u8>,
    pub address: Option<u8>,
    pub opened: Vec<(u8, UsbTransferType, u16)>,
    pub attach_count: u32,
    pub detach_count: u32,
    pub frame: u16,
    /// Longest chunk `transmit` accepts per submission; 64 models a
    /// one-packet-at-a-time driver.
    pub tx_chunk: usize,
}

pub struct MockTransport {
    pub log: RefCell<TransportLog>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            log: RefCell::new(TransportLog {
                tx_chunk: 64,
                ..Default::default()
            }),
        }
    }

    /// Drains the recorded submissions for one endpoint. Call only with
    /// no completion outstanding on that endpoint.
    pub fn take_frames(&self, ep_addr: u8) -> Vec<Vec<u8>> {
        let mut log = self.log.borrow_mut();
        log.acked.insert(ep_addr, 0);
        log.transmits.remove(&ep_addr).unwrap_or_default()
    }

    pub fn set_rx(&self, ep_addr: u8, data: &[u8]) {
        self.log.borrow_mut().rx_packets.insert(ep_addr, data.to_vec());
    }

    pub fn armed_count(&self, ep_addr: u8) -> usize {
        self.log
            .borrow()
            .armed
            .iter()
            .filter(|(a, _)| *a == ep_addr)
            .count()
    }
}

impl PacketTransport for MockTransport {
    fn transmit(&self, ep_addr: u8, data: &[u8]) -> usize {
        let mut log = self.log.borrow_mut();
        let n = data.len().min(log.tx_chunk);
        log.transmits.entry(ep_addr).or_default().push(data[..n].to_vec());
        n
    }

    fn receive(&self, ep_addr: u8, capacity: usize) {
        self.log.borrow_mut().armed.push((ep_addr, capacity));
    }

    fn read_packet(&self, ep_addr: u8, buf: &mut [u8]) -> usize {
        let packet = self
            .log
            .borrow_mut()
            .rx_packets
            .remove(&ep_addr)
            .unwrap_or_default();
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        n
    }

    fn stall(&self, ep_addr: u8) {
        self.log.borrow_mut().stalls.push(ep_addr);
    }

    fn clear_stall(&self, ep_addr: u8) {
        self.log.borrow_mut().clear_stalls.push(ep_addr);
    }

    fn set_address(&self, address: u8) {
        self.log.borrow_mut().address = Some(address);
    }

    fn open_endpoint(&self, ep_addr: u8, kind: UsbTransferType, max_packet: u16) {
        self.log.borrow_mut().opened.push((ep_addr, kind, max_packet));
    }

    fn attach(&self) {
        self.log.borrow_mut().attach_count += 1;
    }

    fn detach(&self) {
        self.log.borrow_mut().detach_count += 1;
    }

    fn frame_number(&self) -> u16 {
        self.log.borrow().frame
    }
}

pub struct MockContext {
    pub blockable: Cell<bool>,
    pub now: Cell<u32>,
}

impl MockContext {
    pub fn new() -> Self {
        MockContext {
            blockable: Cell::new(true),
            now: Cell::new(0),
        }
    }
}

impl ExecutionContext for MockContext {
    fn can_block(&self) -> bool {
        self.blockable.get()
    }

    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn wait_for_event(&self) {
        // Advance time so bounded waits that nothing will satisfy run
        // into their timeout instead of spinning the test forever.
        self.now.set(self.now.get().wrapping_add(1));
    }

    fn masked(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// Builds the 8 raw setup bytes (all fields little-endian).
pub fn setup_bytes(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let i = index.to_le_bytes();
    let l = length.to_le_bytes();
    [request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]]
}

/// Delivers transmit completions for `ep_addr` until the device stops
/// submitting, like the interrupt glue would.
pub fn pump_in(dev: &UsbDevice<'_, MockTransport>, mock: &MockTransport, ep_addr: u8) {
    loop {
        let outstanding = {
            let log = mock.log.borrow();
            let total = log.transmits.get(&ep_addr).map(Vec::len).unwrap_or(0);
            total - log.acked.get(&ep_addr).copied().unwrap_or(0)
        };
        if outstanding == 0 {
            break;
        }
        *mock.log.borrow_mut().acked.entry(ep_addr).or_insert(0) += 1;
        dev.ep_in_complete(ep_addr);
    }
}

/// Runs a control transaction's IN side to completion and returns the
/// concatenated response bytes.
pub fn control_response(dev: &UsbDevice<'_, MockTransport>, mock: &MockTransport) -> Vec<u8> {
    pump_in(dev, mock, 0x80);
    mock.take_frames(0x80).concat()
}

/// Bus reset plus SET_CONFIGURATION(1), the shortest path to a
/// configured device.
pub fn enumerate(dev: &UsbDevice<'_, MockTransport>, mock: &MockTransport) {
    dev.handle_reset();
    dev.handle_setup(&setup_bytes(0x00, 0x09, 1, 0, 0));
    pump_in(dev, mock, 0x80);
    let _ = mock.take_frames(0x80);
}
