//! Deterministic in-memory radio for tests and the UDP harness.
//!
//! Models the IRQ contract the reactor relies on: RX-done with latched
//! RSSI/SNR, TX-done after the computed airtime, preamble/header flags for
//! channel sensing. Time never advances on its own — the owner calls
//! [`SimRadio::advance`] with the same clock it hands to `poll`.

use std::collections::VecDeque;

use crate::radio::{
    airtime_ms, Radio, RadioError, RadioParams, IRQ_HEADER_VALID, IRQ_PREAMBLE_DETECTED,
    IRQ_RX_DONE, IRQ_TX_DONE,
};

/// A frame waiting to be heard, with its simulated signal numbers.
#[derive(Debug, Clone)]
pub struct SimFrame {
    pub bytes: Vec<u8>,
    pub rssi: i16,
    pub snr_q: i8,
}

#[derive(Debug, Default)]
pub struct SimRadio {
    params: Option<RadioParams>,
    irq: u16,
    receiving: bool,

    inbound: VecDeque<SimFrame>,
    rx_frame: Option<Vec<u8>>,
    last_rssi: i16,
    last_snr_q: i8,

    tx_frame: Option<Vec<u8>>,
    tx_done_at_ms: u64,
    /// Frames fully transmitted, oldest first.
    pub sent: Vec<Vec<u8>>,

    /// Ambient level reported by `channel_rssi`.
    pub noise_dbm: i16,
    /// Keep the preamble-detected flag asserted (a jammed channel).
    pub force_preamble: bool,
    /// Keep the header-valid flag asserted.
    pub force_header: bool,
    /// Make `start_transmit` fail, for the error-path tests.
    pub fail_transmit: bool,

    pub rx_boost: bool,
    pub begin_calls: u32,
    pub resets: u32,

    /// Clock of the most recent `advance` call; TX completion is anchored
    /// to it.
    last_now_ms: u64,
}

impl SimRadio {
    pub fn new() -> Self {
        Self { noise_dbm: -115, ..Default::default() }
    }

    /// Queue a frame for reception.
    pub fn inject(&mut self, bytes: Vec<u8>, rssi: i16, snr_q: i8) {
        self.inbound.push_back(SimFrame { bytes, rssi, snr_q });
    }

    /// Advance simulated time: complete an in-flight transmission, deliver
    /// the next inbound frame once the previous one was consumed.
    pub fn advance(&mut self, now_ms: u64) {
        self.last_now_ms = now_ms;
        if let Some(frame) = self.tx_frame.take() {
            if now_ms >= self.tx_done_at_ms {
                self.sent.push(frame);
                self.irq |= IRQ_TX_DONE;
            } else {
                self.tx_frame = Some(frame);
            }
        }

        if self.receiving && self.rx_frame.is_none() && self.irq & IRQ_RX_DONE == 0 {
            if let Some(frame) = self.inbound.pop_front() {
                self.last_rssi = frame.rssi;
                self.last_snr_q = frame.snr_q;
                self.rx_frame = Some(frame.bytes);
                self.irq |= IRQ_RX_DONE | IRQ_PREAMBLE_DETECTED | IRQ_HEADER_VALID;
            }
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

impl Radio for SimRadio {
    fn begin(&mut self, params: &RadioParams) -> Result<(), RadioError> {
        self.begin_calls += 1;
        self.params = Some(*params);
        Ok(())
    }

    fn set_rx_boost(&mut self, enabled: bool) -> Result<(), RadioError> {
        self.rx_boost = enabled;
        Ok(())
    }

    fn set_crc(&mut self, _enabled: bool) -> Result<(), RadioError> {
        Ok(())
    }

    fn start_receive(&mut self, _duty_period_ms: u32) -> Result<(), RadioError> {
        self.receiving = true;
        Ok(())
    }

    fn start_transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        if self.fail_transmit {
            return Err(RadioError::Code(-5));
        }
        let params = self.params.unwrap_or_default();
        self.tx_done_at_ms = self.last_now_ms + airtime_ms(&params, frame.len()) as u64;
        self.tx_frame = Some(frame.to_vec());
        self.receiving = false;
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        match self.rx_frame.take() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn irq_status(&mut self) -> u16 {
        let mut irq = self.irq;
        if self.force_preamble {
            irq |= IRQ_PREAMBLE_DETECTED;
        }
        if self.force_header {
            irq |= IRQ_HEADER_VALID;
        }
        irq
    }

    fn clear_irq(&mut self, mask: u16) {
        self.irq &= !mask;
    }

    fn rssi(&mut self) -> i16 {
        self.last_rssi
    }

    fn snr_q(&mut self) -> i8 {
        self.last_snr_q
    }

    fn channel_rssi(&mut self) -> i16 {
        self.noise_dbm
    }

    fn finish_transmit(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.irq = 0;
        self.rx_frame = None;
        self.tx_frame = None;
        self.receiving = false;
    }
}

