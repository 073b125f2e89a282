//! LoRa transceiver contract and channel timing math.
//!
//! The driver itself is an external collaborator; this module fixes the
//! interface the reactor drives it through, plus the symbol/airtime
//! arithmetic every CSMA and duty-cycle decision is based on.

use thiserror::Error;

/// MeshCore private sync word. Distinct from LoRaWAN (0x34) and from other
/// LoRa mesh networks so foreign traffic fails header decode early.
pub const SYNC_WORD: u8 = 0x12;

// =============================================================================
// IRQ BITS
// =============================================================================
// Subset of the SX126x IRQ mask the reactor cares about.

pub const IRQ_TX_DONE: u16 = 0x0001;
pub const IRQ_RX_DONE: u16 = 0x0002;
pub const IRQ_PREAMBLE_DETECTED: u16 = 0x0004;
pub const IRQ_HEADER_VALID: u16 = 0x0010;
pub const IRQ_CRC_ERR: u16 = 0x0040;
pub const IRQ_RX_TX_TIMEOUT: u16 = 0x0200;

#[derive(Debug, Error)]
pub enum RadioError {
    /// Non-zero status from the driver. The code is driver-specific.
    #[error("radio driver error {0}")]
    Code(i16),
}

/// Physical-layer configuration handed to [`Radio::begin`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioParams {
    pub frequency_hz: u32,
    pub bandwidth_hz: u32,
    /// Spreading factor, 5..=12.
    pub spreading_factor: u8,
    /// Coding rate denominator, 5..=8 (4/5 .. 4/8).
    pub coding_rate: u8,
    pub sync_word: u8,
    pub tx_power_dbm: i8,
    /// Preamble length in symbols.
    pub preamble_len: u16,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            frequency_hz: 869_525_000,
            bandwidth_hz: 250_000,
            spreading_factor: 11,
            coding_rate: 5,
            sync_word: SYNC_WORD,
            tx_power_dbm: 17,
            preamble_len: 16,
        }
    }
}

/// Byte-oriented transceiver as seen by the reactor.
///
/// The reactor owns the radio exclusively and keeps it in exactly one of
/// {receiving, transmitting, idle-post-TX}. Interrupt delivery is by
/// polling [`Radio::irq_status`]; the hardware ISR merely latches bits.
pub trait Radio {
    fn begin(&mut self, params: &RadioParams) -> Result<(), RadioError>;
    fn set_rx_boost(&mut self, enabled: bool) -> Result<(), RadioError>;
    fn set_crc(&mut self, enabled: bool) -> Result<(), RadioError>;

    /// Enter RX. `duty_period_ms` of 0 means continuous receive; anything
    /// else is the driver's preamble-sniffing duty cycle.
    fn start_receive(&mut self, duty_period_ms: u32) -> Result<(), RadioError>;

    fn start_transmit(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    /// Copy the last received frame out of the driver. Returns the frame
    /// length; 0 when nothing is pending.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, RadioError>;

    /// Latched IRQ bits. Reading does not clear.
    fn irq_status(&mut self) -> u16;

    /// Clear the given IRQ bits.
    fn clear_irq(&mut self, mask: u16);

    /// RSSI of the last received packet, dBm.
    fn rssi(&mut self) -> i16;

    /// SNR of the last received packet, signed quarter-dB.
    fn snr_q(&mut self) -> i8;

    /// Instantaneous channel RSSI, dBm. Used for noise-floor sampling.
    fn channel_rssi(&mut self) -> i16;

    /// Post-TX cleanup before the next mode change.
    fn finish_transmit(&mut self) -> Result<(), RadioError>;

    /// Hard reset. The caller must `begin` + `start_receive` afterwards.
    fn reset(&mut self);
}

// =============================================================================
// TIMING
// =============================================================================

/// Channel timing derived from [`RadioParams`], all in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct RadioTimings {
    pub symbol_ms: f32,
    pub preamble_ms: u32,
    /// Airtime of a full 255-byte frame; bounds every stall timer.
    pub max_packet_ms: u32,
    /// CSMA slot: 8.5 symbols plus a 10 ms guard.
    pub slot_ms: u32,
}

impl RadioTimings {
    pub fn from_params(params: &RadioParams) -> Self {
        let symbol_ms = symbol_time_ms(params.spreading_factor, params.bandwidth_hz);
        let preamble_ms =
            ((params.preamble_len as f32 + 4.25) * symbol_ms).ceil() as u32;
        let max_packet_ms = airtime_ms(params, 255);
        let slot_ms = (8.5 * symbol_ms + 10.0).ceil() as u32;
        Self { symbol_ms, preamble_ms, max_packet_ms, slot_ms }
    }
}

/// LoRa symbol duration in milliseconds: `2^SF / BW`.
pub fn symbol_time_ms(sf: u8, bw_hz: u32) -> f32 {
    (1u32 << sf) as f32 * 1000.0 / bw_hz as f32
}

/// Time-on-air for a payload of `len` bytes, in milliseconds.
///
/// `(n_preamble + 8 + max(ceil((8·PL − 4·SF + 28 + 16) / (4·SF)) · CR, 0)) · t_sym`
/// with the explicit-header, CRC-on profile this network runs.
pub fn airtime_ms(params: &RadioParams, len: usize) -> u32 {
    let sf = params.spreading_factor as i32;
    let cr = params.coding_rate as i32;
    let pl = len as i32;

    let numerator = 8 * pl - 4 * sf + 28 + 16;
    let payload_symbols = if numerator > 0 {
        // ceil division before the coding-rate multiplier
        ((numerator + 4 * sf - 1) / (4 * sf)) * cr
    } else {
        0
    };

    let total_symbols =
        params.preamble_len as f32 + 8.0 + payload_symbols.max(0) as f32;
    (total_symbols * symbol_time_ms(params.spreading_factor, params.bandwidth_hz))
        .ceil() as u32
}
