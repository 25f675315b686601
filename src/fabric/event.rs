// Event payloads carried by the SPSC queues, and the queue bundle that
// wires the three execution contexts (audio domain, control domain, CDC
// link) together. All payloads are plain-old-data.

use super::ring::{self, Consumer, Producer};

// ─────────────────────────────────────────────────────────────────────────────
//  Queue capacities (powers of two; one slot reserved per queue)
// ─────────────────────────────────────────────────────────────────────────────

pub const DETECT_QUEUE_CAP: usize = 32;
pub const METRO_QUEUE_CAP: usize = 32;
pub const CLOCK_QUEUE_CAP: usize = 32;
pub const SLOPE_ACTION_QUEUE_CAP: usize = 16;
pub const PULSE_EDGE_QUEUE_CAP: usize = 32;
pub const GENERAL_QUEUE_CAP: usize = 64;
pub const USB_RX_QUEUE_CAP: usize = 64;
pub const USB_TX_QUEUE_CAP: usize = 64;

pub const RX_CHUNK_BYTES: usize = 64;
pub const TX_MSG_BYTES: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
//  Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectKind {
    Stream,
    Change,
    Window,
    Scale,
    Volume,
    Peak,
    Frequency,
}

/// Input detection event, fully derived (volts + mode extras) on the
/// control side before entering the queue.
#[derive(Clone, Copy, Debug)]
pub struct DetectEvent {
    pub channel: u8,
    pub kind: DetectKind,
    pub value: f32,
    pub timestamp: u64,
    /// Window index (sign = crossing direction) or scale degree index.
    pub index: i32,
    pub octave: i32,
    pub note: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetroEvent {
    pub id: u8,
    pub stage: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockResume {
    pub coro_id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlopeAction {
    pub channel: u8,
}

/// Rising edge on a pulse input in clock mode, with its sample timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseEdge {
    pub channel: u8,
    pub timestamp: u64,
}

/// Script-originated deferred event, delivered back to the VM on a later
/// dispatcher iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneralEvent {
    pub code: u32,
    pub value: f32,
}

/// One chunk of bytes from the host link.
#[derive(Clone, Copy)]
pub struct RxChunk {
    pub len: u8,
    pub bytes: [u8; RX_CHUNK_BYTES],
}

impl RxChunk {
    pub fn from_slice(data: &[u8]) -> Self {
        debug_assert!(data.len() <= RX_CHUNK_BYTES);
        let mut bytes = [0u8; RX_CHUNK_BYTES];
        let len = data.len().min(RX_CHUNK_BYTES);
        bytes[..len].copy_from_slice(&data[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// One outbound serial message. `flush` asks the link to push the write
/// through immediately (end of a response line).
#[derive(Clone, Copy)]
pub struct TxMsg {
    pub len: u16,
    pub flush: bool,
    pub bytes: [u8; TX_MSG_BYTES],
}

impl TxMsg {
    pub fn from_slice(data: &[u8], flush: bool) -> Self {
        debug_assert!(data.len() <= TX_MSG_BYTES);
        let mut bytes = [0u8; TX_MSG_BYTES];
        let len = data.len().min(TX_MSG_BYTES);
        bytes[..len].copy_from_slice(&data[..len]);
        Self {
            len: len as u16,
            flush,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Queue bundle
// ─────────────────────────────────────────────────────────────────────────────

/// Producer ends held by the audio callback.
pub struct AudioEnds {
    pub metro_tx: Producer<MetroEvent>,
    pub pulse_edge_tx: Producer<PulseEdge>,
}

/// Ends held by the control loop. Several queues have both ends here:
/// they decouple control-domain stages (detector scan → dispatcher,
/// scheduler → dispatcher, slope renderer → dispatcher) with the same
/// drop-counted contract.
pub struct ControlEnds {
    pub detect_tx: Producer<DetectEvent>,
    pub detect_rx: Consumer<DetectEvent>,
    pub metro_rx: Consumer<MetroEvent>,
    pub clock_tx: Producer<ClockResume>,
    pub clock_rx: Consumer<ClockResume>,
    pub slope_action_rx: Consumer<SlopeAction>,
    pub pulse_edge_rx: Consumer<PulseEdge>,
    pub general_tx: Producer<GeneralEvent>,
    pub general_rx: Consumer<GeneralEvent>,
    pub usb_rx_rx: Consumer<RxChunk>,
    pub usb_tx_tx: Producer<TxMsg>,
}

/// Ends held by the CDC link threads (the "USB IRQ" role).
pub struct LinkEnds {
    pub usb_rx_tx: Producer<RxChunk>,
    pub usb_tx_rx: Consumer<TxMsg>,
}

/// Build the eight queues and hand each end to its statically assigned
/// domain. The slope-action producer is returned separately: it belongs
/// to the slope bank, the queue's sole posting site.
pub fn build() -> (AudioEnds, ControlEnds, LinkEnds, Producer<SlopeAction>) {
    let (detect_tx, detect_rx) = ring::channel(DETECT_QUEUE_CAP);
    let (metro_tx, metro_rx) = ring::channel(METRO_QUEUE_CAP);
    let (clock_tx, clock_rx) = ring::channel(CLOCK_QUEUE_CAP);
    let (slope_action_tx, slope_action_rx) = ring::channel(SLOPE_ACTION_QUEUE_CAP);
    let (pulse_edge_tx, pulse_edge_rx) = ring::channel(PULSE_EDGE_QUEUE_CAP);
    let (general_tx, general_rx) = ring::channel(GENERAL_QUEUE_CAP);
    let (usb_rx_tx, usb_rx_rx) = ring::channel(USB_RX_QUEUE_CAP);
    let (usb_tx_tx, usb_tx_rx) = ring::channel(USB_TX_QUEUE_CAP);

    (
        AudioEnds {
            metro_tx,
            pulse_edge_tx,
        },
        ControlEnds {
            detect_tx,
            detect_rx,
            metro_rx,
            clock_tx,
            clock_rx,
            slope_action_rx,
            pulse_edge_rx,
            general_tx,
            general_rx,
            usb_rx_rx,
            usb_tx_tx,
        },
        LinkEnds {
            usb_rx_tx,
            usb_tx_rx,
        },
        slope_action_tx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trip() {
        let c = RxChunk::from_slice(b"^^v\n");
        assert_eq!(c.as_slice(), b"^^v\n");
        let m = TxMsg::from_slice(b"^^version('corvid-1.0')\n\r", true);
        assert_eq!(m.as_slice(), b"^^version('corvid-1.0')\n\r");
        assert!(m.flush);
    }
}
