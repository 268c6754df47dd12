//! # IKBD Packet Reassembly
//!
//! Bytes from the keyboard processor arrive one at a time. Bytes below
//! 0xF6 are key codes and go straight to [`IkbdVectors::kbdvec`]. A byte
//! from 0xF6 up starts a packet whose shape and length follow from the
//! header:
//!
//! ```text
//!  header  payload               handler    gets
//!  F6      a1 .. a7              statvec    payload
//!  F7      0b xh xl yh yl        mousevec   payload
//!  F8..FB  dx dy                 mousevec   header + payload
//!  FC      yy MM dd hh mm ss     clockvec   payload
//!  FD      j0 j1                 joyvec     [FD, j0, j1]
//!  FE      j0                    joyvec     [FE, j0, last j1]
//!  FF      j1                    joyvec     [FF, last j0, j1]
//! ```
//!
//! Joystick handlers always see both sticks, so single-stick packets are
//! merged into a persistent three-byte record first.

pub mod iorec;

pub use iorec::{Iorec, KeyboardIorec, MidiIorec};

/// Lowest packet header byte
pub const PACKET_HEADER: u8 = 0xF6;

/// Completion action per header, 0xF6..=0xFF
const PACKET_ACTIONS: [Packet; 10] = [
    Packet::Status,
    Packet::AbsoluteMouse,
    Packet::RelativeMouse,
    Packet::RelativeMouse,
    Packet::RelativeMouse,
    Packet::RelativeMouse,
    Packet::Clock,
    Packet::Joysticks,
    Packet::Joystick0,
    Packet::Joystick1,
];

/// Payload bytes per header, 0xF6..=0xFF
const PACKET_LENGTHS: [u8; 10] = [7, 5, 2, 2, 2, 2, 6, 2, 1, 1];

/// Packet shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// Status report
    Status,
    /// Absolute mouse position
    AbsoluteMouse,
    /// Relative mouse movement
    RelativeMouse,
    /// Time of day
    Clock,
    /// Both joysticks
    Joysticks,
    /// Joystick 0
    Joystick0,
    /// Joystick 1
    Joystick1,
}

impl Packet {
    /// Shape and payload length announced by `header`
    pub fn from_header(header: u8) -> Option<(Self, u8)> {
        let index = usize::from(header.checked_sub(PACKET_HEADER)?);
        Some((PACKET_ACTIONS[index], PACKET_LENGTHS[index]))
    }
}

/// Receivers of decoded input
///
/// Key and MIDI bytes default to the rings returned by [`buffers`], with
/// the overrun vector called when a ring is full. Every other vector
/// defaults to discarding its input.
///
/// [`buffers`]: IkbdVectors::buffers
pub trait IkbdVectors {
    /// Rings that key and MIDI bytes are queued into
    fn buffers(&self) -> Option<&InputBuffers> {
        None
    }

    /// Ordinary key byte
    fn kbdvec(&mut self, scancode: u8) {
        let full = self.buffers().map_or(false, |buffers| !buffers.keyboard.push(scancode));
        if full {
            self.vkbderr(scancode);
        }
    }

    /// Status packet payload
    fn statvec(&mut self, _packet: &[u8]) {}

    /// Mouse packet
    fn mousevec(&mut self, _packet: &[u8]) {}

    /// Clock packet payload
    fn clockvec(&mut self, _packet: &[u8]) {}

    /// Joystick record: header, joystick 0, joystick 1
    fn joyvec(&mut self, _packet: &[u8]) {}

    /// MIDI input byte
    fn midivec(&mut self, data: u8) {
        let full = self.buffers().map_or(false, |buffers| !buffers.midi.push(data));
        if full {
            self.vmiderr(data);
        }
    }

    /// Keyboard receive overrun
    fn vkbderr(&mut self, _data: u8) {}

    /// MIDI receive overrun
    fn vmiderr(&mut self, _data: u8) {}
}

/// IKBD byte stream reassembler
#[derive(Debug, Clone)]
pub struct Ikbd {
    packet: Option<Packet>,
    remaining: u8,
    index: usize,
    buf: [u8; 8],
    joystick: [u8; 3],
}

impl Ikbd {
    /// Idle reassembler
    pub const fn new() -> Self {
        Self {
            packet: None,
            remaining: 0,
            index: 0,
            buf: [0; 8],
            joystick: [0; 3],
        }
    }

    /// No packet in progress
    pub fn is_idle(&self) -> bool {
        self.packet.is_none()
    }

    /// Last joystick record handed to `joyvec`
    pub fn joystick(&self) -> [u8; 3] {
        self.joystick
    }

    /// Feed one received byte
    pub fn receive<V: IkbdVectors + ?Sized>(&mut self, byte: u8, vectors: &mut V) {
        let Some(packet) = self.packet else {
            match Packet::from_header(byte) {
                Some((packet, length)) => {
                    self.buf[0] = byte;
                    self.index = 1;
                    self.packet = Some(packet);
                    self.remaining = length;
                }
                None => vectors.kbdvec(byte),
            }
            return;
        };

        self.buf[self.index] = byte;
        self.index += 1;
        self.remaining -= 1;
        if self.remaining == 0 {
            self.packet = None;
            self.dispatch(packet, vectors);
        }
    }

    fn dispatch<V: IkbdVectors + ?Sized>(&mut self, packet: Packet, vectors: &mut V) {
        let buf = &self.buf[..self.index];
        match packet {
            Packet::Status => vectors.statvec(&buf[1..]),
            Packet::AbsoluteMouse => vectors.mousevec(&buf[1..]),
            Packet::RelativeMouse => vectors.mousevec(buf),
            Packet::Clock => vectors.clockvec(&buf[1..]),
            Packet::Joysticks => {
                self.joystick.copy_from_slice(&buf[..3]);
                vectors.joyvec(&self.joystick);
            }
            Packet::Joystick0 => {
                self.joystick[0] = buf[0];
                self.joystick[1] = buf[1];
                vectors.joyvec(&self.joystick);
            }
            Packet::Joystick1 => {
                self.joystick[0] = buf[0];
                self.joystick[2] = buf[1];
                vectors.joyvec(&self.joystick);
            }
        }
    }
}

impl Default for Ikbd {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyboard and MIDI IOREC rings
///
/// A shared reference is itself a set of vectors, so the receive interrupt
/// can fill the rings while the BIOS poller drains them.
#[derive(Debug)]
pub struct InputBuffers {
    /// Keyboard ring
    pub keyboard: KeyboardIorec,
    /// MIDI ring
    pub midi: MidiIorec,
}

impl InputBuffers {
    /// Empty rings
    pub const fn new() -> Self {
        Self {
            keyboard: KeyboardIorec::keyboard(),
            midi: MidiIorec::midi(),
        }
    }
}

impl Default for InputBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl IkbdVectors for &InputBuffers {
    fn buffers(&self) -> Option<&InputBuffers> {
        Some(*self)
    }

    fn vkbderr(&mut self, data: u8) {
        log::trace!("ikbd: keyboard buffer full, dropped {:#04x}", data);
    }

    fn vmiderr(&mut self, data: u8) {
        log::trace!("ikbd: MIDI buffer full, dropped {:#04x}", data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<(&'static str, Vec<u8>)>,
    }

    impl IkbdVectors for Recorder {
        fn kbdvec(&mut self, scancode: u8) {
            self.events.push(("kbd", vec![scancode]));
        }

        fn statvec(&mut self, packet: &[u8]) {
            self.events.push(("stat", packet.to_vec()));
        }

        fn mousevec(&mut self, packet: &[u8]) {
            self.events.push(("mouse", packet.to_vec()));
        }

        fn clockvec(&mut self, packet: &[u8]) {
            self.events.push(("clock", packet.to_vec()));
        }

        fn joyvec(&mut self, packet: &[u8]) {
            self.events.push(("joy", packet.to_vec()));
        }
    }

    fn feed(bytes: &[u8]) -> (Ikbd, Recorder) {
        let mut ikbd = Ikbd::new();
        let mut rec = Recorder::default();
        for &b in bytes {
            ikbd.receive(b, &mut rec);
        }
        (ikbd, rec)
    }

    #[test]
    fn test_key_bytes_pass_through() {
        let (ikbd, rec) = feed(&[0x1E, 0x9E, 0xF5]);
        assert!(ikbd.is_idle());
        assert_eq!(
            rec.events,
            vec![("kbd", vec![0x1E]), ("kbd", vec![0x9E]), ("kbd", vec![0xF5])]
        );
    }

    #[test]
    fn test_header_table() {
        let lengths: Vec<u8> = (0xF6..=0xFF).map(|h| Packet::from_header(h).unwrap().1).collect();
        assert_eq!(lengths, [7, 5, 2, 2, 2, 2, 6, 2, 1, 1]);
        assert_eq!(Packet::from_header(0xF5), None);
        assert_eq!(Packet::from_header(0xFB), Some((Packet::RelativeMouse, 2)));
    }

    #[test]
    fn test_mouse_packets() {
        let (_, rec) = feed(&[0xF8, 0x05, 0xFB, 0xF7, 0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            rec.events,
            vec![
                ("mouse", vec![0xF8, 0x05, 0xFB]),
                ("mouse", vec![0x00, 0x01, 0x02, 0x03, 0x04]),
            ]
        );
    }

    #[test]
    fn test_payload_bytes_are_not_headers() {
        // 0xFF inside a status packet is data
        let (ikbd, rec) = feed(&[0xF6, 1, 2, 0xFF, 4, 5, 6, 7, 0x30]);
        assert!(ikbd.is_idle());
        assert_eq!(
            rec.events,
            vec![("stat", vec![1, 2, 0xFF, 4, 5, 6, 7]), ("kbd", vec![0x30])]
        );
    }

    #[test]
    fn test_clock_packet() {
        let (_, rec) = feed(&[0xFC, 0x26, 0x10, 0x19, 0x12, 0x30, 0x45]);
        assert_eq!(rec.events, vec![("clock", vec![0x26, 0x10, 0x19, 0x12, 0x30, 0x45])]);
    }

    #[test]
    fn test_joystick_merging() {
        let (ikbd, rec) = feed(&[0xFD, 0x01, 0x82, 0xFE, 0x04, 0xFF, 0x08]);
        assert_eq!(
            rec.events,
            vec![
                ("joy", vec![0xFD, 0x01, 0x82]),
                ("joy", vec![0xFE, 0x04, 0x82]),
                ("joy", vec![0xFF, 0x04, 0x08]),
            ]
        );
        assert_eq!(ikbd.joystick(), [0xFF, 0x04, 0x08]);
    }

    #[test]
    fn test_partial_packet_waits() {
        let (ikbd, rec) = feed(&[0xF7, 0x00, 0x01]);
        assert!(!ikbd.is_idle());
        assert!(rec.events.is_empty());
    }

    #[test]
    fn test_input_buffers_queue_keys_and_midi() {
        let mut ikbd = Ikbd::new();
        let buffers = InputBuffers::new();
        let mut vectors = &buffers;
        ikbd.receive(0x1C, &mut vectors);
        ikbd.receive(0xF8, &mut vectors);
        ikbd.receive(0x01, &mut vectors);
        ikbd.receive(0x02, &mut vectors);
        vectors.midivec(0x90);

        assert_eq!(buffers.keyboard.pop(), Some(0x1C));
        assert!(buffers.keyboard.is_empty());
        assert_eq!(buffers.midi.pop(), Some(0x90));
    }

    #[derive(Debug, Default)]
    struct Overruns {
        buffers: InputBuffers,
        errors: Vec<(&'static str, u8)>,
    }

    impl IkbdVectors for Overruns {
        fn buffers(&self) -> Option<&InputBuffers> {
            Some(&self.buffers)
        }

        fn vkbderr(&mut self, data: u8) {
            self.errors.push(("kbd", data));
        }

        fn vmiderr(&mut self, data: u8) {
            self.errors.push(("midi", data));
        }
    }

    #[test]
    fn test_full_rings_call_overrun_vectors() {
        let mut ikbd = Ikbd::new();
        let mut vectors = Overruns::default();
        for _ in 0..vectors.buffers.keyboard.capacity() {
            ikbd.receive(0x1E, &mut vectors);
        }
        for _ in 0..vectors.buffers.midi.capacity() {
            vectors.midivec(0x90);
        }
        assert!(vectors.errors.is_empty());

        ikbd.receive(0x2A, &mut vectors);
        vectors.midivec(0x80);
        assert_eq!(vectors.errors, vec![("kbd", 0x2A), ("midi", 0x80)]);

        // Draining makes room again
        assert_eq!(vectors.buffers.keyboard.pop(), Some(0x1E));
        ikbd.receive(0x2B, &mut vectors);
        assert_eq!(vectors.errors.len(), 2);
    }
}
