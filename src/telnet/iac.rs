//! Telnet option negotiation (RFC 854/855)
//!
//! Incremental state machine over the inbound byte stream. Negotiation
//! frames are stripped from the payload, responses are produced as bytes to
//! write back, partial frames survive chunk boundaries, and `IAC IAC`
//! decodes to a literal 0xFF. All steps are pure computation; the machine
//! never suspends.

use std::collections::HashSet;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub mod option {
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3;
    pub const TTYPE: u8 = 24;
    pub const NAWS: u8 = 31;
}

/// TERMINAL-TYPE subnegotiation commands.
const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    /// Saw IAC, awaiting command byte.
    Iac,
    /// Saw IAC WILL/WONT/DO/DONT, awaiting option byte.
    Negotiate(u8),
    /// Inside IAC SB, awaiting option byte.
    SubOption,
    /// Inside subnegotiation body.
    Sub,
    /// Saw IAC inside subnegotiation body.
    SubIac,
}

/// Output of one `feed` step: cleaned payload plus negotiation responses to
/// send to the server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub data: Vec<u8>,
    pub responses: Vec<u8>,
}

pub struct TelnetMachine {
    state: State,
    sub_option: u8,
    sub_buffer: Vec<u8>,
    term: String,
    cols: u16,
    rows: u16,
    /// Options we have agreed to perform (for NAWS re-reports).
    active: HashSet<u8>,
    /// `(verb, option)` pairs already answered, to keep loops from echoing
    /// forever.
    answered: HashSet<(u8, u8)>,
}

impl TelnetMachine {
    pub fn new(term: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            state: State::Data,
            sub_option: 0,
            sub_buffer: Vec::new(),
            term: term.into(),
            cols,
            rows,
            active: HashSet::new(),
            answered: HashSet::new(),
        }
    }

    /// Update the window size. Returns a NAWS report when NAWS has been
    /// negotiated, to be written to the server.
    pub fn set_window(&mut self, cols: u16, rows: u16) -> Option<Vec<u8>> {
        self.cols = cols;
        self.rows = rows;
        self.active.contains(&option::NAWS).then(|| self.naws_report())
    }

    fn naws_report(&self) -> Vec<u8> {
        let mut out = vec![IAC, SB, option::NAWS];
        for byte in self
            .cols
            .to_be_bytes()
            .iter()
            .chain(self.rows.to_be_bytes().iter())
        {
            // 0xFF inside a subnegotiation must be doubled
            if *byte == IAC {
                out.push(IAC);
            }
            out.push(*byte);
        }
        out.extend_from_slice(&[IAC, SE]);
        out
    }

    fn ttype_report(&self) -> Vec<u8> {
        let mut out = vec![IAC, SB, option::TTYPE, TTYPE_IS];
        out.extend_from_slice(self.term.as_bytes());
        out.extend_from_slice(&[IAC, SE]);
        out
    }

    fn respond_once(&mut self, verb: u8, opt: u8, out: &mut StepOutput, reply: &[u8]) {
        if self.answered.insert((verb, opt)) {
            out.responses.extend_from_slice(reply);
        }
    }

    fn handle_negotiate(&mut self, verb: u8, opt: u8, out: &mut StepOutput) {
        match verb {
            DO => match opt {
                option::NAWS => {
                    self.active.insert(option::NAWS);
                    self.respond_once(DO, opt, out, &[IAC, WILL, option::NAWS]);
                    // immediate size report follows the WILL
                    let report = self.naws_report();
                    out.responses.extend_from_slice(&report);
                }
                option::TTYPE => {
                    self.active.insert(option::TTYPE);
                    self.respond_once(DO, opt, out, &[IAC, WILL, option::TTYPE]);
                }
                option::SGA | option::ECHO => {
                    self.active.insert(opt);
                    self.respond_once(DO, opt, out, &[IAC, WILL, opt]);
                }
                other => {
                    self.respond_once(DO, other, out, &[IAC, WONT, other]);
                }
            },
            WILL => match opt {
                option::ECHO | option::SGA => {
                    self.respond_once(WILL, opt, out, &[IAC, DO, opt]);
                }
                other => {
                    self.respond_once(WILL, other, out, &[IAC, DONT, other]);
                }
            },
            // withdrawals need no reply
            DONT | WONT => {
                self.active.remove(&opt);
            }
            _ => {}
        }
    }

    fn handle_subnegotiation(&mut self, out: &mut StepOutput) {
        if self.sub_option == option::TTYPE
            && self.sub_buffer.first() == Some(&TTYPE_SEND)
        {
            let report = self.ttype_report();
            out.responses.extend_from_slice(&report);
        }
        self.sub_buffer.clear();
    }

    /// Feed one inbound chunk through the machine.
    pub fn feed(&mut self, chunk: &[u8]) -> StepOutput {
        let mut out = StepOutput::default();

        for &byte in chunk {
            match self.state {
                State::Data => {
                    if byte == IAC {
                        self.state = State::Iac;
                    } else {
                        out.data.push(byte);
                    }
                }
                State::Iac => match byte {
                    IAC => {
                        // escaped literal 0xFF
                        out.data.push(IAC);
                        self.state = State::Data;
                    }
                    WILL | WONT | DO | DONT => {
                        self.state = State::Negotiate(byte);
                    }
                    SB => {
                        self.state = State::SubOption;
                    }
                    // other commands (NOP, GA, ...) are consumed silently
                    _ => {
                        self.state = State::Data;
                    }
                },
                State::Negotiate(verb) => {
                    self.handle_negotiate(verb, byte, &mut out);
                    self.state = State::Data;
                }
                State::SubOption => {
                    self.sub_option = byte;
                    self.sub_buffer.clear();
                    self.state = State::Sub;
                }
                State::Sub => {
                    if byte == IAC {
                        self.state = State::SubIac;
                    } else {
                        self.sub_buffer.push(byte);
                    }
                }
                State::SubIac => match byte {
                    IAC => {
                        self.sub_buffer.push(IAC);
                        self.state = State::Sub;
                    }
                    SE => {
                        self.handle_subnegotiation(&mut out);
                        self.state = State::Data;
                    }
                    _ => {
                        // malformed; drop the subnegotiation
                        self.sub_buffer.clear();
                        self.state = State::Data;
                    }
                },
            }
        }

        out
    }
}

/// Escape outbound payload bytes: a literal 0xFF becomes `IAC IAC`.
pub fn escape_outbound(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == IAC {
            out.push(IAC);
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_iac_across_chunks() {
        let mut machine = TelnetMachine::new("xterm", 80, 24);

        let first = machine.feed(&[0x41, 0x42, IAC]);
        assert_eq!(first.data, vec![0x41, 0x42]);
        assert!(first.responses.is_empty());

        let second = machine.feed(&[DO, option::ECHO, 0x43]);
        assert_eq!(second.data, vec![0x43]);
        assert_eq!(second.responses, vec![IAC, WILL, option::ECHO]);
    }

    #[test]
    fn iac_iac_decodes_to_single_ff() {
        let mut machine = TelnetMachine::new("xterm", 80, 24);
        let out = machine.feed(&[0x01, IAC, IAC, 0x02]);
        assert_eq!(out.data, vec![0x01, 0xFF, 0x02]);
        assert!(out.responses.is_empty());
    }

    #[test]
    fn do_naws_answers_will_plus_size_report() {
        let mut machine = TelnetMachine::new("xterm", 120, 40);
        let out = machine.feed(&[IAC, DO, option::NAWS]);
        assert!(out.data.is_empty());

        let mut expected = vec![IAC, WILL, option::NAWS, IAC, SB, option::NAWS];
        expected.extend_from_slice(&120u16.to_be_bytes());
        expected.extend_from_slice(&40u16.to_be_bytes());
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(out.responses, expected);
    }

    #[test]
    fn repeated_negotiation_is_answered_once() {
        let mut machine = TelnetMachine::new("xterm", 80, 24);
        let first = machine.feed(&[IAC, DO, option::ECHO]);
        assert_eq!(first.responses, vec![IAC, WILL, option::ECHO]);
        let second = machine.feed(&[IAC, DO, option::ECHO]);
        assert!(second.responses.is_empty());
    }

    #[test]
    fn unknown_options_are_refused() {
        let mut machine = TelnetMachine::new("xterm", 80, 24);
        let out = machine.feed(&[IAC, DO, 99, IAC, WILL, 98]);
        assert_eq!(
            out.responses,
            vec![IAC, WONT, 99, IAC, DONT, 98]
        );
    }

    #[test]
    fn ttype_send_subnegotiation_reports_terminal() {
        let mut machine = TelnetMachine::new("vt100", 80, 24);
        machine.feed(&[IAC, DO, option::TTYPE]);
        let out = machine.feed(&[IAC, SB, option::TTYPE, 1, IAC, SE]);

        let mut expected = vec![IAC, SB, option::TTYPE, 0];
        expected.extend_from_slice(b"vt100");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(out.responses, expected);
        assert!(out.data.is_empty());
    }

    #[test]
    fn payload_preserved_for_well_formed_frames() {
        // arbitrary interleaving of data and frames, split awkwardly
        let mut machine = TelnetMachine::new("xterm", 80, 24);
        let mut cleaned = Vec::new();

        let stream: Vec<u8> = [
            b"hello ".to_vec(),
            vec![IAC, WILL, option::ECHO],
            b"wor".to_vec(),
            vec![IAC, IAC],
            b"ld".to_vec(),
            vec![IAC, SB, option::TTYPE, 1, IAC, SE],
            b"!".to_vec(),
        ]
        .concat();

        // feed in 3-byte chunks to cross every boundary
        for chunk in stream.chunks(3) {
            cleaned.extend(machine.feed(chunk).data);
        }

        assert_eq!(cleaned, b"hello wor\xFFld!".to_vec());
    }

    #[test]
    fn set_window_reports_only_after_naws_negotiated() {
        let mut machine = TelnetMachine::new("xterm", 80, 24);
        assert!(machine.set_window(100, 30).is_none());

        machine.feed(&[IAC, DO, option::NAWS]);
        let report = machine.set_window(132, 43).unwrap();
        assert_eq!(report[0..3], [IAC, SB, option::NAWS]);
        assert_eq!(&report[report.len() - 2..], &[IAC, SE]);
    }

    #[test]
    fn outbound_ff_is_escaped() {
        assert_eq!(escape_outbound(&[0x01, 0xFF, 0x02]), vec![0x01, IAC, IAC, 0x02]);
    }
}
