// reprap_host_rust/src/gcode_buffer.rs

// Holds an individual G-code from one source and provides the functions to
// parse it. A buffer is a single-command slot: bytes accumulate until a line
// terminator arrives, the executor acts on the finished line, then the slot
// is reused.

use std::collections::VecDeque;

use crate::GCODE_LENGTH;

/// Where a channel's bytes come from. Channel identity is fixed for the
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSource {
    Http,
    Telnet,
    File,
    Usb,
    Aux,
    Daemon,
    Queue,
}

pub const NUM_SOURCES: usize = 7;

impl CodeSource {
    pub const ALL: [CodeSource; NUM_SOURCES] = [
        CodeSource::Http,
        CodeSource::Telnet,
        CodeSource::File,
        CodeSource::Usb,
        CodeSource::Aux,
        CodeSource::Daemon,
        CodeSource::Queue,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        match self {
            CodeSource::Http => "http",
            CodeSource::Telnet => "telnet",
            CodeSource::File => "file",
            CodeSource::Usb => "serial",
            CodeSource::Aux => "aux",
            CodeSource::Daemon => "daemon",
            CodeSource::Queue => "queue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// Accumulating characters, or empty.
    Idle,
    /// A complete line is waiting to be executed.
    Ready,
    /// The executor has started acting on the line.
    Executing,
}

/// Result of feeding one byte into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Byte stored (or discarded as comment/whitespace); line not finished.
    Accepted,
    /// The buffer overflowed; the line was dropped.
    Full,
    /// A complete command is now ready for execution.
    CompleteLine,
    /// The line carried a bad checksum or out-of-sequence line number and
    /// was discarded; the sender should resend this line.
    ResendRequest(i32),
}

pub struct GCodeBuffer {
    identity: CodeSource,
    gcode_buffer: String,
    /// Index one past the parameter letter found by the last `seen()` call,
    /// or None if nothing was found.
    read_pointer: Option<usize>,
    in_comment: bool,
    checksum_required: bool,
    state: BufferState,
    /// Line number expected next when checksums are enforced (M110 resets).
    expected_line_number: i32,
    tool_number_adjust: i32,
    /// If codes fed into this buffer are being copied to a file (M28),
    /// the directory that file lives in.
    writing_file_directory: Option<String>,
}

impl GCodeBuffer {
    pub fn new(identity: CodeSource) -> Self {
        GCodeBuffer {
            identity,
            gcode_buffer: String::with_capacity(GCODE_LENGTH),
            read_pointer: None,
            in_comment: false,
            checksum_required: false,
            state: BufferState::Idle,
            expected_line_number: 0,
            tool_number_adjust: 0,
            writing_file_directory: None,
        }
    }

    pub fn identity(&self) -> CodeSource {
        self.identity
    }

    /// Drop any partial command and return to the idle state.
    pub fn init(&mut self) {
        self.gcode_buffer.clear();
        self.read_pointer = None;
        self.in_comment = false;
        self.state = BufferState::Idle;
    }

    pub fn is_empty(&self) -> bool {
        self.gcode_buffer.trim().is_empty()
    }

    /// A finished line is waiting for the executor.
    pub fn is_ready(&self) -> bool {
        self.state == BufferState::Ready
    }

    /// The executor has picked the line up but not completed it.
    pub fn is_executing(&self) -> bool {
        self.state == BufferState::Executing
    }

    /// Ready or executing: the slot cannot take a new command yet.
    pub fn is_active(&self) -> bool {
        self.state != BufferState::Idle
    }

    pub fn start_executing(&mut self) {
        if self.state == BufferState::Ready {
            self.state = BufferState::Executing;
        }
    }

    /// Mark the current command finished (or not). Finishing clears the slot.
    pub fn set_finished(&mut self, finished: bool) {
        if finished {
            self.init();
        } else {
            self.state = BufferState::Executing;
        }
    }

    pub fn set_comms_properties(&mut self, flags: u32) {
        self.checksum_required = (flags & 1) != 0;
    }

    pub fn tool_number_adjust(&self) -> i32 {
        self.tool_number_adjust
    }

    pub fn set_tool_number_adjust(&mut self, adjust: i32) {
        self.tool_number_adjust = adjust;
    }

    pub fn writing_file_directory(&self) -> Option<&str> {
        self.writing_file_directory.as_deref()
    }

    pub fn set_writing_file_directory(&mut self, dir: Option<&str>) {
        self.writing_file_directory = dir.map(|d| d.to_string());
    }

    /// Reset the line-number sequence (M110).
    pub fn set_line_number(&mut self, n: i32) {
        self.expected_line_number = n;
    }

    /// Add a character to the end. Comments are discarded as they arrive;
    /// CR or LF finishes the command.
    pub fn put(&mut self, b: u8) -> PutResult {
        if self.is_active() {
            // A line is already waiting; the producer must hold this byte.
            return PutResult::Full;
        }

        let c = b as char;
        if c == '\n' || c == '\r' {
            self.in_comment = false;
            if self.gcode_buffer.trim().is_empty() {
                self.gcode_buffer.clear();
                return PutResult::Accepted;
            }
            return self.finish_line();
        }

        if self.in_comment {
            return PutResult::Accepted;
        }
        if c == ';' {
            self.in_comment = true;
            return PutResult::Accepted;
        }

        if self.gcode_buffer.len() >= GCODE_LENGTH - 1 {
            log::error!("G-code buffer ({}) overflowed, line discarded", self.identity.name());
            self.init();
            return PutResult::Full;
        }

        self.gcode_buffer.push(c);
        PutResult::Accepted
    }

    /// Bulk version of `put`. Stops at the first complete line or error.
    pub fn put_str(&mut self, s: &str) -> PutResult {
        let mut last = PutResult::Accepted;
        for &b in s.as_bytes() {
            last = self.put(b);
            if last != PutResult::Accepted {
                break;
            }
        }
        last
    }

    /// Pull bytes from a producer queue until a line completes or the
    /// producer runs dry, and report how the fill ended so the caller can
    /// act on a finished line or a resend request. No-op (Full) if a line
    /// is already pending; a refused byte goes back to the producer.
    pub fn fill_from(&mut self, bytes: &mut VecDeque<u8>) -> PutResult {
        if self.is_active() {
            return PutResult::Full;
        }
        while let Some(b) = bytes.pop_front() {
            match self.put(b) {
                PutResult::Accepted => {}
                PutResult::Full => {
                    bytes.push_front(b);
                    return PutResult::Full;
                }
                other => return other,
            }
        }
        PutResult::Accepted
    }

    /// Validate framing (line number + checksum) and strip it, leaving only
    /// the command text in the buffer.
    fn finish_line(&mut self) -> PutResult {
        let line = std::mem::take(&mut self.gcode_buffer);
        let trimmed = line.trim();

        let mut body = trimmed;
        let mut line_number: Option<i32> = None;

        if let Some(rest) = body.strip_prefix(|c| c == 'N' || c == 'n') {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                line_number = digits.parse::<i32>().ok();
                body = rest[digits.len()..].trim_start();
            }
        }

        let mut checksum: Option<u32> = None;
        if let Some(star) = body.rfind('*') {
            let (head, tail) = body.split_at(star);
            if let Ok(cs) = tail[1..].trim().parse::<u32>() {
                checksum = Some(cs);
                body = head.trim_end();
            }
        }

        if self.checksum_required {
            let expected = self.expected_line_number;
            match (line_number, checksum) {
                (Some(n), Some(cs)) => {
                    // The checksum covers everything up to the '*', including
                    // the line number itself.
                    let upto = trimmed[..trimmed.rfind('*').unwrap_or(trimmed.len())].as_bytes();
                    let computed = upto.iter().fold(0u32, |acc, &b| acc ^ (b as u32));
                    if computed != cs || n != expected {
                        self.init();
                        return PutResult::ResendRequest(expected);
                    }
                    self.expected_line_number = expected.wrapping_add(1);
                }
                _ => {
                    self.init();
                    return PutResult::ResendRequest(expected);
                }
            }
        } else if let Some(n) = line_number {
            // Unenforced framing is accepted and stripped; a valid checksum
            // makes no difference to the parsed command.
            self.expected_line_number = n.wrapping_add(1);
        }

        if body.is_empty() {
            self.init();
            return PutResult::Accepted;
        }

        self.gcode_buffer = body.to_string();
        self.read_pointer = None;
        self.state = BufferState::Ready;
        PutResult::CompleteLine
    }

    /// What G-code has been fed into this buffer?
    pub fn buffer(&self) -> &str {
        &self.gcode_buffer
    }

    /// The command this buffer holds, with the same M-before-G-before-T
    /// priority the dispatcher uses. None for an empty or letterless buffer.
    pub fn command(&self) -> Option<(char, i32)> {
        for letter in ['M', 'G', 'T'] {
            if let Some(i) = self
                .gcode_buffer
                .char_indices()
                .find(|(_, c)| c.eq_ignore_ascii_case(&letter))
                .map(|(i, _)| i)
            {
                let digits: String = self.gcode_buffer[i + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == '-')
                    .collect();
                let number = digits.parse::<i32>().unwrap_or(0);
                return Some((letter, number));
            }
        }
        None
    }

    /// Is the key letter present? Command letters G/M/T match either case;
    /// parameter letters are case-sensitive. A hit primes the read pointer
    /// for the get_* calls.
    pub fn seen(&mut self, letter: char) -> bool {
        let command_letter = matches!(letter, 'G' | 'M' | 'T');
        for (i, c) in self.gcode_buffer.char_indices() {
            let hit = if command_letter {
                c.eq_ignore_ascii_case(&letter)
            } else {
                c == letter
            };
            if hit {
                self.read_pointer = Some(i + 1);
                return true;
            }
        }
        self.read_pointer = None;
        false
    }

    fn value_str(&self) -> &str {
        let start = match self.read_pointer {
            Some(p) => p,
            None => return "",
        };
        let rest = &self.gcode_buffer[start..];
        let end = rest
            .find(|c: char| c.is_whitespace())
            .unwrap_or(rest.len());
        &rest[..end]
    }

    /// Get a float after the key letter found by the last `seen()`.
    pub fn get_f_value(&self) -> f32 {
        let v = self.value_str();
        let end = v
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(v.len());
        v[..end].parse().unwrap_or(0.0)
    }

    /// Get an integer after the key letter.
    pub fn get_i_value(&self) -> i32 {
        self.get_l_value() as i32
    }

    /// Get a long integer after the key letter.
    pub fn get_l_value(&self) -> i64 {
        let v = self.value_str();
        let end = v
            .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+'))
            .unwrap_or(v.len());
        v[..end].parse().unwrap_or(0)
    }

    /// Get a string after the key letter: either a quoted string or a bare
    /// token up to the next whitespace.
    pub fn get_string(&self) -> String {
        let start = match self.read_pointer {
            Some(p) => p,
            None => return String::new(),
        };
        let rest = &self.gcode_buffer[start..];
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            stripped[..end].to_string()
        } else {
            self.value_str().to_string()
        }
    }

    /// Get the command tail with no preceding key letter. Used for filenames:
    /// everything after the first word of the command.
    pub fn get_unprecedented_string(&self, optional: bool) -> Option<String> {
        let s = self.gcode_buffer.trim();
        let tail = match s.find(char::is_whitespace) {
            Some(i) => s[i..].trim(),
            None => "",
        };
        if tail.is_empty() {
            if optional {
                None
            } else {
                Some(String::new())
            }
        } else {
            Some(tail.to_string())
        }
    }

    /// Get a colon-separated float list after the key letter. If the list is
    /// shorter than `dest` and `pad_with_last` is set, the final element
    /// fills the remaining slots. Returns the number of values stored.
    pub fn get_float_array(&self, dest: &mut [f32], pad_with_last: bool) -> usize {
        let v = self.value_str();
        if v.is_empty() {
            return 0;
        }
        let mut count = 0;
        let mut last = 0.0;
        for part in v.split(':') {
            if count >= dest.len() {
                break;
            }
            last = part.parse().unwrap_or(0.0);
            dest[count] = last;
            count += 1;
        }
        if pad_with_last && count > 0 {
            for slot in dest[count..].iter_mut() {
                *slot = last;
            }
            return dest.len();
        }
        count
    }

    /// Get a colon-separated integer list after the key letter.
    pub fn get_long_array(&self, dest: &mut [i64]) -> usize {
        let v = self.value_str();
        if v.is_empty() {
            return 0;
        }
        let mut count = 0;
        for part in v.split(':') {
            if count >= dest.len() {
                break;
            }
            dest[count] = part.parse().unwrap_or(0);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(line: &str) -> GCodeBuffer {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        assert_eq!(gb.put_str(line), PutResult::CompleteLine);
        gb
    }

    #[test]
    fn accumulates_until_newline() {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        assert_eq!(gb.put_str("G1 X10"), PutResult::Accepted);
        assert!(!gb.is_ready());
        assert_eq!(gb.put(b'\n'), PutResult::CompleteLine);
        assert!(gb.is_ready());
        assert_eq!(gb.buffer(), "G1 X10");
    }

    #[test]
    fn strips_comments() {
        let gb = ready("G1 X10 ; move over\n");
        assert_eq!(gb.buffer(), "G1 X10");
    }

    #[test]
    fn comment_only_line_is_discarded() {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        assert_eq!(gb.put_str("; nothing here\n"), PutResult::Accepted);
        assert!(!gb.is_ready());
    }

    #[test]
    fn bytes_after_complete_line_are_deferred() {
        let mut gb = ready("G28\n");
        assert_eq!(gb.put(b'G'), PutResult::Full);
    }

    #[test]
    fn fill_from_stops_at_line_end() {
        let mut gb = GCodeBuffer::new(CodeSource::File);
        let mut q: VecDeque<u8> = b"G1 X1\nG1 X2\n".iter().copied().collect();
        assert_eq!(gb.fill_from(&mut q), PutResult::CompleteLine);
        assert_eq!(gb.buffer(), "G1 X1");
        assert_eq!(q.len(), 6); // second line untouched
    }

    #[test]
    fn fill_from_surfaces_resend_requests() {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        gb.set_comms_properties(1);
        let mut q: VecDeque<u8> = b"N0 G28*99\nG1 X1\n".iter().copied().collect();
        assert_eq!(gb.fill_from(&mut q), PutResult::ResendRequest(0));
        assert!(gb.is_empty());
        // The following line is still waiting for the next fill.
        assert_eq!(q.len(), 6);
    }

    #[test]
    fn fill_from_with_a_pending_line_leaves_the_producer_alone() {
        let mut gb = ready("G28\n");
        let mut q: VecDeque<u8> = b"G1 X1\n".iter().copied().collect();
        assert_eq!(gb.fill_from(&mut q), PutResult::Full);
        assert_eq!(q.len(), 6);
    }

    #[test]
    fn seen_and_values() {
        let mut gb = ready("G1 X10.5 Y-3 F1200 S1\n");
        assert!(gb.seen('G'));
        assert_eq!(gb.get_i_value(), 1);
        assert!(gb.seen('X'));
        assert!((gb.get_f_value() - 10.5).abs() < 1e-6);
        assert!(gb.seen('Y'));
        assert!((gb.get_f_value() + 3.0).abs() < 1e-6);
        assert!(gb.seen('S'));
        assert_eq!(gb.get_i_value(), 1);
        assert!(!gb.seen('Z'));
    }

    #[test]
    fn command_letter_matches_either_case() {
        let mut gb = ready("g28 x\n");
        assert!(gb.seen('G'));
        assert_eq!(gb.get_i_value(), 28);
        // Parameter letters stay case-sensitive.
        assert!(!gb.seen('X'));
        assert!(gb.seen('x'));
    }

    #[test]
    fn float_array_with_padding() {
        let gb = {
            let mut gb = ready("M92 X80\n");
            assert!(gb.seen('X'));
            gb
        };
        let mut vals = [0.0f32; 4];
        let n = gb.get_float_array(&mut vals, true);
        assert_eq!(n, 4);
        assert_eq!(vals, [80.0, 80.0, 80.0, 80.0]);
    }

    #[test]
    fn float_array_explicit_values() {
        let mut gb = ready("M92 E420:430\n");
        assert!(gb.seen('E'));
        let mut vals = [0.0f32; 4];
        let n = gb.get_float_array(&mut vals, false);
        assert_eq!(n, 2);
        assert_eq!(&vals[..2], &[420.0, 430.0]);
    }

    #[test]
    fn long_array() {
        let mut gb = ready("M563 P1 D0:1 H1:2\n");
        assert!(gb.seen('D'));
        let mut vals = [0i64; 6];
        assert_eq!(gb.get_long_array(&mut vals), 2);
        assert_eq!(&vals[..2], &[0, 1]);
    }

    #[test]
    fn unprecedented_string_returns_tail() {
        let gb = ready("M23 parts/bracket v2.gcode\n");
        assert_eq!(
            gb.get_unprecedented_string(false).unwrap(),
            "parts/bracket v2.gcode"
        );
        let gb = ready("M36\n");
        assert_eq!(gb.get_unprecedented_string(true), None);
    }

    #[test]
    fn quoted_string_parameter() {
        let mut gb = ready("M550 P\"My Printer\"\n");
        assert!(gb.seen('P'));
        assert_eq!(gb.get_string(), "My Printer");
    }

    #[test]
    fn checksum_accepted_when_valid() {
        // XOR of "N3 T0" is 57.
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        gb.set_comms_properties(1);
        gb.set_line_number(3);
        assert_eq!(gb.put_str("N3 T0*57\n"), PutResult::CompleteLine);
        assert_eq!(gb.buffer(), "T0");
    }

    #[test]
    fn checksum_mismatch_requests_resend() {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        gb.set_comms_properties(1);
        gb.set_line_number(3);
        assert_eq!(gb.put_str("N3 T0*99\n"), PutResult::ResendRequest(3));
        assert!(gb.is_empty());
    }

    #[test]
    fn line_parses_identically_with_and_without_checksum_enforcement() {
        let mut strict = GCodeBuffer::new(CodeSource::Usb);
        strict.set_comms_properties(1);
        strict.set_line_number(3);
        assert_eq!(strict.put_str("N3 T0*57\n"), PutResult::CompleteLine);

        let mut lax = GCodeBuffer::new(CodeSource::Usb);
        assert_eq!(lax.put_str("N3 T0*57\n"), PutResult::CompleteLine);

        assert_eq!(strict.buffer(), lax.buffer());
    }

    #[test]
    fn missing_checksum_when_required_requests_resend() {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        gb.set_comms_properties(1);
        assert_eq!(gb.put_str("G28\n"), PutResult::ResendRequest(0));
    }

    #[test]
    fn overflow_discards_line() {
        let mut gb = GCodeBuffer::new(CodeSource::Usb);
        let long = "G1 ".to_string() + &"X".repeat(GCODE_LENGTH);
        assert_eq!(gb.put_str(&long), PutResult::Full);
        assert!(gb.is_empty());
    }
}
