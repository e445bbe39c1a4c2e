// reprap_host_rust/src/reply.rs

// Routes command replies to the sinks that serve each channel, wrapping
// them in the envelope the selected firmware emulation expects. All
// formatting lives here; handlers produce bare text.

use crate::gcode_buffer::CodeSource;
use crate::output_buffer::{BufferIndex, OutputBufferPool};

/// Firmware personalities a legacy host may expect to talk to (M555).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Me,
    RepRapFirmware,
    Marlin,
    Teacup,
    Sprinter,
    Repetier,
}

impl Compatibility {
    pub fn from_code(code: i32) -> Option<Compatibility> {
        match code {
            0 => Some(Compatibility::Me),
            1 => Some(Compatibility::RepRapFirmware),
            2 => Some(Compatibility::Marlin),
            3 => Some(Compatibility::Teacup),
            4 => Some(Compatibility::Sprinter),
            5 => Some(Compatibility::Repetier),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compatibility::Me => "me",
            Compatibility::RepRapFirmware => "RepRapFirmware",
            Compatibility::Marlin => "Marlin",
            Compatibility::Teacup => "Teacup",
            Compatibility::Sprinter => "Sprinter",
            Compatibility::Repetier => "Repetier",
        }
    }
}

/// Destination class of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Http,
    Telnet,
    Host,
    Aux,
    /// Goes to every attached host-facing sink.
    Generic,
}

/// A reply destination: the HTTP response buffer, the USB stream, the
/// auxiliary UART, a test capture...
pub trait ReplySink {
    fn wants(&self, mt: MessageType) -> bool;
    fn write_string(&mut self, s: &str);
    /// Hand over a buffer chain. The default flattens it; streaming sinks
    /// can override and take a shared reference instead.
    fn attach_buffer_chain(&mut self, pool: &mut OutputBufferPool, chain: BufferIndex) {
        let text = pool.collect(chain);
        self.write_string(&text);
        pool.release_all(chain);
    }
}

/// The command a reply belongs to, for emulation-specific envelopes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplyContext {
    pub source: CodeSource,
    /// Command letter and number, if the line parsed that far.
    pub command: Option<(char, i32)>,
    pub error: bool,
    pub doing_file_macro: bool,
}

trait EmulationPolicy {
    /// Wrap `reply` for the wire, or None to drop it.
    fn format(&self, ctx: &ReplyContext, reply: &str) -> Option<String>;
}

struct NativePolicy;

impl EmulationPolicy for NativePolicy {
    fn format(&self, ctx: &ReplyContext, reply: &str) -> Option<String> {
        if reply.is_empty() {
            return None;
        }
        if ctx.error {
            Some(format!("Error: {}", reply))
        } else {
            Some(reply.to_string())
        }
    }
}

struct MarlinPolicy;

impl EmulationPolicy for MarlinPolicy {
    fn format(&self, ctx: &ReplyContext, reply: &str) -> Option<String> {
        // M998 asks the host to resend, everything else acknowledges.
        let response = match ctx.command {
            Some(('M', 998)) => "rs ",
            _ => "ok",
        };
        match ctx.command {
            Some(('M', 20)) => Some(format!(
                "Begin file list\n{}End file list\n{}\n",
                reply, response
            )),
            Some(('M', 28)) => Some(format!("{}\n{}", response, reply)),
            Some(('M', 105)) | Some(('M', 998)) => Some(format!("{} {}", response, reply)),
            _ => {
                if !reply.is_empty() && !ctx.doing_file_macro {
                    Some(format!("{}{}\n", reply, response))
                } else if !reply.is_empty() {
                    Some(reply.to_string())
                } else {
                    Some(format!("{}\n", response))
                }
            }
        }
    }
}

struct UnsupportedPolicy(Compatibility);

impl EmulationPolicy for UnsupportedPolicy {
    fn format(&self, _ctx: &ReplyContext, _reply: &str) -> Option<String> {
        Some(format!("Emulation of {} is not yet supported.\n", self.0.name()))
    }
}

pub struct ReplyRouter {
    sinks: Vec<Box<dyn ReplySink>>,
    /// Emulation selected per channel; only USB and Telnet honour it.
    emulation: [Compatibility; crate::gcode_buffer::NUM_SOURCES],
    /// Aux replies are stashed and collected by M105/M408 polling.
    aux_reply: String,
    aux_seq: u32,
    aux_detected: bool,
}

impl ReplyRouter {
    pub fn new() -> Self {
        ReplyRouter {
            sinks: Vec::new(),
            emulation: [Compatibility::Me; crate::gcode_buffer::NUM_SOURCES],
            aux_reply: String::new(),
            aux_seq: 0,
            aux_detected: false,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ReplySink>) {
        self.sinks.push(sink);
    }

    pub fn set_emulation(&mut self, source: CodeSource, c: Compatibility) {
        self.emulation[source.index()] = c;
    }

    pub fn emulation(&self, source: CodeSource) -> Compatibility {
        self.emulation[source.index()]
    }

    /// Record that the aux line has produced at least one code, so aux
    /// replies are worth keeping.
    pub fn set_aux_detected(&mut self) {
        self.aux_detected = true;
    }

    pub fn have_aux(&self) -> bool {
        self.aux_detected
    }

    /// Take the buffered aux reply and its sequence number.
    pub fn take_aux_reply(&mut self) -> (String, u32) {
        (std::mem::take(&mut self.aux_reply), self.aux_seq)
    }

    fn message_type(source: CodeSource) -> MessageType {
        match source {
            CodeSource::Http => MessageType::Http,
            CodeSource::Telnet => MessageType::Telnet,
            CodeSource::Usb => MessageType::Host,
            CodeSource::Aux => MessageType::Aux,
            _ => MessageType::Generic,
        }
    }

    fn policy(&self, ctx: &ReplyContext) -> Box<dyn EmulationPolicy> {
        // The second UART (e.g. a control panel) always speaks natively.
        let uses_emulation =
            matches!(ctx.source, CodeSource::Usb | CodeSource::Telnet);
        let c = if uses_emulation { self.emulation(ctx.source) } else { Compatibility::Me };
        match c {
            Compatibility::Me | Compatibility::RepRapFirmware => Box::new(NativePolicy),
            Compatibility::Marlin => Box::new(MarlinPolicy),
            other => Box::new(UnsupportedPolicy(other)),
        }
    }

    /// Format and deliver a plain-text reply for the given command context.
    pub fn handle_reply(&mut self, ctx: &ReplyContext, reply: &str) {
        // Don't flood hosts with empty acknowledgements for every line of a
        // file or macro.
        if matches!(ctx.source, CodeSource::File) && reply.is_empty() {
            return;
        }
        if ctx.doing_file_macro && reply.is_empty() {
            return;
        }

        if ctx.source == CodeSource::Aux {
            if reply.is_empty() || !self.aux_detected {
                return;
            }
            self.aux_seq = self.aux_seq.wrapping_add(1);
            self.aux_reply.push_str(reply);
            return;
        }

        if let Some(text) = self.policy(ctx).format(ctx, reply) {
            self.dispatch(Self::message_type(ctx.source), &text);
        }
    }

    /// Deliver a buffer chain built elsewhere (file lists, JSON status).
    pub fn handle_reply_chain(
        &mut self,
        ctx: &ReplyContext,
        pool: &mut OutputBufferPool,
        chain: BufferIndex,
    ) {
        let text = pool.collect(chain);
        pool.release_all(chain);
        self.handle_reply(ctx, &text);
    }

    /// Send raw text to a destination class, outside any command context.
    pub fn dispatch(&mut self, mt: MessageType, text: &str) {
        let mut delivered = false;
        for sink in self.sinks.iter_mut() {
            if sink.wants(mt) || (mt == MessageType::Generic && !sink.wants(MessageType::Aux)) {
                sink.write_string(text);
                delivered = true;
            }
        }
        if !delivered {
            log::info!("{}", text.trim_end());
        }
    }

    /// Fan a shared chain out to every sink that wants `mt`, bumping the
    /// reference count once per extra consumer.
    pub fn dispatch_chain(
        &mut self,
        mt: MessageType,
        pool: &mut OutputBufferPool,
        chain: BufferIndex,
    ) {
        let takers: Vec<usize> = self
            .sinks
            .iter()
            .enumerate()
            .filter(|(_, s)| s.wants(mt))
            .map(|(i, _)| i)
            .collect();
        if takers.is_empty() {
            pool.release_all(chain);
            return;
        }
        for _ in 1..takers.len() {
            pool.increase_references(chain);
        }
        for i in takers {
            self.sinks[i].attach_buffer_chain(pool, chain);
        }
    }

    pub fn reset(&mut self) {
        self.aux_reply.clear();
        self.aux_seq = 0;
    }
}

impl Default for ReplyRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Capture {
        mt: MessageType,
        lines: Rc<RefCell<Vec<String>>>,
    }

    impl ReplySink for Capture {
        fn wants(&self, mt: MessageType) -> bool {
            mt == self.mt
        }
        fn write_string(&mut self, s: &str) {
            self.lines.borrow_mut().push(s.to_string());
        }
    }

    fn router_with_host() -> (ReplyRouter, Rc<RefCell<Vec<String>>>) {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let mut router = ReplyRouter::new();
        router.add_sink(Box::new(Capture { mt: MessageType::Host, lines: lines.clone() }));
        (router, lines)
    }

    fn ctx(source: CodeSource, command: Option<(char, i32)>, error: bool) -> ReplyContext {
        ReplyContext { source, command, error, doing_file_macro: false }
    }

    #[test]
    fn native_error_prefix() {
        let (mut router, lines) = router_with_host();
        router.handle_reply(&ctx(CodeSource::Usb, Some(('G', 29)), true), "unknown code\n");
        assert_eq!(lines.borrow()[0], "Error: unknown code\n");
    }

    #[test]
    fn native_empty_reply_is_dropped() {
        let (mut router, lines) = router_with_host();
        router.handle_reply(&ctx(CodeSource::Usb, Some(('G', 92)), false), "");
        assert!(lines.borrow().is_empty());
    }

    #[test]
    fn marlin_wraps_with_ok() {
        let (mut router, lines) = router_with_host();
        router.set_emulation(CodeSource::Usb, Compatibility::Marlin);
        router.handle_reply(&ctx(CodeSource::Usb, Some(('G', 92)), false), "");
        assert_eq!(lines.borrow()[0], "ok\n");
    }

    #[test]
    fn marlin_file_list_envelope() {
        let (mut router, lines) = router_with_host();
        router.set_emulation(CodeSource::Usb, Compatibility::Marlin);
        router.handle_reply(
            &ctx(CodeSource::Usb, Some(('M', 20)), false),
            "a.gcode\nb.gcode\n",
        );
        assert_eq!(
            lines.borrow()[0],
            "Begin file list\na.gcode\nb.gcode\nEnd file list\nok\n"
        );
    }

    #[test]
    fn marlin_m105_inline_ok() {
        let (mut router, lines) = router_with_host();
        router.set_emulation(CodeSource::Usb, Compatibility::Marlin);
        router.handle_reply(&ctx(CodeSource::Usb, Some(('M', 105)), false), "T:20.0\n");
        assert_eq!(lines.borrow()[0], "ok T:20.0\n");
    }

    #[test]
    fn emulation_only_applies_to_usb_and_telnet() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let mut router = ReplyRouter::new();
        router.add_sink(Box::new(Capture { mt: MessageType::Http, lines: lines.clone() }));
        router.set_emulation(CodeSource::Http, Compatibility::Marlin);
        router.handle_reply(&ctx(CodeSource::Http, Some(('G', 92)), false), "");
        // Native formatting drops the empty reply; no "ok" appears.
        assert!(lines.borrow().is_empty());
    }

    #[test]
    fn aux_replies_are_stashed_with_sequence() {
        let (mut router, _lines) = router_with_host();
        router.set_aux_detected();
        router.handle_reply(&ctx(CodeSource::Aux, Some(('M', 105)), false), "T:200.0\n");
        let (reply, seq) = router.take_aux_reply();
        assert_eq!(reply, "T:200.0\n");
        assert_eq!(seq, 1);
        assert_eq!(router.take_aux_reply().0, "");
    }

    #[test]
    fn chain_fanout_bumps_references() {
        let lines_a = Rc::new(RefCell::new(Vec::new()));
        let lines_b = Rc::new(RefCell::new(Vec::new()));
        let mut router = ReplyRouter::new();
        router.add_sink(Box::new(Capture { mt: MessageType::Http, lines: lines_a.clone() }));
        router.add_sink(Box::new(Capture { mt: MessageType::Http, lines: lines_b.clone() }));

        let mut pool = OutputBufferPool::new();
        let chain = pool.allocate().unwrap();
        pool.cat(chain, "status");
        router.dispatch_chain(MessageType::Http, &mut pool, chain);
        assert_eq!(lines_a.borrow()[0], "status");
        assert_eq!(lines_b.borrow()[0], "status");
        assert_eq!(pool.used(), 0);
    }
}
