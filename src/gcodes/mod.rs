// reprap_host_rust/src/gcodes/mod.rs

// The G-code executor. Interprets codes from every input channel, one
// command at a time per channel, and drives the collaborator interfaces
// (planner, heat, platform) to make the machine do what the codes say.
//
// Everything here is cooperative: no call may block. A command that must
// wait (move slot full, lock held, heater not at temperature) leaves its
// buffer in the executing state and is retried on a later tick.

mod dispatch;
mod files;
mod move_builder;
mod probing;

use std::collections::VecDeque;

use crate::code_queue::CodeQueue;
use crate::core_traits::{
    Context, FileHandle, FilePosition, RawMove, RestorePoint, NO_FILE_POSITION,
};
use crate::gcode_buffer::{CodeSource, GCodeBuffer, PutResult, NUM_SOURCES};
use crate::machine_state::{GCodeState, MachineStateStack};
use crate::output_buffer::OutputBufferPool;
use crate::reply::{MessageType, ReplyContext, ReplyRouter};
use crate::resources::{ResourceLockTable, MOVE_RESOURCE};
use crate::tools::ToolRack;
use crate::triggers::TriggerEngine;
use crate::{AXES, DRIVES, FANS, GCODE_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseStatus {
    NotPaused,
    Pausing,
    Paused,
    Resuming,
}

/// Phase of the single-point probe cycle (G30). One phase advances per
/// tick; each motion phase is a canned-cycle move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbePhase {
    Idle,
    RaiseHead,
    MoveToPoint,
    Probing,
    Retreat,
}

/// How an attempt to start a macro file went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MacroStart {
    Started,
    Missing,
    StackFull,
}

pub(crate) struct HashJob {
    pub file: FileHandle,
    pub source: CodeSource,
    pub hasher: sha1::Sha1,
}

pub struct GCodes {
    active: bool,
    emergency_stopped: bool,

    buffers: Vec<GCodeBuffer>,
    inbound: Vec<VecDeque<u8>>,
    stacks: Vec<MachineStateStack>,

    pub(crate) locks: ResourceLockTable,
    pub(crate) queue: CodeQueue,
    pub(crate) triggers: TriggerEngine,
    pub(crate) tools: ToolRack,
    pub(crate) router: ReplyRouter,
    pub(crate) pool: OutputBufferPool,

    // Modal printer state, mutated only by this executor.
    pub(crate) axes_homed: u32,
    pub(crate) distance_scale: f32,
    pub(crate) axis_scale_factors: [f32; AXES],
    pub(crate) last_extruder_position: [f32; DRIVES - AXES],
    pub(crate) limit_axes: bool,
    pub(crate) simulating: bool,
    pub(crate) simulation_time_us: u64,
    pub(crate) saved_simulation_point: RestorePoint,

    /// The one move built but not yet consumed by the planner.
    pub(crate) move_slot: Option<RawMove>,
    /// Scratch for assembling a move from the current position.
    pub(crate) move_buffer: [f32; DRIVES],

    pub(crate) pause_status: PauseStatus,
    pub(crate) pause_restore: RestorePoint,
    pub(crate) paused_fan_values: [f32; FANS],
    pub(crate) do_pause_macro: bool,
    pub(crate) file_to_print: Option<FileHandle>,
    pub(crate) fraction_of_file_printed: Option<f32>,

    round_robin: usize,
    /// Channel whose endstop-checking move must drain before new moves.
    pub(crate) waiting_for_move_source: Option<CodeSource>,
    /// File position of the command currently being read from the print
    /// file, recorded per move for pause bookkeeping.
    pub(crate) file_position: FilePosition,

    pub(crate) to_be_homed: u32,
    pub(crate) new_tool_number: i32,

    pub(crate) probe_phase: ProbePhase,
    pub(crate) probe_count: usize,
    pub(crate) z_probes_set: bool,
    pub(crate) last_probed_z: f32,
    pub(crate) canned_move_queued: bool,

    pub(crate) dwell: Option<(CodeSource, u64)>,

    /// M206 moves the axes by the given offsets and then re-declares the
    /// old coordinates, so the machine shifts without the numbers moving.
    pub(crate) offset_record: [f32; DRIVES],
    pub(crate) offset_set: bool,
    pub(crate) axis_compensation: [f32; AXES],
    pub(crate) heater_fault_timeout: f32,

    pub(crate) hashing: Option<HashJob>,
    pub(crate) file_being_written: Option<FileHandle>,
    pub(crate) writing_source: Option<CodeSource>,

    pub(crate) queue_source: CodeSource,

    pub(crate) cancel_wait: bool,
    /// M0/M1 switch heaters off afterwards unless H1 was given.
    pub(crate) stop_switch_off_heaters: bool,
    pub(crate) debug_level: u32,
    pub(crate) display_message: String,

    // Firmware retraction settings (M207) and state (G10/G11).
    pub(crate) retract_length: f32,
    pub(crate) retract_extra: f32,
    /// mm/min, used as configured and never scaled by the speed factor.
    pub(crate) retract_speed: f32,
    pub(crate) retract_hop: f32,
    pub(crate) retracted: bool,
}

impl GCodes {
    pub fn new() -> Self {
        let buffers: Vec<GCodeBuffer> =
            CodeSource::ALL.iter().map(|s| GCodeBuffer::new(*s)).collect();
        let inbound = (0..NUM_SOURCES).map(|_| VecDeque::new()).collect();
        let stacks = (0..NUM_SOURCES).map(|_| MachineStateStack::new()).collect();
        GCodes {
            active: false,
            emergency_stopped: false,
            buffers,
            inbound,
            stacks,
            locks: ResourceLockTable::new(),
            queue: CodeQueue::new(),
            triggers: TriggerEngine::new(),
            tools: ToolRack::new(),
            router: ReplyRouter::new(),
            pool: OutputBufferPool::new(),
            axes_homed: 0,
            distance_scale: 1.0,
            axis_scale_factors: [1.0; AXES],
            last_extruder_position: [0.0; DRIVES - AXES],
            limit_axes: true,
            simulating: false,
            simulation_time_us: 0,
            saved_simulation_point: RestorePoint::default(),
            move_slot: None,
            move_buffer: [0.0; DRIVES],
            pause_status: PauseStatus::NotPaused,
            pause_restore: RestorePoint::default(),
            paused_fan_values: [0.0; FANS],
            do_pause_macro: false,
            file_to_print: None,
            fraction_of_file_printed: None,
            round_robin: 0,
            waiting_for_move_source: None,
            file_position: NO_FILE_POSITION,
            to_be_homed: 0,
            new_tool_number: -1,
            probe_phase: ProbePhase::Idle,
            probe_count: 0,
            z_probes_set: false,
            last_probed_z: 0.0,
            canned_move_queued: false,
            dwell: None,
            offset_record: [0.0; DRIVES],
            offset_set: false,
            axis_compensation: [0.0; AXES],
            heater_fault_timeout: 120.0,
            hashing: None,
            file_being_written: None,
            writing_source: None,
            queue_source: CodeSource::Queue,
            cancel_wait: false,
            stop_switch_off_heaters: true,
            debug_level: 0,
            display_message: String::new(),
            retract_length: 1.0,
            retract_extra: 0.0,
            retract_speed: 1800.0,
            retract_hop: 0.0,
            retracted: false,
        }
    }

    /// Set the executor up. USB and AUX start with checksums optional; the
    /// caller may tighten that with set_comms_properties.
    pub fn init(&mut self, ctx: &mut Context) {
        self.reset(ctx);
        self.distance_scale = 1.0;
        self.axis_scale_factors = [1.0; AXES];
        self.limit_axes = true;
        self.triggers.init(ctx.platform.endstop_states());
        self.active = true;
    }

    /// Return state to defaults. Called from init and the emergency stop.
    pub fn reset(&mut self, ctx: &mut Context) {
        for src in CodeSource::ALL {
            self.buffers[src.index()].init();
            for f in self.stacks[src.index()].reset() {
                ctx.platform.close_file(f);
            }
        }
        if let Some(f) = self.file_to_print.take() {
            ctx.platform.close_file(f);
        }
        if let Some(job) = self.hashing.take() {
            ctx.platform.close_file(job.file);
        }
        if let Some(f) = self.file_being_written.take() {
            ctx.platform.close_file(f);
        }
        self.writing_source = None;
        self.move_slot = None;
        self.locks.release_all();
        self.queue.clear();
        self.pause_status = PauseStatus::NotPaused;
        self.pause_restore = RestorePoint::default();
        self.paused_fan_values = [0.0; FANS];
        self.do_pause_macro = false;
        self.fraction_of_file_printed = None;
        self.waiting_for_move_source = None;
        self.file_position = NO_FILE_POSITION;
        self.to_be_homed = 0;
        self.probe_phase = ProbePhase::Idle;
        self.probe_count = 0;
        self.canned_move_queued = false;
        self.dwell = None;
        self.cancel_wait = false;
        self.simulating = false;
        self.simulation_time_us = 0;
        self.last_extruder_position = [0.0; DRIVES - AXES];
        self.display_message.clear();
        self.retracted = false;
        self.router.reset();
    }

    pub fn exit(&mut self) {
        log::info!("GCodes class exited");
        self.active = false;
    }

    // -----------------------------------------------------------------
    // Channel plumbing

    /// Feed raw bytes from a stream source (network, USB, aux UART).
    pub fn push_bytes(&mut self, source: CodeSource, bytes: &[u8]) {
        let q = &mut self.inbound[source.index()];
        for &b in bytes {
            q.push_back(b);
        }
        if source == CodeSource::Aux {
            self.router.set_aux_detected();
        }
    }

    pub fn set_comms_properties(&mut self, source: CodeSource, flags: u32) {
        self.buffers[source.index()].set_comms_properties(flags);
    }

    /// Attach a reply destination (network buffer, USB stream, display).
    pub fn add_reply_sink(&mut self, sink: Box<dyn crate::reply::ReplySink>) {
        self.router.add_sink(sink);
    }

    pub fn set_emulation(&mut self, source: CodeSource, c: crate::reply::Compatibility) {
        self.router.set_emulation(source, c);
    }

    /// Remaining room in a channel's inbound path, for flow control.
    pub fn gcode_buffer_space(&self, source: CodeSource) -> usize {
        GCODE_LENGTH.saturating_sub(self.inbound[source.index()].len())
    }

    pub(crate) fn gb(&mut self, src: CodeSource) -> &mut GCodeBuffer {
        &mut self.buffers[src.index()]
    }

    pub(crate) fn stack(&mut self, src: CodeSource) -> &mut MachineStateStack {
        &mut self.stacks[src.index()]
    }

    pub(crate) fn state_of(&self, src: CodeSource) -> GCodeState {
        self.stacks[src.index()].current().state
    }

    pub(crate) fn set_state(&mut self, src: CodeSource, state: GCodeState) {
        self.stacks[src.index()].current_mut().state = state;
    }

    pub fn doing_file_macro(&self, src: CodeSource) -> bool {
        self.stacks[src.index()].current().doing_file_macro
    }

    /// True when the channel has no pending command and no sequence in
    /// flight.
    pub fn channel_idle(&self, src: CodeSource) -> bool {
        self.state_of(src) == GCodeState::Normal && !self.buffers[src.index()].is_active()
    }

    // -----------------------------------------------------------------
    // Spin

    /// Called in a tight loop to make this class work. Fills the channel
    /// buffers, then advances one channel's state machine.
    pub fn spin(&mut self, ctx: &mut Context) {
        if !self.active {
            return;
        }

        self.retry_move_slot(ctx);
        self.fill_buffers(ctx);

        // Round-robin: run the first channel that has anything to do, then
        // start after it next tick so one busy source cannot starve others.
        for i in 0..NUM_SOURCES {
            let idx = (self.round_robin + i) % NUM_SOURCES;
            let src = CodeSource::ALL[idx];
            if self.channel_has_work(src) {
                self.round_robin = idx + 1;
                self.run_channel(src, ctx);
                break;
            }
        }
    }

    /// Hand the pending move to the planner when it has room.
    fn retry_move_slot(&mut self, ctx: &mut Context) {
        if let Some(mv) = self.move_slot {
            if ctx.planner.try_queue_move(&mv) {
                self.move_slot = None;
            }
        }
    }

    /// The number of moves fed towards the planner so far, counting the one
    /// still sitting in the slot. Deferred codes are tagged with this.
    pub(crate) fn total_moves(&self, ctx: &Context) -> u32 {
        ctx.planner.scheduled_moves_count() + self.move_slot.is_some() as u32
    }

    fn channel_has_work(&self, src: CodeSource) -> bool {
        if self.state_of(src) != GCodeState::Normal {
            return true;
        }
        self.buffers[src.index()].is_active()
    }

    fn fill_buffers(&mut self, ctx: &mut Context) {
        // Stream sources first.
        for src in [CodeSource::Http, CodeSource::Telnet, CodeSource::Usb, CodeSource::Aux] {
            let idx = src.index();
            if self.buffers[idx].is_active() || self.inbound[idx].is_empty() {
                continue;
            }
            let mut q = std::mem::take(&mut self.inbound[idx]);
            if let PutResult::ResendRequest(n) = self.buffers[idx].fill_from(&mut q) {
                self.request_resend(src, n);
            }
            self.inbound[idx] = q;
        }

        // File-backed channels: macros on any channel, plus the print file.
        for src in CodeSource::ALL {
            self.fill_from_file(src, ctx);
        }

        // Deferred code release.
        if !self.buffers[CodeSource::Queue.index()].is_active() {
            let completed = ctx.planner.completed_moves_count();
            if let Some(item) = self.queue.pop_ready(completed) {
                self.queue_source = item.source;
                let adjust = self.buffers[item.source.index()].tool_number_adjust();
                let qb = self.gb(CodeSource::Queue);
                qb.set_tool_number_adjust(adjust);
                if qb.put_str(&item.code) != PutResult::CompleteLine {
                    qb.put(b'\n');
                }
            }
        }
    }

    /// Read from the file the channel's top state frame points at, if any.
    /// On EOF the frame is popped (macro return) or the print is finished.
    fn fill_from_file(&mut self, src: CodeSource, ctx: &mut Context) {
        if self.buffers[src.index()].is_active() {
            return;
        }
        // A paused or pausing print must not read ahead.
        if src == CodeSource::File && self.pause_status != PauseStatus::NotPaused {
            return;
        }
        let Some(file) = self.stacks[src.index()].reading_file() else {
            return;
        };

        for _ in 0..GCODE_LENGTH {
            // Remember where the command we are about to assemble starts,
            // so a pause can rewind the print to exactly this line.
            if src == CodeSource::File
                && !self.doing_file_macro(src)
                && self.buffers[src.index()].is_empty()
            {
                self.file_position = ctx.platform.position(file);
            }
            match ctx.platform.read_byte(file) {
                Some(b) => match self.buffers[src.index()].put(b) {
                    PutResult::Accepted => {}
                    _ => return,
                },
                None => {
                    // Flush a final unterminated line first.
                    if self.buffers[src.index()].put(b'\n') == PutResult::CompleteLine {
                        return;
                    }
                    self.handle_file_eof(src, ctx);
                    return;
                }
            }
        }
    }

    fn handle_file_eof(&mut self, src: CodeSource, ctx: &mut Context) {
        if self.buffers[src.index()].is_active() {
            return;
        }
        let frame_is_macro = self.stacks[src.index()].current().doing_file_macro;
        if frame_is_macro && self.stacks[src.index()].depth() > 1 {
            self.end_file_macro(src, ctx);
        } else if src == CodeSource::File {
            // The print itself has finished.
            if let Some(f) = self.stacks[src.index()].current_mut().file.take() {
                ctx.platform.close_file(f);
            }
            self.fraction_of_file_printed = None;
            self.file_position = NO_FILE_POSITION;
            ctx.print_monitor.stopped_print();
            log::info!("print finished");
            if self.router.emulation(CodeSource::Usb) == crate::reply::Compatibility::Marlin {
                self.router
                    .dispatch(MessageType::Host, "Done printing file\n");
            }
        } else if let Some(f) = self.stacks[src.index()].current_mut().file.take() {
            ctx.platform.close_file(f);
        }
    }

    fn request_resend(&mut self, src: CodeSource, line: i32) {
        let ctx = ReplyContext {
            source: src,
            command: None,
            error: false,
            doing_file_macro: false,
        };
        self.router.handle_reply(&ctx, &format!("rs N{}\n", line));
    }

    // -----------------------------------------------------------------
    // Channel execution

    fn run_channel(&mut self, src: CodeSource, ctx: &mut Context) {
        match self.state_of(src) {
            GCodeState::Normal => {
                if self.buffers[src.index()].is_ready()
                    || self.buffers[src.index()].is_executing()
                {
                    self.buffers[src.index()].start_executing();
                    let execute_immediately = match src {
                        CodeSource::Http | CodeSource::Aux | CodeSource::Queue => true,
                        CodeSource::Usb | CodeSource::Telnet => {
                            self.pause_status == PauseStatus::Paused
                        }
                        _ => false,
                    };
                    let finished = self.act_on_code(src, execute_immediately, ctx);
                    if finished {
                        self.finish_command(src);
                    }
                }
            }
            state => {
                if let Some((reply, error)) = self.run_state_machine(src, state, ctx) {
                    self.set_state(src, GCodeState::Normal);
                    self.handle_reply(src, error, &reply);
                    self.release_locks(src);
                }
            }
        }
    }

    /// Completion bookkeeping shared by every finished command: release the
    /// buffer, then give back any resources not held when the current frame
    /// was pushed.
    pub(crate) fn finish_command(&mut self, src: CodeSource) {
        self.buffers[src.index()].set_finished(true);
        if self.state_of(src) == GCodeState::Normal {
            self.release_locks(src);
        }
    }

    pub(crate) fn release_locks(&mut self, src: CodeSource) {
        let keep = self.stacks[src.index()].current().locked_resources;
        self.locks.unlock_all(src, keep);
    }

    /// One step of a non-normal sub-state. Some(reply, error) ends the
    /// sequence and returns the channel to Normal.
    fn run_state_machine(
        &mut self,
        src: CodeSource,
        state: GCodeState,
        ctx: &mut Context,
    ) -> Option<(String, bool)> {
        match state {
            GCodeState::Normal => None,
            GCodeState::WaitingForMoveToComplete => {
                if self.all_moves_finished_and_loaded(src, ctx) {
                    self.waiting_for_move_source = None;
                    Some((String::new(), false))
                } else {
                    None
                }
            }
            GCodeState::Homing => self.home_next_axis(src, ctx),
            GCodeState::SetBed1 => Some((String::new(), false)),
            GCodeState::SetBed2 => self.probe_next_bed_point(src, ctx),
            GCodeState::ToolChange1 => {
                // tfree macro of the old tool has finished; release it.
                if let Some(old) = self.tools.current_number() {
                    self.tools.standby(old, ctx.heat);
                }
                self.set_state(src, GCodeState::ToolChange2);
                if self.tools.get(self.new_tool_number).is_some() {
                    let name = format!("tpre{}.g", self.new_tool_number);
                    let _ = self.do_file_macro(src, ctx, &name); // optional
                }
                None
            }
            GCodeState::ToolChange2 => {
                self.tools.select(self.new_tool_number, ctx.heat);
                self.set_state(src, GCodeState::ToolChange3);
                if self.tools.get(self.new_tool_number).is_some() {
                    let name = format!("tpost{}.g", self.new_tool_number);
                    let _ = self.do_file_macro(src, ctx, &name); // optional
                }
                None
            }
            GCodeState::ToolChange3 => Some((String::new(), false)),
            GCodeState::Pausing1 => self.pausing_step(src, ctx),
            GCodeState::Pausing2 => {
                self.pause_status = PauseStatus::Paused;
                log::info!("print paused");
                Some(("Printing paused\n".to_string(), false))
            }
            GCodeState::Resuming1 | GCodeState::Resuming2 | GCodeState::Resuming3 => {
                self.resuming_step(src, state, ctx)
            }
            GCodeState::Flashing1 => {
                // Give attached hosts a moment to fetch the acknowledgement
                // before the update starts.
                if self.do_dwell_time(src, 1_000_000, ctx) {
                    self.set_state(src, GCodeState::Flashing2);
                }
                None
            }
            GCodeState::Flashing2 => {
                ctx.platform.update_firmware();
                Some((String::new(), false))
            }
            GCodeState::Stopping | GCodeState::Sleeping => {
                // stop.g / sleep.g has run; shut things down.
                if state == GCodeState::Stopping {
                    ctx.platform.set_drives_idle();
                } else {
                    self.disable_drives(ctx);
                }
                if self.stop_switch_off_heaters {
                    if let Some(tool) = self.tools.current_number() {
                        self.tools.standby(tool, ctx.heat);
                    }
                    ctx.heat.switch_off_all();
                }
                let was_paused = self.pause_status == PauseStatus::Paused;
                self.cancel_print(ctx);
                if was_paused {
                    Some(("Print cancelled\n".to_string(), false))
                } else {
                    Some((String::new(), false))
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Waiting and locking

    /// The wait-till-everything's-done function. Call until it returns
    /// true; as a side effect the current user position lands in
    /// move_buffer. Implies holding the movement lock.
    pub(crate) fn all_moves_finished_and_loaded(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
    ) -> bool {
        if !self.locks.try_lock(src, MOVE_RESOURCE) {
            return false;
        }
        if self.move_slot.is_some() {
            return false;
        }
        if !ctx.planner.all_moves_finished() {
            return false;
        }
        ctx.planner.resume_moving();
        ctx.planner.current_user_position(&mut self.move_buffer, 0);
        true
    }

    /// Wait for the dwell deadline, integer microseconds on the monotonic
    /// clock. Returns true when the time has passed.
    pub(crate) fn do_dwell_time(
        &mut self,
        src: CodeSource,
        duration_us: u64,
        ctx: &mut Context,
    ) -> bool {
        match self.dwell {
            Some((owner, deadline)) if owner == src => {
                if ctx.platform.monotonic_us() >= deadline {
                    self.dwell = None;
                    ctx.planner.resume_moving();
                    true
                } else {
                    false
                }
            }
            Some(_) => false, // another channel owns the dwell
            None => {
                self.dwell = Some((src, ctx.platform.monotonic_us() + duration_us));
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Macro control

    /// Run a macro file on this channel: push a state frame, open the file
    /// and attach it to the new frame. The channel's parser then streams
    /// the file until EOF pops the frame. Whether a missing file is an
    /// error is the caller's decision; optional macros (bed.g, tpre*.g)
    /// skip silently.
    pub(crate) fn do_file_macro(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        file_name: &str,
    ) -> MacroStart {
        let located = self.locate_macro(ctx, file_name);
        let Some((dir, name)) = located else {
            return MacroStart::Missing;
        };

        if !self.stacks[src.index()].push() {
            return MacroStart::StackFull;
        }
        // Record the locks held at push time so the macro releases only
        // what it acquires itself, and the raw extruder positions so the
        // caller's absolute-E bookkeeping survives.
        let held = self.locks.held_by(src);
        let extruders = self.last_extruder_position;
        let frame = self.stacks[src.index()].current_mut();
        frame.locked_resources = held;
        frame.doing_file_macro = true;
        frame.extruder_positions = extruders;

        match ctx.platform.open_file(&dir, &name, false) {
            Some(f) => {
                self.stacks[src.index()].current_mut().file = Some(f);
                self.buffers[src.index()].init();
                log::debug!("macro {} started on {}", file_name, src.name());
                MacroStart::Started
            }
            None => {
                self.stacks[src.index()].pop();
                MacroStart::Missing
            }
        }
    }

    /// Resolve a macro name against /sys then /macros; absolute paths are
    /// used as given.
    fn locate_macro(&self, ctx: &Context, file_name: &str) -> Option<(String, String)> {
        if file_name.contains(":/") || file_name.starts_with('/') {
            let name = file_name.trim_start_matches('/');
            if ctx.platform.file_exists("", name) {
                return Some((String::new(), name.to_string()));
            }
            return None;
        }
        if ctx.platform.file_exists(crate::SYS_DIR, file_name) {
            return Some((crate::SYS_DIR.to_string(), file_name.to_string()));
        }
        if ctx.platform.file_exists(crate::MACRO_DIR, file_name) {
            return Some((crate::MACRO_DIR.to_string(), file_name.to_string()));
        }
        None
    }

    /// Macro EOF: close the file, pop the frame, give back the locks the
    /// macro acquired and restore the caller's extruder bookkeeping.
    pub(crate) fn end_file_macro(&mut self, src: CodeSource, ctx: &mut Context) {
        if let Some(frame) = self.stacks[src.index()].pop() {
            if let Some(f) = frame.file {
                ctx.platform.close_file(f);
            }
            self.last_extruder_position = frame.extruder_positions;
            let keep = self.stacks[src.index()].current().locked_resources;
            self.locks.unlock_all(src, keep);
            log::debug!("macro finished on {}", src.name());
        }
    }

    /// Unwind every macro frame on this channel (M99 and error recovery).
    pub(crate) fn file_macro_cycles_return(&mut self, src: CodeSource, ctx: &mut Context) {
        while self.stacks[src.index()].current().doing_file_macro
            && self.stacks[src.index()].depth() > 1
        {
            self.end_file_macro(src, ctx);
        }
    }

    // -----------------------------------------------------------------
    // Replies

    /// Route a finished command's reply to the issuing channel. Queued
    /// codes report as their original source.
    pub(crate) fn handle_reply(&mut self, src: CodeSource, error: bool, reply: &str) {
        let effective = if src == CodeSource::Queue { self.queue_source } else { src };
        let command = self.buffers[src.index()].command();
        let rctx = ReplyContext {
            source: effective,
            command,
            error,
            doing_file_macro: self.doing_file_macro(src),
        };
        self.router.handle_reply(&rctx, reply);
    }

    // -----------------------------------------------------------------
    // Triggers

    /// Sample the endstop inputs and dispatch at most one pending trigger.
    /// Slot 0 stops the machine, slot 1 pauses a running print, higher
    /// slots run trigger<N>.g on the daemon channel.
    pub fn check_triggers(&mut self, ctx: &mut Context) {
        let states = ctx.platform.endstop_states();
        let printing = ctx.print_monitor.is_printing();
        self.triggers.poll(states, printing);

        let Some(slot) = self.triggers.lowest_pending() else {
            return;
        };
        match slot {
            0 => {
                self.triggers.take_lowest_pending();
                self.emergency_stop(ctx);
                self.router.dispatch(
                    MessageType::Generic,
                    "Emergency Stop! Reset the controller to continue.\n",
                );
            }
            1 => {
                if !printing || self.pause_status != PauseStatus::NotPaused {
                    // Nothing to pause.
                    self.triggers.take_lowest_pending();
                    return;
                }
                // Inject the pause through the daemon channel so it follows
                // the normal pause path.
                let daemon = CodeSource::Daemon.index();
                if !self.buffers[daemon].is_active()
                    && self.state_of(CodeSource::Daemon) == GCodeState::Normal
                {
                    self.triggers.take_lowest_pending();
                    self.buffers[daemon].put_str("M25\n");
                }
            }
            n => {
                // While a macro is active, higher-numbered triggers wait.
                let daemon = CodeSource::Daemon.index();
                if !self.buffers[daemon].is_active()
                    && self.state_of(CodeSource::Daemon) == GCodeState::Normal
                    && !self.doing_file_macro(CodeSource::Daemon)
                {
                    self.triggers.take_lowest_pending();
                    let name = format!("trigger{}.g", n);
                    if self.do_file_macro(CodeSource::Daemon, ctx, &name) != MacroStart::Started {
                        log::warn!("trigger macro {} could not be started", name);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Whole-machine actions

    pub(crate) fn disable_drives(&mut self, ctx: &mut Context) {
        for drive in 0..DRIVES {
            ctx.platform.disable_drive(drive);
        }
        self.axes_homed = 0;
    }

    /// Cancel the current print. There must be no live movement.
    pub(crate) fn cancel_print(&mut self, ctx: &mut Context) {
        self.queue.clear();
        self.move_slot = None;
        self.pause_status = PauseStatus::NotPaused;
        self.fraction_of_file_printed = None;
        self.cancel_wait = true;
        let file_idx = CodeSource::File.index();
        self.file_macro_cycles_return(CodeSource::File, ctx);
        if let Some(f) = self.stacks[file_idx].current_mut().file.take() {
            ctx.platform.close_file(f);
        }
        if let Some(f) = self.file_to_print.take() {
            ctx.platform.close_file(f);
        }
        self.buffers[file_idx].init();
        self.file_position = NO_FILE_POSITION;
        if ctx.print_monitor.is_printing() {
            ctx.print_monitor.stopped_print();
        }
    }

    /// M112 / trigger 0: stop everything now and refuse further commands
    /// until M999.
    pub fn emergency_stop(&mut self, ctx: &mut Context) {
        ctx.planner.emergency_stop();
        ctx.heat.emergency_switch_off_all();
        self.disable_drives(ctx);
        self.reset(ctx);
        self.emergency_stopped = true;
        log::error!("emergency stop");
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped
    }

    pub(crate) fn clear_emergency_stop(&mut self) {
        self.emergency_stopped = false;
    }

    // -----------------------------------------------------------------
    // Read-only accessors for status reporting

    pub fn is_pausing(&self) -> bool {
        self.pause_status == PauseStatus::Pausing
    }

    pub fn is_paused(&self) -> bool {
        self.pause_status == PauseStatus::Paused
    }

    pub fn is_resuming(&self) -> bool {
        self.pause_status == PauseStatus::Resuming
    }

    pub fn is_running(&self) -> bool {
        self.pause_status == PauseStatus::NotPaused
    }

    pub fn axis_is_homed(&self, axis: usize) -> bool {
        (self.axes_homed & (1 << axis)) != 0
    }

    pub fn all_axes_are_homed(&self) -> bool {
        (0..AXES).all(|a| self.axis_is_homed(a))
    }

    pub(crate) fn set_axis_homed(&mut self, axis: usize) {
        self.axes_homed |= 1 << axis;
    }

    pub(crate) fn set_all_axes_not_homed(&mut self) {
        self.axes_homed = 0;
    }

    pub fn raw_extruder_position(&self, extruder: usize) -> f32 {
        self.last_extruder_position.get(extruder).copied().unwrap_or(0.0)
    }

    pub fn current_tool(&self) -> Option<i32> {
        self.tools.current_number()
    }

    pub fn stack_depth(&self, src: CodeSource) -> usize {
        self.stacks[src.index()].depth()
    }

    /// Progress through the file being printed, if one is.
    pub fn fraction_of_file_printed(&self, ctx: &Context) -> f32 {
        if let Some(f) = self.fraction_of_file_printed {
            return f;
        }
        let file = self.stacks[CodeSource::File.index()].current().file;
        match file.or(self.file_to_print) {
            Some(f) => {
                let len = ctx.platform.length(f);
                if len == 0 {
                    -1.0
                } else {
                    ctx.platform.position(f) as f32 / len as f32
                }
            }
            None => -1.0,
        }
    }

    pub fn simulating(&self) -> bool {
        self.simulating
    }

    pub fn display_message(&self) -> &str {
        &self.display_message
    }

    /// Send helpful information out.
    pub fn diagnostics(&self) -> String {
        let mut s = String::from("GCodes Diagnostics:\n");
        s.push_str(&format!(
            "Move available? {}\n",
            if self.move_slot.is_some() { "yes" } else { "no" }
        ));
        s.push_str(&format!(
            "Internal code queue is {}\n",
            if self.queue.is_empty() { "empty" } else { "not empty" }
        ));
        for item in self.queue.iter() {
            s.push_str(&format!("Queued '{}' for move {}\n", item.code, item.execute_at_move));
        }
        for src in CodeSource::ALL {
            let depth = self.stacks[src.index()].depth();
            if depth > 1 {
                s.push_str(&format!("Stack pointer ({}): {} of {}\n", src.name(), depth, crate::STACK));
            }
        }
        s
    }

}

impl Default for GCodes {
    fn default() -> Self {
        Self::new()
    }
}
