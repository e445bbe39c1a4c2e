// reprap_host_rust/src/gcodes/dispatch.rs

// Act-On-Code: decode the buffered command and do what it says. A handler
// returns true when the command is complete (reply already routed) and
// false to be called again next tick. M-codes are checked before G- and
// T-codes because M-code string parameters may contain those letters.

use serde_json::json;

use super::move_builder::MoveOutcome;
use super::{GCodes, MacroStart, PauseStatus, ProbePhase};
use crate::core_traits::{Context, MachineGeometry};
use crate::gcode_buffer::CodeSource;
use crate::machine_state::GCodeState;
use crate::reply::Compatibility;
use crate::resources::{fan_resource, heater_resource};
use crate::tools::Tool;
use crate::triggers::TriggerCondition;
use crate::{
    AXES, AXIS_LETTERS, DRIVES, EXTRUDE_LETTER, FANS, GCODE_DIR, HEATERS, INCH_TO_MM, SLEEP_G,
    STOP_G, SYS_DIR, TRIGGERS,
};

/// G-codes still honoured while simulating.
const SIMULATED_GCODES: [i32; 9] = [0, 1, 4, 10, 20, 21, 90, 91, 92];

impl GCodes {
    /// Run or queue the code sitting in the channel's buffer. Returns true
    /// when the code has been fully dealt with.
    pub(crate) fn act_on_code(
        &mut self,
        src: CodeSource,
        execute_immediately: bool,
        ctx: &mut Context,
    ) -> bool {
        // Discard empty buffers right away.
        if self.gb(src).is_empty() {
            return true;
        }

        // A channel in upload mode copies lines to the file instead.
        if self.writing_source == Some(src) {
            self.write_gcode_to_file(src, ctx);
            return true;
        }

        if self.emergency_stopped {
            match self.gb(src).command() {
                Some(('M', 999)) | Some(('M', 112)) => {}
                _ => {
                    self.handle_reply(
                        src,
                        true,
                        "Emergency Stop! Reset the controller to continue.\n",
                    );
                    return true;
                }
            }
        }

        // Time-sensitive but position-insensitive codes wait for the moves
        // already scheduled instead of running hundreds of moves early.
        let moves_outstanding =
            self.total_moves(ctx) != ctx.planner.completed_moves_count();
        if !execute_immediately && moves_outstanding && self.can_queue_code(src) {
            return self.defer_code(src, ctx);
        }

        if self.gb(src).seen('M') {
            return self.handle_mcode(src, ctx);
        }
        if self.gb(src).seen('G') {
            return self.handle_gcode(src, ctx);
        }
        if self.gb(src).seen('T') {
            return self.handle_tcode(src, ctx);
        }

        // An invalid buffer gets discarded.
        self.handle_reply(src, false, "");
        true
    }

    /// Codes that must execute in step with the motion stream but do not
    /// depend on the current position.
    fn can_queue_code(&mut self, src: CodeSource) -> bool {
        if self.gb(src).seen('G') {
            let code = self.gb(src).get_i_value();
            // Tool temperature updates.
            return code == 10 && (self.gb(src).seen('R') || self.gb(src).seen('S'));
        }
        if self.gb(src).seen('M') {
            let code = self.gb(src).get_i_value();
            return matches!(
                code,
                // Fan control
                106 | 107
                // Temperatures set without waiting
                | 104 | 140 | 141 | 144
                // Display message, beep, servo
                | 117 | 300 | 280
                // Network, identity, compensation, probe, tools
                | 540 | 550..=563
                // Motion parameters and auxiliary PWM
                | 566..=573
                // Motor currents
                | 906
            );
        }
        false
    }

    /// Append the current code to the deferred queue, tagged with the
    /// total number of moves fed towards the planner so far.
    fn defer_code(&mut self, src: CodeSource, ctx: &mut Context) -> bool {
        if self.queue.is_full() {
            // Make room by running the oldest entry now; if the queue
            // channel is still busy there is nothing we can do this tick.
            if self.buffers[CodeSource::Queue.index()].is_active() {
                return false;
            }
            if let Some(item) = self.queue.pop_front() {
                self.queue_source = item.source;
                let qb = self.gb(CodeSource::Queue);
                if qb.put_str(&item.code) != crate::gcode_buffer::PutResult::CompleteLine {
                    qb.put(b'\n');
                }
            }
        }
        let tag = self.total_moves(ctx);
        let code = self.gb(src).buffer().to_string();
        self.queue.push(&code, src, tag)
    }

    // =================================================================
    // G-codes

    fn handle_gcode(&mut self, src: CodeSource, ctx: &mut Context) -> bool {
        let mut result = true;
        let mut error = false;
        let mut reply = String::new();

        self.gb(src).seen('G');
        let code = self.gb(src).get_i_value();

        if self.simulating && !SIMULATED_GCODES.contains(&code) {
            self.handle_reply(src, false, "");
            return true;
        }

        match code {
            // There are no rapid moves, G0 is an ordinary move too.
            0 | 1 => {
                if let Some(waiting) = self.waiting_for_move_source {
                    if waiting != src {
                        // An endstop-checking move is in progress; no other
                        // motion until it finishes.
                        return false;
                    }
                }
                if src == CodeSource::File && self.pause_status != PauseStatus::NotPaused {
                    // The print is paused; this move will be replayed from
                    // the file on resume.
                    self.handle_reply(src, false, "");
                    return true;
                }
                match self.set_up_move(src, ctx) {
                    MoveOutcome::NotReady => return false,
                    MoveOutcome::Queued => {}
                    MoveOutcome::QueuedWaitForFinish => {
                        self.waiting_for_move_source = Some(src);
                        self.set_state(src, GCodeState::WaitingForMoveToComplete);
                        return true;
                    }
                    MoveOutcome::Rejected(msg) => {
                        error = true;
                        reply = msg;
                    }
                }
            }

            4 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                let duration_us = if self.gb(src).seen('S') {
                    Some((self.gb(src).get_f_value() as f64 * 1e6) as u64)
                } else if self.gb(src).seen('P') {
                    Some(self.gb(src).get_l_value().max(0) as u64 * 1000)
                } else {
                    None
                };
                if let Some(us) = duration_us {
                    if self.simulating {
                        self.simulation_time_us += us;
                    } else if !self.do_dwell_time(src, us, ctx) {
                        return false;
                    }
                }
            }

            10 => {
                if self.gb(src).seen('P') {
                    self.set_or_report_offsets(src, &mut reply, &mut error);
                } else if !self.retract(src, ctx, true) {
                    return false;
                }
            }

            11 => {
                if !self.retract(src, ctx, false) {
                    return false;
                }
            }

            // Inches: which century are we living in, here?
            20 => self.distance_scale = INCH_TO_MM,
            21 => self.distance_scale = 1.0,

            28 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                self.start_homing(src, ctx);
                return true;
            }

            30 => {
                if !self.canned_move_queued
                    && self.probe_phase == ProbePhase::Idle
                    && !self.all_moves_finished_and_loaded(src, ctx)
                {
                    return false;
                }
                if ctx.planner.geometry() == MachineGeometry::Delta
                    && !self.all_axes_are_homed()
                {
                    reply.push_str("Must home a delta printer before bed probing\n");
                    error = true;
                } else {
                    result = self.set_single_z_probe_at_a_position(src, ctx, &mut reply, &mut error);
                }
            }

            31 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                reply.push_str(&format!(
                    "Z probe {}: reading {}, dive height {:.1}, stop height {:.2}, points set: {}\n",
                    ctx.platform.z_probe_type(),
                    ctx.platform.z_probe_value(),
                    ctx.platform.z_probe_dive_height(),
                    ctx.platform.z_probe_stop_height(),
                    if self.z_probes_set { "yes" } else { "no" }
                ));
            }

            32 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                if !self.start_bed_probing(src, ctx, &mut reply, &mut error) {
                    return true;
                }
            }

            // We no longer change the extruder settings in response to
            // G90/G91; M82/M83 own drives_relative.
            90 => self.stack(src).current_mut().axes_relative = false,
            91 => self.stack(src).current_mut().axes_relative = true,

            92 => result = self.set_positions_from_gcode(src, ctx),

            _ => {
                error = true;
                reply = format!("invalid G Code: {}\n", self.gb(src).buffer());
            }
        }

        if result {
            self.handle_reply(src, error, &reply);
        }
        result
    }

    /// Set offset, working and standby temperatures for a tool (G10 P).
    fn set_or_report_offsets(&mut self, src: CodeSource, reply: &mut String, error: &mut bool) {
        self.gb(src).seen('P');
        let tool_number = self.gb(src).get_i_value() + self.gb(src).tool_number_adjust();
        let (mut offset, heater_count) = match self.tools.get(tool_number) {
            Some(tool) => (*tool.offset(), tool.heater_count()),
            None => {
                reply.push_str(&format!(
                    "Attempt to set/report offsets and temperatures for non-existent tool: {}\n",
                    tool_number
                ));
                *error = true;
                return;
            }
        };

        let mut setting_offset = false;
        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                offset[axis] = self.gb(src).get_f_value();
                setting_offset = true;
            }
        }

        let mut standby = [0.0f32; HEATERS];
        let mut active = [0.0f32; HEATERS];
        if let Some(tool) = self.tools.get(tool_number) {
            for h in 0..heater_count {
                standby[h] = tool.standby_temperature(h);
                active[h] = tool.active_temperature(h);
            }
        }
        let mut setting_temps = false;
        if self.gb(src).seen('R') {
            self.gb(src).get_float_array(&mut standby[..heater_count], true);
            setting_temps = true;
        }
        if self.gb(src).seen('S') {
            self.gb(src).get_float_array(&mut active[..heater_count], true);
            setting_temps = true;
        }

        let simulating = self.simulating;
        if let Some(tool) = self.tools.get_mut(tool_number) {
            if setting_offset {
                tool.set_offset(offset);
            }
            if setting_temps && !simulating {
                tool.set_temperatures(&standby[..heater_count], &active[..heater_count]);
            }
        }

        if !setting_offset && !setting_temps {
            reply.push_str(&format!(
                "Tool {} offsets: X{:.1} Y{:.1} Z{:.1}",
                tool_number, offset[0], offset[1], offset[2]
            ));
            if heater_count != 0 {
                reply.push_str(", active/standby temperature(s):");
                for h in 0..heater_count {
                    reply.push_str(&format!(" {:.1}/{:.1}", active[h], standby[h]));
                }
            }
            reply.push('\n');
        }
    }

    // =================================================================
    // M-codes

    fn handle_mcode(&mut self, src: CodeSource, ctx: &mut Context) -> bool {
        let mut result = true;
        let mut error = false;
        let mut reply = String::new();

        self.gb(src).seen('M');
        let code = self.gb(src).get_i_value();

        if self.simulating
            && !(20..=37).contains(&code)
            && !matches!(code, 82 | 83 | 105 | 111 | 122 | 999)
        {
            self.handle_reply(src, false, "");
            return true;
        }

        match code {
            0 | 1 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                // With Marlin emulated, M1 during a print means pause.
                if code == 1
                    && matches!(src, CodeSource::Usb | CodeSource::Telnet)
                    && self.router.emulation(src) == Compatibility::Marlin
                    && ctx.print_monitor.is_printing()
                    && self.pause_status == PauseStatus::NotPaused
                {
                    let gb = self.gb(src);
                    gb.init();
                    gb.put_str("M25\n");
                    return false;
                }
                self.stop_switch_off_heaters =
                    !self.gb(src).seen('H') || self.gb(src).get_i_value() == 0;
                let state = if code == 0 { GCodeState::Stopping } else { GCodeState::Sleeping };
                self.set_state(src, state);
                let macro_name = if code == 0 {
                    if self.pause_status == PauseStatus::Paused
                        && ctx.platform.file_exists(SYS_DIR, crate::CANCEL_G)
                    {
                        crate::CANCEL_G
                    } else {
                        STOP_G
                    }
                } else {
                    SLEEP_G
                };
                let _ = self.do_file_macro(src, ctx, macro_name); // optional
                return true;
            }

            17 => {
                for drive in 0..DRIVES {
                    ctx.platform.enable_drive(drive);
                }
            }

            18 | 84 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        self.axes_homed &= !(1 << axis);
                        ctx.platform.disable_drive(axis);
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    let mut e_drives = [0i64; DRIVES - AXES];
                    let n = self.gb(src).get_long_array(&mut e_drives);
                    for &e in &e_drives[..n] {
                        seen = true;
                        if e < 0 || e as usize >= DRIVES - AXES {
                            reply = format!("Invalid extruder number specified: {}\n", e);
                            error = true;
                            break;
                        }
                        ctx.platform.disable_drive(AXES + e as usize);
                    }
                }
                if self.gb(src).seen('S') {
                    seen = true;
                    let idle_timeout = self.gb(src).get_f_value();
                    if idle_timeout < 0.0 {
                        reply.push_str("Idle timeouts cannot be negative!\n");
                        error = true;
                    } else {
                        ctx.planner.set_idle_timeout(idle_timeout);
                    }
                }
                if !seen {
                    self.disable_drives(ctx);
                }
            }

            20 => {
                let dir = if self.gb(src).seen('P') {
                    self.gb(src).get_string()
                } else {
                    GCODE_DIR.to_string()
                };
                let s_param = if self.gb(src).seen('S') {
                    self.gb(src).get_i_value()
                } else {
                    0
                };
                let files = ctx.platform.file_list(&dir);
                let Some(chain) = self.pool.allocate() else {
                    // No output buffer space; try again later.
                    return false;
                };
                if s_param == 2 {
                    let listing = json!({ "dir": dir, "files": files });
                    self.pool.cat(chain, &listing.to_string());
                    self.pool.cat(chain, "\n");
                } else {
                    let marlin_usb = matches!(src, CodeSource::Usb | CodeSource::Telnet)
                        && self.router.emulation(src) == Compatibility::Marlin;
                    if !marlin_usb {
                        self.pool.cat(chain, "GCode files:\n");
                    }
                    if files.is_empty() {
                        self.pool.cat(chain, "NONE\n");
                    } else {
                        for name in &files {
                            let line = if marlin_usb {
                                format!("{}\n", name)
                            } else {
                                format!("\"{}\",", name)
                            };
                            self.pool.cat(chain, &line);
                        }
                        if !marlin_usb {
                            self.pool.cat(chain, "\n");
                        }
                    }
                }
                let text = self.pool.collect(chain);
                self.pool.release_all(chain);
                self.handle_reply(src, false, &text);
                return true;
            }

            // Initialise SD - nothing to do.
            21 => {}

            22 => {
                reply.push_str("You cannot eject the SD card on a powered-up machine.\n");
            }

            23 | 32 => {
                if self.doing_file_macro(src) {
                    reply.push_str("Cannot use M32/M23 in file macros!\n");
                    error = true;
                } else if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                } else {
                    let filename = self
                        .gb(src)
                        .get_unprecedented_string(false)
                        .unwrap_or_default();
                    if self.queue_file_to_print(ctx, &filename) {
                        if matches!(src, CodeSource::Usb | CodeSource::Telnet)
                            && self.router.emulation(src) == Compatibility::Marlin
                        {
                            reply.push_str("File opened\nFile selected\n");
                        }
                        if code == 32 && !self.start_selected_print(ctx) {
                            reply.push_str("Could not start print!\n");
                            error = true;
                        }
                    } else {
                        reply.push_str("Could not open file for printing!\n");
                        error = true;
                    }
                }
            }

            24 => {
                if self.pause_status == PauseStatus::Pausing {
                    return false;
                }
                if self.pause_status == PauseStatus::Paused
                    || self.pause_status == PauseStatus::Resuming
                {
                    if src == CodeSource::File {
                        reply.push_str("M24 is not allowed in G-code files\n");
                        error = true;
                    } else {
                        self.start_resume(src, ctx);
                        return true;
                    }
                } else if self.file_to_print.is_none() {
                    reply.push_str("Cannot resume print, because no print is in progress!\n");
                    error = true;
                } else if !self.start_selected_print(ctx) {
                    reply.push_str("Could not start print!\n");
                    error = true;
                }
            }

            25 | 226 => {
                if self.pause_status == PauseStatus::NotPaused {
                    match self.do_pause(src, ctx, code == 226) {
                        Ok(()) => return true, // continues in Pausing1
                        Err(e) => {
                            reply = e.to_string();
                            error = true;
                        }
                    }
                }
                // Already pausing or paused: nothing more to do.
            }

            26 => {
                if self.gb(src).seen('S') {
                    let value = self.gb(src).get_l_value();
                    if value < 0 {
                        reply.push_str("SD positions can't be negative!\n");
                        error = true;
                    } else {
                        let file = self.stacks[CodeSource::File.index()]
                            .current()
                            .file
                            .or(self.file_to_print);
                        match file {
                            Some(f) => {
                                if !ctx.platform.seek(f, value as u64) {
                                    reply.push_str("The specified SD position is invalid!\n");
                                    error = true;
                                }
                            }
                            None => {
                                reply.push_str(
                                    "Cannot set SD file position, because no print is in progress!\n",
                                );
                                error = true;
                            }
                        }
                    }
                } else {
                    reply.push_str("You must specify the SD position in bytes using the S parameter.\n");
                    error = true;
                }
            }

            27 => {
                let file = self.stacks[CodeSource::File.index()].current().file;
                match file {
                    Some(f) if ctx.print_monitor.is_printing() => {
                        reply.push_str(&format!(
                            "SD printing byte {}/{}\n",
                            ctx.platform.position(f),
                            ctx.platform.length(f)
                        ));
                    }
                    _ => reply.push_str("Not SD printing.\n"),
                }
            }

            28 => {
                let str = self
                    .gb(src)
                    .get_unprecedented_string(false)
                    .unwrap_or_default();
                if self.open_file_to_write(src, ctx, GCODE_DIR, &str) {
                    reply.push_str(&format!("Writing to file: {}\n", str));
                } else {
                    reply.push_str(&format!("Can't open file {} for writing.\n", str));
                    error = true;
                }
            }

            29 => {
                // End of file being written; normally intercepted before
                // getting here.
                reply.push_str("GCode end-of-file being interpreted.\n");
            }

            30 => {
                let name = self
                    .gb(src)
                    .get_unprecedented_string(false)
                    .unwrap_or_default();
                if !ctx.platform.delete_file(GCODE_DIR, &name) {
                    reply.push_str(&format!("Could not delete file {}\n", name));
                    error = true;
                }
            }

            36 => {
                let name = self.gb(src).get_unprecedented_string(true);
                reply = format!("{}\n", ctx.print_monitor.file_info_response(name.as_deref()));
            }

            37 => {
                if self.gb(src).seen('S') {
                    if !self.all_moves_finished_and_loaded(src, ctx) {
                        return false;
                    }
                    let was_simulating = self.simulating;
                    self.simulating = self.gb(src).get_i_value() != 0;
                    ctx.planner.simulate(self.simulating);
                    if self.simulating {
                        self.simulation_time_us = 0;
                        if !was_simulating {
                            // Save the position so it survives the dry run.
                            ctx.planner.current_user_position(&mut self.move_buffer, 0);
                            self.saved_simulation_point.coords = self.move_buffer;
                            self.saved_simulation_point.feed_rate =
                                self.stacks[src.index()].current().feed_rate;
                        }
                    } else if was_simulating {
                        ctx.planner.set_positions(&self.saved_simulation_point.coords);
                        ctx.planner.set_feed_rate(self.saved_simulation_point.feed_rate);
                    }
                } else {
                    reply.push_str(&format!(
                        "Simulation mode: {}, move time: {:.1} sec, other time: {:.1} sec\n",
                        if self.simulating { "on" } else { "off" },
                        ctx.planner.simulation_time(),
                        self.simulation_time_us as f32 / 1e6
                    ));
                }
            }

            38 => {
                if self.hashing.is_some() {
                    if self.advance_hash(ctx) {
                        self.report_hash(ctx);
                        return true;
                    }
                    return false;
                }
                let filename = self.gb(src).get_unprecedented_string(true);
                match filename {
                    Some(name) => {
                        if self.start_hash(src, ctx, &name) {
                            return false;
                        }
                        reply.push_str("Cannot find file\n");
                        error = true;
                    }
                    None => {
                        reply.push_str("Cannot find file\n");
                        error = true;
                    }
                }
            }

            42 => {
                if self.gb(src).seen('P') {
                    let pin = self.gb(src).get_i_value();
                    if self.gb(src).seen('S') {
                        let val = self.gb(src).get_i_value();
                        if !ctx.platform.set_output_pin(pin as u32, val != 0) {
                            reply.push_str(&format!("Setting pin {} is not supported\n", pin));
                            error = true;
                        }
                    }
                }
            }

            80 | 81 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                if code == 81 {
                    self.disable_drives(ctx);
                }
                ctx.platform.set_atx_power(code == 80);
            }

            82 => {
                // Don't reset the raw positions if they were already
                // absolute.
                if self.stack(src).current().drives_relative {
                    self.last_extruder_position = [0.0; DRIVES - AXES];
                    self.stack(src).current_mut().drives_relative = false;
                }
            }

            83 => {
                if !self.stack(src).current().drives_relative {
                    self.last_extruder_position = [0.0; DRIVES - AXES];
                    self.stack(src).current_mut().drives_relative = true;
                }
            }

            92 => {
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        ctx.platform
                            .set_drive_steps_per_unit(axis, self.gb(src).get_f_value());
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    seen = true;
                    let mut e_vals = [0.0f32; DRIVES - AXES];
                    self.gb(src).get_float_array(&mut e_vals, true);
                    for (e, v) in e_vals.iter().enumerate() {
                        ctx.platform.set_drive_steps_per_unit(AXES + e, *v);
                    }
                }
                if !seen {
                    reply.push_str(&format!(
                        "Steps/mm: X: {:.3}, Y: {:.3}, Z: {:.3}, E: ",
                        ctx.platform.drive_steps_per_unit(0),
                        ctx.platform.drive_steps_per_unit(1),
                        ctx.platform.drive_steps_per_unit(2)
                    ));
                    for drive in AXES..DRIVES {
                        reply.push_str(&format!("{:.3}", ctx.platform.drive_steps_per_unit(drive)));
                        if drive < DRIVES - 1 {
                            reply.push(':');
                        }
                    }
                    reply.push('\n');
                }
            }

            98 => {
                if self.gb(src).seen('P') {
                    let name = self.gb(src).get_string();
                    match self.do_file_macro(src, ctx, &name) {
                        MacroStart::Started => return true,
                        MacroStart::Missing => {
                            reply = format!("Macro file {} not found\n", name);
                            error = true;
                        }
                        MacroStart::StackFull => {
                            reply.push_str("Push(): stack overflow\n");
                            error = true;
                        }
                    }
                }
            }

            99 => {
                self.file_macro_cycles_return(src, ctx);
            }

            104 => {
                if self.gb(src).seen('S') {
                    let temperature = self.gb(src).get_f_value();
                    let tool_number = if self.gb(src).seen('T') {
                        Some(self.gb(src).get_i_value() + self.gb(src).tool_number_adjust())
                    } else {
                        None
                    };
                    if !self.set_tool_heaters(ctx, tool_number, temperature) {
                        reply.push_str("Setting temperature: no tool selected.\n");
                        error = true;
                    }
                }
            }

            105 => {
                let param = if self.gb(src).seen('S') {
                    self.gb(src).get_i_value()
                } else {
                    0
                };
                match param {
                    2 | 3 | 4 => {
                        reply = format!("{}\n", self.status_response(ctx));
                    }
                    _ => reply = self.temperature_report(ctx),
                }
            }

            106 => {
                let mut fan_number = 0usize;
                let mut seen = false;
                if self.gb(src).seen('P') {
                    let p = self.gb(src).get_i_value();
                    if p < 0 || p as usize >= FANS {
                        reply = format!("Fan index {} is invalid, 0..{} are valid\n", p, FANS - 1);
                        error = true;
                    } else {
                        fan_number = p as usize;
                    }
                }
                if !error {
                    if !self.locks.try_lock(src, fan_resource(fan_number)) {
                        return false;
                    }
                    if self.gb(src).seen('S') {
                        let f = self.gb(src).get_f_value().clamp(0.0, 255.0);
                        // Both 0..1 and 0..255 scales are accepted.
                        let value = if f > 1.0 { f / 255.0 } else { f };
                        ctx.platform.set_fan_value(fan_number, value);
                        seen = true;
                    } else if self.gb(src).seen('R') {
                        ctx.platform
                            .set_fan_value(fan_number, self.paused_fan_values[fan_number]);
                        seen = true;
                    }
                    if !seen {
                        reply.push_str(&format!(
                            "Fan{} value: {}%\n",
                            fan_number,
                            (ctx.platform.fan_value(fan_number) * 100.0) as i32
                        ));
                    }
                }
            }

            107 => {
                if !self.locks.try_lock(src, fan_resource(0)) {
                    return false;
                }
                ctx.platform.set_fan_value(0, 0.0);
            }

            109 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                if self.gb(src).seen('S') {
                    let temperature = self.gb(src).get_f_value();
                    let tool_number = if self.gb(src).seen('T') {
                        Some(self.gb(src).get_i_value() + self.gb(src).tool_number_adjust())
                    } else {
                        None
                    };
                    if !self.set_tool_heaters(ctx, tool_number, temperature) {
                        reply.push_str("Setting temperature: no tool selected.\n");
                        error = true;
                    } else if !self.cancel_wait {
                        if !self.tool_heaters_at_temperature(ctx, tool_number) {
                            return false;
                        }
                    } else {
                        self.cancel_wait = false;
                    }
                }
            }

            110 => {
                if self.gb(src).seen('N') {
                    let n = self.gb(src).get_i_value();
                    self.gb(src).set_line_number(n + 1);
                }
            }

            111 => {
                if self.gb(src).seen('S') {
                    self.debug_level = self.gb(src).get_i_value().max(0) as u32;
                } else {
                    reply.push_str(&format!("Debug level: {}\n", self.debug_level));
                }
            }

            112 => {
                self.emergency_stop(ctx);
                reply.push_str("Emergency Stop! Reset the controller to continue.\n");
            }

            114 => {
                reply = self.current_coordinates(ctx);
            }

            115 => {
                reply.push_str(&format!(
                    "FIRMWARE_NAME: {} FIRMWARE_VERSION: {} ELECTRONICS: {}\n",
                    ctx.platform.firmware_name(),
                    ctx.platform.firmware_version(),
                    ctx.platform.electronics()
                ));
            }

            116 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                if self.cancel_wait {
                    self.cancel_wait = false;
                } else {
                    let mut seen = false;
                    if self.gb(src).seen('P') {
                        let tool = self.gb(src).get_i_value() + self.gb(src).tool_number_adjust();
                        if !self.tool_heaters_at_temperature(ctx, Some(tool)) {
                            return false;
                        }
                        seen = true;
                    }
                    if self.gb(src).seen('H') {
                        let mut heaters = [0i64; HEATERS];
                        let n = self.gb(src).get_long_array(&mut heaters);
                        for &h in &heaters[..n] {
                            if h >= 0
                                && (h as usize) < HEATERS
                                && !ctx.heat.at_set_temperature(h as usize, true)
                            {
                                return false;
                            }
                        }
                        seen = true;
                    }
                    if self.gb(src).seen('C') {
                        if let Some(ch) = ctx.heat.chamber_heater() {
                            if !ctx.heat.at_set_temperature(ch, true) {
                                return false;
                            }
                        }
                        seen = true;
                    }
                    if !seen && !ctx.heat.all_heaters_at_set_temperatures(true) {
                        return false;
                    }
                }
            }

            117 => {
                let msg = self
                    .gb(src)
                    .get_unprecedented_string(true)
                    .unwrap_or_default();
                self.display_message = msg;
            }

            119 => {
                reply.push_str("Endstops - ");
                for axis in 0..AXES {
                    let es = match ctx.platform.endstop_status(axis) {
                        crate::core_traits::EndStopHit::LowHit => "at min stop",
                        crate::core_traits::EndStopHit::HighHit => "at max stop",
                        crate::core_traits::EndStopHit::LowNear => "near min stop",
                        crate::core_traits::EndStopHit::NoStop => "not stopped",
                    };
                    let sep = if axis == AXES - 1 { ' ' } else { ',' };
                    reply.push_str(&format!("{}: {}{} ", AXIS_LETTERS[axis], es, sep));
                }
                reply.push('\n');
            }

            120 => {
                if self.stack(src).push() {
                    let extruders = self.last_extruder_position;
                    self.stack(src).current_mut().extruder_positions = extruders;
                } else {
                    reply.push_str("Push(): stack overflow\n");
                    error = true;
                }
            }

            121 => match self.stack(src).pop() {
                Some(frame) => {
                    self.last_extruder_position = frame.extruder_positions;
                }
                None => {
                    reply.push_str("Pop(): stack underflow\n");
                    error = true;
                }
            },

            122 => {
                reply = self.diagnostics();
            }

            135 => {
                if self.gb(src).seen('S') {
                    ctx.platform
                        .set_heat_sample_time(self.gb(src).get_f_value() * 0.001);
                } else {
                    reply.push_str(&format!(
                        "Heat sample time is {:.3} seconds\n",
                        ctx.platform.heat_sample_time()
                    ));
                }
            }

            140 | 190 => {
                let bed = match ctx.heat.bed_heater() {
                    Some(b) => b,
                    None => {
                        reply.push_str("Hot bed is not present!\n");
                        error = true;
                        self.handle_reply(src, error, &reply);
                        return true;
                    }
                };
                if code == 190 && !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                if !self.locks.try_lock(src, heater_resource(bed)) {
                    return false;
                }
                if self.gb(src).seen('S') {
                    let t = self.gb(src).get_f_value();
                    ctx.heat.set_active_temperature(bed, t);
                    ctx.heat.activate(bed);
                }
                if code == 190 {
                    if self.cancel_wait {
                        self.cancel_wait = false;
                    } else if !ctx.heat.at_set_temperature(bed, false) {
                        return false;
                    }
                }
            }

            141 | 191 => match ctx.heat.chamber_heater() {
                Some(ch) => {
                    if self.gb(src).seen('S') {
                        let t = self.gb(src).get_f_value();
                        ctx.heat.set_active_temperature(ch, t);
                        if t <= 0.0 {
                            ctx.heat.switch_off(ch);
                        } else {
                            ctx.heat.activate(ch);
                        }
                    } else if code == 141 {
                        reply.push_str(&format!(
                            "Chamber temperature: {:.1}\n",
                            ctx.heat.get_temperature(ch)
                        ));
                    }
                    if code == 191 {
                        if self.cancel_wait {
                            self.cancel_wait = false;
                        } else if !ctx.heat.at_set_temperature(ch, false) {
                            return false;
                        }
                    }
                }
                None => {
                    reply.push_str("No chamber heater is configured!\n");
                    error = true;
                }
            },

            143 => {
                let heater = if self.gb(src).seen('H') {
                    self.gb(src).get_i_value().max(0) as usize
                } else {
                    1
                };
                if self.gb(src).seen('S') {
                    let t = self.gb(src).get_f_value();
                    if heater < HEATERS {
                        ctx.heat.set_max_temperature(heater, t);
                    }
                }
            }

            144 => {
                if let Some(bed) = ctx.heat.bed_heater() {
                    ctx.heat.standby(bed);
                }
            }

            201 | 203 => {
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let v = self.gb(src).get_f_value();
                        if code == 201 {
                            ctx.platform.set_acceleration(axis, v);
                        } else {
                            ctx.platform.set_max_feedrate(axis, v * crate::SECONDS_TO_MINUTES);
                        }
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    let mut e_vals = [0.0f32; DRIVES - AXES];
                    self.gb(src).get_float_array(&mut e_vals, true);
                    for (e, v) in e_vals.iter().enumerate() {
                        if code == 201 {
                            ctx.platform.set_acceleration(AXES + e, *v);
                        } else {
                            ctx.platform
                                .set_max_feedrate(AXES + e, *v * crate::SECONDS_TO_MINUTES);
                        }
                    }
                    seen = true;
                }
                if !seen {
                    let what = if code == 201 { "Accelerations" } else { "Maximum feedrates" };
                    reply.push_str(&format!("{}: ", what));
                    for drive in 0..DRIVES {
                        let v = if code == 201 {
                            ctx.platform.acceleration(drive)
                        } else {
                            ctx.platform.max_feedrate(drive) / crate::SECONDS_TO_MINUTES
                        };
                        reply.push_str(&format!("{:.1} ", v));
                    }
                    reply.push('\n');
                }
            }

            206 => {
                if !self.offset_axes(src, ctx) {
                    return false;
                }
            }

            207 => {
                let mut seen = false;
                if self.gb(src).seen('S') {
                    self.retract_length = self.gb(src).get_f_value().max(0.0);
                    seen = true;
                }
                if self.gb(src).seen('R') {
                    self.retract_extra = self.gb(src).get_f_value();
                    seen = true;
                }
                if self.gb(src).seen('F') {
                    self.retract_speed = self.gb(src).get_f_value().max(60.0);
                    seen = true;
                }
                if self.gb(src).seen('Z') {
                    self.retract_hop = self.gb(src).get_f_value().max(0.0);
                    seen = true;
                }
                if !seen {
                    reply.push_str(&format!(
                        "Retraction settings: length {:.2}mm, extra {:.2}mm, speed {:.0}mm/min, Z hop {:.2}mm\n",
                        self.retract_length, self.retract_extra, self.retract_speed, self.retract_hop
                    ));
                }
            }

            208 => {
                let set_min = self.gb(src).seen('S') && self.gb(src).get_i_value() == 1;
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let v = self.gb(src).get_f_value();
                        if set_min {
                            ctx.platform.set_axis_minimum(axis, v);
                        } else {
                            ctx.platform.set_axis_maximum(axis, v);
                        }
                        seen = true;
                    }
                }
                if !seen {
                    reply.push_str("Axis limits - ");
                    for axis in 0..AXES {
                        let sep = if axis == AXES - 1 { '\n' } else { ',' };
                        reply.push_str(&format!(
                            "{}: {:.1} min, {:.1} max{} ",
                            AXIS_LETTERS[axis],
                            ctx.platform.axis_minimum(axis),
                            ctx.platform.axis_maximum(axis),
                            sep
                        ));
                    }
                }
            }

            220 => {
                if self.gb(src).seen('S') {
                    let factor = self.gb(src).get_f_value() / 100.0;
                    if factor > 0.0 {
                        ctx.planner.set_speed_factor(factor);
                    } else {
                        reply.push_str("Invalid speed factor specified.\n");
                        error = true;
                    }
                } else {
                    reply.push_str(&format!(
                        "Speed factor override: {:.1}%\n",
                        ctx.planner.speed_factor() * 100.0
                    ));
                }
            }

            221 => {
                let extruder = if self.gb(src).seen('D') {
                    self.gb(src).get_i_value()
                } else {
                    0
                };
                if self.gb(src).seen('S') {
                    let factor = self.gb(src).get_f_value() / 100.0;
                    if extruder >= 0 && (extruder as usize) < DRIVES - AXES && factor >= 0.0 {
                        ctx.planner.set_extrusion_factor(extruder as usize, factor);
                    }
                } else {
                    reply.push_str(&format!(
                        "Extrusion factor override for extruder {}: {:.1}%\n",
                        extruder,
                        ctx.planner.extrusion_factor(extruder.max(0) as usize) * 100.0
                    ));
                }
            }

            280 => {
                if self.gb(src).seen('P') {
                    let servo = self.gb(src).get_i_value().max(0) as usize;
                    if self.gb(src).seen('S') {
                        let angle = self.gb(src).get_f_value();
                        if !ctx.platform.set_servo_position(servo, angle) {
                            reply.push_str(&format!("Invalid servo index {}\n", servo));
                            error = true;
                        }
                    }
                }
            }

            300 => {
                let ms = if self.gb(src).seen('P') {
                    self.gb(src).get_i_value().max(0) as u32
                } else {
                    1000
                };
                let freq = if self.gb(src).seen('S') {
                    self.gb(src).get_i_value().max(0) as u32
                } else {
                    4600
                };
                ctx.platform.beep(freq, ms);
            }

            301 | 304 => {
                let default_heater = if code == 301 { 1 } else { 0 };
                self.set_pid_parameters(src, ctx, default_heater, &mut reply);
            }

            305 | 307 => {
                // Thermistor and heater-model parameters live in the heater
                // control loops; nothing to store here.
                if self.gb(src).seen('P') {
                    let heater = self.gb(src).get_i_value();
                    if heater < 0 || heater as usize >= HEATERS {
                        reply.push_str(&format!("Heater number {} is out of range\n", heater));
                        error = true;
                    }
                }
            }

            350 => {
                let interpolate =
                    !self.gb(src).seen('I') || self.gb(src).get_i_value() != 0;
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let v = self.gb(src).get_i_value().max(1) as u32;
                        if !ctx.platform.set_microstepping(axis, v, interpolate) {
                            reply.push_str(&format!(
                                "Drive {} does not support x{} microstepping\n",
                                axis, v
                            ));
                            error = true;
                        }
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    let mut e_vals = [0i64; DRIVES - AXES];
                    let n = self.gb(src).get_long_array(&mut e_vals);
                    for (e, v) in e_vals[..n].iter().enumerate() {
                        ctx.platform
                            .set_microstepping(AXES + e, (*v).max(1) as u32, interpolate);
                    }
                    seen = true;
                }
                if !seen {
                    reply.push_str("Microstepping - ");
                    for axis in 0..AXES {
                        let (micro, interp) = ctx.platform.microstepping(axis);
                        reply.push_str(&format!(
                            "{}:{}{} ",
                            AXIS_LETTERS[axis],
                            micro,
                            if interp { "(on)" } else { "" }
                        ));
                    }
                    reply.push('\n');
                }
            }

            400 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
            }

            408 => {
                reply = format!("{}\n", self.status_response(ctx));
            }

            500 => ctx.platform.write_nv_data(),
            501 => ctx.platform.read_nv_data(),
            502 => {
                // Revert to the values in config.g without rebooting.
                if !self.doing_file_macro(src) {
                    match self.do_file_macro(src, ctx, crate::CONFIG_G) {
                        MacroStart::Started => return true,
                        MacroStart::Missing => {
                            reply.push_str("Configuration file not found\n");
                            error = true;
                        }
                        MacroStart::StackFull => {
                            reply.push_str("Push(): stack overflow\n");
                            error = true;
                        }
                    }
                }
            }
            503 => {
                match self.read_whole_file(ctx, SYS_DIR, crate::CONFIG_G) {
                    Some(contents) => {
                        let Some(chain) = self.pool.allocate() else {
                            return false;
                        };
                        self.pool.cat(chain, "Configuration file:\n");
                        self.pool.cat(chain, &contents);
                        let text = self.pool.collect(chain);
                        self.pool.release_all(chain);
                        self.handle_reply(src, false, &text);
                        return true;
                    }
                    None => {
                        reply.push_str("Configuration file not found\n");
                        error = true;
                    }
                }
            }

            540 => {
                if self.gb(src).seen('P') {
                    match parse_mac(&self.gb(src).get_string()) {
                        Some(mac) => ctx.platform.set_mac_address(mac),
                        None => {
                            reply = format!("Dud MAC address: {}\n", self.gb(src).buffer());
                            error = true;
                        }
                    }
                }
            }

            550 => {
                if self.gb(src).seen('P') {
                    let name = self.gb(src).get_string();
                    ctx.platform.set_machine_name(&name);
                } else {
                    reply.push_str(&format!("RepRap name: {}\n", ctx.platform.machine_name()));
                }
            }

            551 => {
                if self.gb(src).seen('P') {
                    let pw = self.gb(src).get_string();
                    ctx.platform.set_password(&pw);
                }
            }

            552 | 553 | 554 => {
                if code == 552 && self.gb(src).seen('S') {
                    ctx.platform.enable_network(self.gb(src).get_i_value() != 0);
                }
                if self.gb(src).seen('P') {
                    match parse_ip(&self.gb(src).get_string()) {
                        Some(ip) => match code {
                            552 => ctx.platform.set_ip_address(ip),
                            553 => ctx.platform.set_net_mask(ip),
                            _ => ctx.platform.set_gateway(ip),
                        },
                        None => {
                            reply = format!("Dud IP address: {}\n", self.gb(src).buffer());
                            error = true;
                        }
                    }
                }
            }

            555 => {
                if self.gb(src).seen('P') {
                    match Compatibility::from_code(self.gb(src).get_i_value()) {
                        Some(c) => self.router.set_emulation(src, c),
                        None => {
                            reply.push_str("Invalid emulation selected\n");
                            error = true;
                        }
                    }
                } else {
                    reply.push_str(&format!(
                        "Emulating {}\n",
                        self.router.emulation(src).name()
                    ));
                }
            }

            556 => {
                // Axis skew compensation, stored here and consulted by the
                // planner through the status interface.
                if self.gb(src).seen('S') {
                    let distance = self.gb(src).get_f_value();
                    if distance > 0.0 {
                        for axis in 0..AXES {
                            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                                self.axis_compensation[axis] =
                                    self.gb(src).get_f_value() / distance;
                            }
                        }
                    }
                } else {
                    reply.push_str(&format!(
                        "Axis compensation - XY: {:.5}, YZ: {:.5}, ZX: {:.5}\n",
                        self.axis_compensation[0],
                        self.axis_compensation[1],
                        self.axis_compensation[2]
                    ));
                }
            }

            557 => {
                if self.gb(src).seen('P') {
                    let point = self.gb(src).get_i_value().max(0) as usize;
                    if self.gb(src).seen('X') {
                        let x = self.gb(src).get_f_value();
                        ctx.planner.set_probe_point(point, 0, x);
                    }
                    if self.gb(src).seen('Y') {
                        let y = self.gb(src).get_f_value();
                        ctx.planner.set_probe_point(point, 1, y);
                    }
                }
            }

            558 => {
                if self.gb(src).seen('P') {
                    ctx.platform.set_z_probe_type(self.gb(src).get_i_value().max(0) as u8);
                } else {
                    reply.push_str(&format!("Z Probe type is {}\n", ctx.platform.z_probe_type()));
                }
            }

            559 | 560 => {
                // Upload a system or web file.
                let dir = if code == 559 { SYS_DIR } else { "0:/www" };
                let name = self
                    .gb(src)
                    .get_unprecedented_string(false)
                    .unwrap_or_default();
                if self.open_file_to_write(src, ctx, dir, &name) {
                    reply.push_str(&format!("Writing to file: {}\n", name));
                } else {
                    reply.push_str(&format!("Can't open file {} for writing.\n", name));
                    error = true;
                }
            }

            561 => {
                ctx.planner.set_identity_transform();
            }

            562 => {
                if self.gb(src).seen('P') {
                    let heater = self.gb(src).get_i_value();
                    if heater >= 0 && (heater as usize) < HEATERS {
                        ctx.heat.clear_fault(heater as usize);
                    } else {
                        reply.push_str("Invalid heater number.\n");
                        error = true;
                    }
                }
            }

            563 => self.manage_tool(src, &mut reply, &mut error),

            564 => {
                if self.gb(src).seen('S') {
                    self.limit_axes = self.gb(src).get_i_value() != 0;
                }
            }

            566 => {
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        ctx.platform.set_instant_dv(
                            axis,
                            self.gb(src).get_f_value() * crate::SECONDS_TO_MINUTES,
                        );
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    let mut e_vals = [0.0f32; DRIVES - AXES];
                    self.gb(src).get_float_array(&mut e_vals, true);
                    for (e, v) in e_vals.iter().enumerate() {
                        ctx.platform
                            .set_instant_dv(AXES + e, *v * crate::SECONDS_TO_MINUTES);
                    }
                    seen = true;
                }
                if !seen {
                    reply.push_str("Minimum speeds: ");
                    for drive in 0..DRIVES {
                        reply.push_str(&format!(
                            "{:.1} ",
                            ctx.platform.instant_dv(drive) / crate::SECONDS_TO_MINUTES
                        ));
                    }
                    reply.push('\n');
                }
            }

            567 => {
                if self.gb(src).seen('P') {
                    let tool_number = self.gb(src).get_i_value() + self.gb(src).tool_number_adjust();
                    if self.gb(src).seen(EXTRUDE_LETTER) {
                        let mut mix = [0.0f32; DRIVES - AXES];
                        let n = self.gb(src).get_float_array(&mut mix, false);
                        match self.tools.get_mut(tool_number) {
                            Some(tool) if n == tool.drive_count() => tool.set_mix(&mix[..n]),
                            Some(_) => {
                                reply.push_str("Setting mix ratios: wrong number of values\n");
                                error = true;
                            }
                            None => {
                                reply.push_str(&format!("Tool {} does not exist\n", tool_number));
                                error = true;
                            }
                        }
                    }
                }
            }

            568 => {
                if self.gb(src).seen('P') {
                    let tool_number = self.gb(src).get_i_value() + self.gb(src).tool_number_adjust();
                    let on = self.gb(src).seen('S') && self.gb(src).get_i_value() != 0;
                    match self.tools.get_mut(tool_number) {
                        Some(tool) => tool.set_mixing(on),
                        None => {
                            reply.push_str(&format!("Tool {} does not exist\n", tool_number));
                            error = true;
                        }
                    }
                }
            }

            569 => {
                if self.gb(src).seen('P') {
                    let drive = self.gb(src).get_i_value();
                    if drive >= 0 && (drive as usize) < DRIVES {
                        if self.gb(src).seen('S') {
                            ctx.platform
                                .set_direction_value(drive as usize, self.gb(src).get_i_value() != 0);
                        }
                    } else {
                        reply.push_str(&format!("Invalid drive number {}\n", drive));
                        error = true;
                    }
                }
            }

            570 => {
                if self.gb(src).seen('S') {
                    self.heater_fault_timeout = self.gb(src).get_f_value();
                } else {
                    reply.push_str(&format!(
                        "Heater fault time: {:.0} seconds\n",
                        self.heater_fault_timeout
                    ));
                }
            }

            // Ancillary PWM and extrusion-triggered outputs are pin-level
            // features handled outside this interpreter.
            571 | 572 | 573 | 578 | 580 | 911 | 912 | 913 => {}

            574 => {
                // Endstop configuration is wired at the platform level.
            }

            575 => {
                if self.gb(src).seen('S') {
                    let flags = self.gb(src).get_i_value().max(0) as u32;
                    self.set_comms_properties(CodeSource::Aux, flags);
                }
            }

            577 => {
                // Wait for the selected endstops to be triggered.
                let mut mask = 0u16;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        mask |= 1 << axis;
                    }
                }
                if mask != 0 && (ctx.platform.endstop_states() & mask) != mask {
                    return false;
                }
            }

            579 => {
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        self.axis_scale_factors[axis] = self.gb(src).get_f_value();
                        seen = true;
                    }
                }
                if !seen {
                    reply.push_str(&format!(
                        "Axis scale factors: X {:.3}, Y {:.3}, Z {:.3}\n",
                        self.axis_scale_factors[0],
                        self.axis_scale_factors[1],
                        self.axis_scale_factors[2]
                    ));
                }
            }

            581 | 582 => self.configure_trigger(src, ctx, code, &mut reply, &mut error),

            584 => {
                // Remapping axes to different drives invalidates homing.
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        seen = true;
                    }
                }
                if seen {
                    self.set_all_axes_not_homed();
                }
            }

            665 => {
                let mut seen = false;
                let mut diagonal = None;
                let mut radius = None;
                let mut print_radius = None;
                let mut homed_height = None;
                if self.gb(src).seen('L') {
                    diagonal = Some(self.gb(src).get_f_value());
                    seen = true;
                }
                if self.gb(src).seen('R') {
                    radius = Some(self.gb(src).get_f_value());
                    seen = true;
                }
                if self.gb(src).seen('B') {
                    print_radius = Some(self.gb(src).get_f_value());
                    seen = true;
                }
                if self.gb(src).seen('H') {
                    homed_height = Some(self.gb(src).get_f_value());
                    seen = true;
                }
                if seen {
                    if !self.all_moves_finished_and_loaded(src, ctx) {
                        return false;
                    }
                    ctx.planner
                        .set_delta_parameters(diagonal, radius, print_radius, homed_height);
                    if diagonal.map_or(false, |d| d > 0.0)
                        && ctx.planner.geometry() != MachineGeometry::Delta
                    {
                        ctx.planner.set_geometry(MachineGeometry::Delta);
                    }
                    // Changing the geometry parameters invalidates homing.
                    self.set_all_axes_not_homed();
                } else {
                    reply.push_str(&format!(
                        "Geometry: {:?}, print radius {:.1}, homed height {:.1}\n",
                        ctx.planner.geometry(),
                        ctx.planner.print_radius_squared().sqrt(),
                        ctx.planner.homed_height()
                    ));
                }
            }

            666 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        seen = true;
                    }
                }
                if seen {
                    self.set_all_axes_not_homed();
                }
            }

            667 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                if self.gb(src).seen('S') {
                    let g = match self.gb(src).get_i_value() {
                        0 => MachineGeometry::Cartesian,
                        _ => MachineGeometry::CoreXy,
                    };
                    ctx.planner.set_geometry(g);
                    self.set_all_axes_not_homed();
                } else {
                    reply.push_str(&format!("Printer mode is {:?}\n", ctx.planner.geometry()));
                }
            }

            906 => {
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return false;
                }
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        ctx.platform.set_motor_current(axis, self.gb(src).get_f_value());
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    let mut e_vals = [0.0f32; DRIVES - AXES];
                    self.gb(src).get_float_array(&mut e_vals, true);
                    for (e, v) in e_vals.iter().enumerate() {
                        ctx.platform.set_motor_current(AXES + e, *v);
                    }
                    seen = true;
                }
                if !seen {
                    reply.push_str("Axis currents (mA) - ");
                    for axis in 0..AXES {
                        reply.push_str(&format!(
                            "{}:{}, ",
                            AXIS_LETTERS[axis],
                            ctx.platform.motor_current(axis) as i32
                        ));
                    }
                    reply.push('E');
                    for drive in AXES..DRIVES {
                        let sep = if drive < DRIVES - 1 { ':' } else { ' ' };
                        reply.push_str(&format!(
                            "{}{}",
                            ctx.platform.motor_current(drive) as i32,
                            sep
                        ));
                    }
                    reply.push('\n');
                }
            }

            997 => {
                const IAP_FIRMWARE_FILE: &str = "RepRapFirmware.bin";
                const IAP_UPDATE_FILE: &str = "iap.bin";
                if !ctx.platform.file_exists(SYS_DIR, IAP_FIRMWARE_FILE) {
                    reply = format!(
                        "Firmware file \"{}\" not found in sys directory\n",
                        IAP_FIRMWARE_FILE
                    );
                    error = true;
                } else if !ctx.platform.file_exists(SYS_DIR, IAP_UPDATE_FILE) {
                    reply =
                        format!("IAP file \"{}\" not found in sys directory\n", IAP_UPDATE_FILE);
                    error = true;
                } else {
                    self.set_state(src, GCodeState::Flashing1);
                    return true;
                }
            }

            998 => {
                if self.gb(src).seen('P') {
                    reply = format!("{}\n", self.gb(src).get_i_value());
                }
            }

            999 => {
                // Wait half a second so the reply can reach the host, then
                // ask for a reset.
                if !self.do_dwell_time(src, 500_000, ctx) {
                    return false;
                }
                self.clear_emergency_stop();
                ctx.platform.software_reset();
            }

            _ => {
                error = true;
                reply = format!("invalid M Code: {}\n", self.gb(src).buffer());
            }
        }

        if result {
            self.handle_reply(src, error, &reply);
        }
        result
    }

    // =================================================================
    // T-codes

    fn handle_tcode(&mut self, src: CodeSource, ctx: &mut Context) -> bool {
        if self.simulating {
            self.handle_reply(src, false, "");
            return true;
        }

        if self.gb(src).buffer().trim().len() <= 1 {
            // Bare T reports the selection.
            let reply = match self.tools.current_number() {
                Some(n) => format!("Tool {} is selected.\n", n),
                None => "No tool is selected.\n".to_string(),
            };
            self.handle_reply(src, false, &reply);
            return true;
        }

        self.gb(src).seen('T');
        let new_tool = self.gb(src).get_i_value() + self.gb(src).tool_number_adjust();

        // S0 skips the tool change macros.
        if self.gb(src).seen('S') && self.gb(src).get_i_value() == 0 {
            if let Some(old) = self.tools.current_number() {
                self.tools.standby(old, ctx.heat);
            }
            self.tools.select(new_tool, ctx.heat);
            self.handle_reply(src, false, "");
            return true;
        }

        // Even when old and new are the same the sequence runs; the user
        // may want the macros.
        self.new_tool_number = new_tool;
        self.set_state(src, GCodeState::ToolChange1);
        if let Some(old) = self.tools.current_number() {
            let name = format!("tfree{}.g", old);
            let _ = self.do_file_macro(src, ctx, &name); // optional
        }
        true
    }

    // =================================================================
    // Shared helpers

    /// Set every heater of the addressed tool to `temperature`. Without a
    /// T parameter the current tool is used, and failing that the lone
    /// non-bed tool if exactly one exists.
    fn set_tool_heaters(
        &mut self,
        ctx: &mut Context,
        tool_number: Option<i32>,
        temperature: f32,
    ) -> bool {
        let bed = ctx.heat.bed_heater();
        let number = match tool_number {
            Some(n) => n,
            None => match self.tools.current_number() {
                Some(n) => n,
                None => match self.tools.only_tool(bed) {
                    Some(t) => t.number(),
                    None => return false,
                },
            },
        };
        let is_current = self.tools.current_number() == Some(number);
        let Some(tool) = self.tools.get_mut(number) else {
            return false;
        };
        tool.set_all_active(temperature);
        if is_current {
            for i in 0..tool.heater_count() {
                let h = tool.heater(i);
                ctx.heat.set_active_temperature(h, temperature);
                ctx.heat.activate(h);
            }
        }
        true
    }

    /// True when all heaters of the addressed (or current) tool are at
    /// their set temperatures.
    fn tool_heaters_at_temperature(&mut self, ctx: &mut Context, tool_number: Option<i32>) -> bool {
        let number = tool_number.or(self.tools.current_number());
        let Some(n) = number else {
            return true;
        };
        let Some(tool) = self.tools.get(n) else {
            return true;
        };
        for i in 0..tool.heater_count() {
            if !ctx.heat.at_set_temperature(tool.heater(i), true) {
                return false;
            }
        }
        true
    }

    /// Create, modify or delete a tool (M563).
    fn manage_tool(&mut self, src: CodeSource, reply: &mut String, error: &mut bool) {
        if !self.gb(src).seen('P') {
            // Allow tool numbers to be adjusted so we don't need to edit
            // files generated for other firmwares.
            if self.gb(src).seen('S') {
                let adjust = self.gb(src).get_i_value();
                self.gb(src).set_tool_number_adjust(adjust);
            }
            return;
        }
        let tool_number = self.gb(src).get_i_value();
        if tool_number < 0 {
            reply.push_str("Tool number must be positive!\n");
            *error = true;
            return;
        }

        let mut seen = false;
        let mut drives = Vec::new();
        if self.gb(src).seen('D') {
            let mut d = [0i64; DRIVES - AXES];
            let n = self.gb(src).get_long_array(&mut d);
            drives = d[..n].to_vec();
            seen = true;
        }
        let mut heaters = Vec::new();
        if self.gb(src).seen('H') {
            let mut h = [0i64; HEATERS];
            let n = self.gb(src).get_long_array(&mut h);
            heaters = h[..n].to_vec();
            seen = true;
        }
        let mut x_map = None;
        if self.gb(src).seen('X') {
            let mut axes = [0i64; AXES];
            let n = self.gb(src).get_long_array(&mut axes);
            let mut map = 0u32;
            for &a in &axes[..n] {
                if a >= 0 && (a as usize) < AXES {
                    map |= 1 << a;
                }
            }
            x_map = Some(map);
            seen = true;
        }

        if !seen {
            reply.push_str(&self.tools.describe(tool_number));
            return;
        }

        // M563 P# D-1 H-1 removes an existing tool.
        if drives == [-1] && heaters == [-1] {
            self.tools.delete(tool_number);
            return;
        }
        if self.tools.get(tool_number).is_some() {
            reply.push_str(&format!("Tool number {} already in use!\n", tool_number));
            *error = true;
            return;
        }
        let bad_drive = drives.iter().any(|&d| d < 0 || d as usize >= DRIVES - AXES);
        let bad_heater = heaters.iter().any(|&h| h < 0 || h as usize >= HEATERS);
        if bad_drive || bad_heater {
            reply.push_str("Tool definition uses invalid drives or heaters\n");
            *error = true;
            return;
        }
        let mut tool = Tool::new(
            tool_number,
            drives.iter().map(|&d| d as usize).collect(),
            heaters.iter().map(|&h| h as usize).collect(),
        );
        if let Some(map) = x_map {
            tool.set_x_axis_map(map);
        }
        self.tools.add(tool);
    }

    /// Set the P/I/D parameters for a heater (M301/M304).
    fn set_pid_parameters(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        default_heater: usize,
        reply: &mut String,
    ) {
        let heater = if self.gb(src).seen('H') {
            self.gb(src).get_i_value().max(0) as usize
        } else {
            default_heater
        };
        if heater >= HEATERS {
            reply.push_str(&format!("Heater number {} is out of range\n", heater));
            return;
        }
        let (mut kp, mut ki, mut kd) = ctx.heat.pid_parameters(heater);
        let mut seen = false;
        if self.gb(src).seen('P') {
            kp = self.gb(src).get_f_value();
            seen = true;
        }
        if self.gb(src).seen('I') {
            ki = self.gb(src).get_f_value();
            seen = true;
        }
        if self.gb(src).seen('D') {
            kd = self.gb(src).get_f_value();
            seen = true;
        }
        if seen {
            ctx.heat.set_pid_parameters(heater, kp, ki, kd);
        } else {
            reply.push_str(&format!(
                "Heater {} P:{:.2} I:{:.3} D:{:.2}\n",
                heater, kp, ki, kd
            ));
        }
    }

    /// M581 configures a trigger slot; M582 fires one if its input is
    /// already at the triggering level.
    fn configure_trigger(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        code: i32,
        reply: &mut String,
        error: &mut bool,
    ) {
        if !self.gb(src).seen('T') {
            reply.push_str("Missing T parameter\n");
            *error = true;
            return;
        }
        let slot = self.gb(src).get_i_value();
        if slot < 0 || slot as usize >= TRIGGERS {
            reply.push_str(&format!("Trigger number {} out of range\n", slot));
            *error = true;
            return;
        }
        let slot = slot as usize;

        if code == 582 {
            let printing = ctx.print_monitor.is_printing();
            let states = ctx.platform.endstop_states();
            self.triggers.fire_if_active(slot, states, printing);
            return;
        }

        let mut inputs = 0u16;
        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                inputs |= 1 << axis;
            }
        }
        if self.gb(src).seen(EXTRUDE_LETTER) {
            let mut e_drives = [0i64; DRIVES - AXES];
            let n = self.gb(src).get_long_array(&mut e_drives);
            for &e in &e_drives[..n] {
                if e >= 0 && ((AXES + e as usize) < 16) {
                    inputs |= 1 << (AXES + e as usize);
                }
            }
        }
        let rising = !self.gb(src).seen('S') || self.gb(src).get_i_value() != 0;
        let condition = if self.gb(src).seen('C') && self.gb(src).get_i_value() != 0 {
            TriggerCondition::OnlyWhenPrinting
        } else {
            TriggerCondition::Always
        };
        if inputs == 0 {
            // No inputs clears the slot.
            self.triggers.configure(slot, 0, 0, condition);
            return;
        }
        let (r, f) = if rising { (inputs, 0) } else { (0, inputs) };
        self.triggers.configure(slot, r, f, condition);
    }

    /// M206: shift the axes by the given offsets, then re-declare the old
    /// coordinates so the machine is displaced without the numbers moving.
    fn offset_axes(&mut self, src: CodeSource, ctx: &mut Context) -> bool {
        if !self.offset_set {
            if !self.all_moves_finished_and_loaded(src, ctx) {
                return false;
            }
            self.offset_record = self.move_buffer;
            self.offset_set = true;
        }

        let mut targets = [None; AXES];
        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                targets[axis] = Some(self.offset_record[axis] + self.gb(src).get_f_value());
            }
        }
        let feed = if self.gb(src).seen('F') {
            self.gb(src).get_f_value() * crate::SECONDS_TO_MINUTES
        } else {
            self.stacks[src.index()].current().feed_rate
        };

        if self.do_canned_cycle_move(src, ctx, &targets, feed, 0) {
            ctx.planner.set_positions(&self.offset_record);
            self.offset_set = false;
            return true;
        }
        false
    }

    /// Plain-text temperature report for M105.
    fn temperature_report(&self, ctx: &Context) -> String {
        let mut reply = String::from("T:");
        if let Some(tool) = self.tools.current_tool() {
            if tool.heater_count() > 0 {
                reply.push_str(&format!("{:.1}", ctx.heat.get_temperature(tool.heater(0))));
            }
        }
        if let Some(bed) = ctx.heat.bed_heater() {
            reply.push_str(&format!(" B:{:.1}", ctx.heat.get_temperature(bed)));
        }
        for heater in 1..HEATERS {
            let target = ctx.heat.active_temperature(heater);
            if target > 0.0 {
                reply.push_str(&format!(
                    " H{}:{:.1}/{:.1}",
                    heater,
                    ctx.heat.get_temperature(heater),
                    target
                ));
            }
        }
        reply.push('\n');
        reply
    }

    /// Where are we? (M114)
    fn current_coordinates(&mut self, ctx: &mut Context) -> String {
        ctx.planner.current_user_position(&mut self.move_buffer, 0);
        // Take the current tool offset back out so the user sees the
        // coordinates they commanded.
        let mut coords = self.move_buffer;
        if let Some(tool) = self.tools.current_tool() {
            for axis in 0..AXES {
                coords[axis] += tool.offset()[axis];
            }
        }
        let mut s = format!(
            "X: {:.2} Y: {:.2} Z: {:.2} ",
            coords[0], coords[1], coords[2]
        );
        for extruder in 0..(DRIVES - AXES) {
            s.push_str(&format!("E{}: {:.1} ", extruder, self.last_extruder_position[extruder]));
        }
        s.push('\n');
        s
    }

    /// JSON status snapshot (M408 and M105 S2+).
    pub fn status_response(&self, ctx: &Context) -> String {
        let status = if self.emergency_stopped {
            "H"
        } else if self.pause_status == PauseStatus::Paused {
            "A"
        } else if self.pause_status == PauseStatus::Pausing {
            "D"
        } else if self.pause_status == PauseStatus::Resuming {
            "R"
        } else if ctx.print_monitor.is_printing() {
            "P"
        } else {
            "I"
        };
        let heaters: Vec<f32> = (0..HEATERS).map(|h| ctx.heat.get_temperature(h)).collect();
        let active: Vec<f32> = (0..HEATERS).map(|h| ctx.heat.active_temperature(h)).collect();
        let mut pos = [0.0f32; DRIVES];
        ctx.planner.current_user_position(&mut pos, 0);
        let fans: Vec<f32> = (0..FANS).map(|f| ctx.platform.fan_value(f) * 100.0).collect();
        let homed: Vec<u8> = (0..AXES).map(|a| self.axis_is_homed(a) as u8).collect();
        let extr: Vec<f32> = self.last_extruder_position.to_vec();
        json!({
            "status": status,
            "heaters": heaters,
            "active": active,
            "pos": [pos[0], pos[1], pos[2]],
            "extr": extr,
            "sfactor": ctx.planner.speed_factor() * 100.0,
            "fanPercent": fans,
            "tool": self.tools.current_number().unwrap_or(-1),
            "homed": homed,
            "fraction_printed": self.fraction_of_file_printed(ctx),
            "message": self.display_message,
            "probe": ctx.platform.z_probe_value(),
        })
        .to_string()
    }

    /// Slurp a whole file through the platform interface (M503).
    fn read_whole_file(&mut self, ctx: &mut Context, dir: &str, name: &str) -> Option<String> {
        let f = ctx.platform.open_file(dir, name, false)?;
        let mut contents = Vec::new();
        let mut block = [0u8; 256];
        loop {
            let n = ctx.platform.read_block(f, &mut block);
            if n == 0 {
                break;
            }
            contents.extend_from_slice(&block[..n]);
        }
        ctx.platform.close_file(f);
        Some(String::from_utf8_lossy(&contents).into_owned())
    }
}

fn parse_ip(s: &str) -> Option<[u8; 4]> {
    let mut out = [0u8; 4];
    let mut parts = 0;
    for part in s.split('.') {
        if parts >= 4 {
            return None;
        }
        out[parts] = part.trim().parse().ok()?;
        parts += 1;
    }
    if parts == 4 {
        Some(out)
    } else {
        None
    }
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = 0;
    for part in s.split(':') {
        if parts >= 6 {
            return None;
        }
        out[parts] = u8::from_str_radix(part.trim(), 16).ok()?;
        parts += 1;
    }
    if parts == 6 {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_ip, parse_mac};

    #[test]
    fn ip_parsing() {
        assert_eq!(parse_ip("192.168.1.14"), Some([192, 168, 1, 14]));
        assert_eq!(parse_ip("192.168.1"), None);
        assert_eq!(parse_ip("192.168.1.14.5"), None);
        assert_eq!(parse_ip("a.b.c.d"), None);
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("be:ef:de:ad:fe:ed"),
            Some([0xbe, 0xef, 0xde, 0xad, 0xfe, 0xed])
        );
        assert_eq!(parse_mac("be:ef"), None);
    }
}
