// reprap_host_rust/src/gcodes/files.rs

// File-print control: starting and selecting prints, pause/resume with
// segment replay, uploading files over a channel, and the background SHA-1
// hashing job.

use sha1::{Digest, Sha1};

use super::{GCodes, HashJob, MacroStart, PauseStatus};
use crate::core_traits::{Context, GCodeError, NO_FILE_POSITION};
use crate::gcode_buffer::CodeSource;
use crate::machine_state::GCodeState;
use crate::resources::FILE_SYSTEM_RESOURCE;
use crate::{AXES, DRIVES, FANS, FILE_HASH_BLOCK_SIZE, GCODE_DIR, PAUSE_G, RESUME_G};

impl GCodes {
    // -----------------------------------------------------------------
    // Print selection and start

    /// Open a file of G-codes to run (M23). The print starts with M24.
    pub(crate) fn queue_file_to_print(&mut self, ctx: &mut Context, file_name: &str) -> bool {
        if let Some(old) = self.file_to_print.take() {
            ctx.platform.close_file(old);
        }
        let (dir, name) = if file_name.contains(":/") {
            ("", file_name)
        } else {
            (GCODE_DIR, file_name)
        };
        match ctx.platform.open_file(dir, name, false) {
            Some(f) => {
                self.file_to_print = Some(f);
                ctx.print_monitor.starting_print(file_name);
                true
            }
            None => false,
        }
    }

    /// Attach the selected file to the file channel and let it run.
    pub(crate) fn start_selected_print(&mut self, ctx: &mut Context) -> bool {
        let Some(f) = self.file_to_print.take() else {
            return false;
        };
        let idx = CodeSource::File.index();
        self.stacks[idx].current_mut().file = Some(f);
        self.file_position = ctx.platform.position(f);
        self.fraction_of_file_printed = None;
        ctx.print_monitor.started_print();
        log::info!("print started");
        true
    }

    // -----------------------------------------------------------------
    // Pause

    /// M25/M226 bookkeeping. Captures the restore point, rewinds the print
    /// file past unexecuted segments and hands the channel to the Pausing
    /// sub-states. Returns an error reply if pausing is not possible.
    pub(crate) fn do_pause(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        in_file_pause: bool,
    ) -> Result<(), GCodeError> {
        let file_idx = CodeSource::File.index();
        if self.stacks[file_idx].current().file.is_none() {
            return Err(GCodeError::Precondition(
                "Cannot pause print, because no file is being printed!\n".to_string(),
            ));
        }
        if src == CodeSource::File && self.doing_file_macro(src) {
            return Err(GCodeError::Precondition(
                "Pausing prints using macro files is not supported\n".to_string(),
            ));
        }

        if in_file_pause {
            // The stream pauses exactly here; nothing queued is abandoned.
            self.do_pause_macro = true;
            ctx.planner.current_user_position(&mut self.move_buffer, 0);
            self.pause_restore.coords = self.move_buffer;
            for drive in AXES..DRIVES {
                self.pause_restore.coords[drive] = 0.0;
            }
        } else {
            // External pause: stop the planner between segments and replay
            // the abandoned tail of the file on resume.
            let (file_pos, skipped_moves) = ctx.planner.pause_print(&mut self.pause_restore);
            self.do_pause_macro = !ctx.planner.no_live_movement();

            if file_pos != NO_FILE_POSITION {
                if let Some(f) = self.stacks[file_idx].current().file {
                    ctx.platform.seek(f, file_pos);
                }
            }
            // The skipped raw extrusion never happened; back it out so
            // absolute E commands resume cleanly.
            for extruder in 0..(DRIVES - AXES) {
                self.last_extruder_position[extruder] -=
                    self.pause_restore.coords[extruder + AXES];
            }
            // Deferred codes that were waiting on abandoned moves must
            // never run.
            let standing = ctx.planner.scheduled_moves_count().saturating_sub(skipped_moves);
            self.queue.purge_after(CodeSource::File, standing);
            self.move_slot = None;

            log::debug!("paused print, file offset={}", file_pos);
        }

        // The modal feed rate is stored unscaled, so the restore point is
        // immune to later M220 changes.
        self.pause_restore.feed_rate = self.stacks[file_idx].current().feed_rate;

        self.fraction_of_file_printed = {
            let f = self.stacks[file_idx].current().file;
            f.map(|f| {
                let len = ctx.platform.length(f);
                if len == 0 { 0.0 } else { ctx.platform.position(f) as f32 / len as f32 }
            })
        };
        self.file_to_print = self.stacks[file_idx].current_mut().file.take();
        self.buffers[file_idx].init();
        self.pause_status = PauseStatus::Pausing;
        self.set_state(src, GCodeState::Pausing1);
        Ok(())
    }

    /// Pausing1: wait for motion to drain, snapshot the fans, then run
    /// pause.g if one is wanted and present.
    pub(crate) fn pausing_step(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
    ) -> Option<(String, bool)> {
        if !self.all_moves_finished_and_loaded(src, ctx) {
            return None;
        }
        for fan in 0..FANS {
            self.paused_fan_values[fan] = ctx.platform.fan_value(fan);
        }
        self.set_state(src, GCodeState::Pausing2);
        if self.do_pause_macro {
            match self.do_file_macro(src, ctx, PAUSE_G) {
                MacroStart::Started | MacroStart::Missing => {}
                MacroStart::StackFull => {
                    return Some(("Push(): stack overflow\n".to_string(), true));
                }
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Resume

    /// M24 on a paused print: run resume.g, then move back to the captured
    /// coordinates before handing the file back to the reader.
    pub(crate) fn start_resume(&mut self, src: CodeSource, ctx: &mut Context) {
        self.pause_status = PauseStatus::Resuming;
        self.set_state(src, GCodeState::Resuming1);
        if self.do_pause_macro {
            match self.do_file_macro(src, ctx, RESUME_G) {
                MacroStart::Started | MacroStart::Missing => {}
                MacroStart::StackFull => log::warn!("no room to run {}", RESUME_G),
            }
            self.do_pause_macro = false;
        }
    }

    pub(crate) fn resuming_step(
        &mut self,
        src: CodeSource,
        state: GCodeState,
        ctx: &mut Context,
    ) -> Option<(String, bool)> {
        let travel = ctx.platform.z_probe_travel_speed();
        match state {
            GCodeState::Resuming1 => {
                // resume.g has finished. If the head is above the paused
                // height, traverse in XY first and lower afterwards.
                if !self.all_moves_finished_and_loaded(src, ctx) {
                    return None;
                }
                if self.move_buffer[2] > self.pause_restore.coords[2] {
                    self.set_state(src, GCodeState::Resuming2);
                } else {
                    self.set_state(src, GCodeState::Resuming3);
                }
                None
            }
            GCodeState::Resuming2 => {
                let targets = [
                    Some(self.pause_restore.coords[0]),
                    Some(self.pause_restore.coords[1]),
                    None,
                ];
                if self.do_canned_cycle_move(src, ctx, &targets, travel, 0) {
                    self.set_state(src, GCodeState::Resuming3);
                }
                None
            }
            GCodeState::Resuming3 => {
                let targets = [
                    Some(self.pause_restore.coords[0]),
                    Some(self.pause_restore.coords[1]),
                    Some(self.pause_restore.coords[2]),
                ];
                if !self.do_canned_cycle_move(src, ctx, &targets, travel, 0) {
                    return None;
                }
                for fan in 0..FANS {
                    ctx.platform.set_fan_value(fan, self.paused_fan_values[fan]);
                }
                let file_idx = CodeSource::File.index();
                self.stacks[file_idx].current_mut().feed_rate = self.pause_restore.feed_rate;
                ctx.planner
                    .set_feed_rate(self.pause_restore.feed_rate * ctx.planner.speed_factor());
                if let Some(f) = self.file_to_print.take() {
                    self.stacks[file_idx].current_mut().file = Some(f);
                }
                self.fraction_of_file_printed = None;
                self.pause_status = PauseStatus::NotPaused;
                log::info!("print resumed");
                Some(("Printing resumed\n".to_string(), false))
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------
    // Upload (M28/M29)

    /// Start saving incoming codes to a file instead of executing them.
    pub(crate) fn open_file_to_write(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        directory: &str,
        file_name: &str,
    ) -> bool {
        match ctx.platform.open_file(directory, file_name, true) {
            Some(f) => {
                self.file_being_written = Some(f);
                self.writing_source = Some(src);
                self.gb(src).set_writing_file_directory(Some(directory));
                true
            }
            None => false,
        }
    }

    /// Copy the buffered line into the file being written, or finish on
    /// M29. Line numbers and checksums were already stripped.
    pub(crate) fn write_gcode_to_file(&mut self, src: CodeSource, ctx: &mut Context) {
        if self.gb(src).command() == Some(('M', 29)) {
            if let Some(f) = self.file_being_written.take() {
                ctx.platform.close_file(f);
            }
            self.writing_source = None;
            self.gb(src).set_writing_file_directory(None);
            self.handle_reply(src, false, "File upload complete\n");
            return;
        }
        let line = format!("{}\n", self.gb(src).buffer());
        if let Some(f) = self.file_being_written {
            if !ctx.platform.write_bytes(f, line.as_bytes()) {
                log::error!("cannot write to file being uploaded");
            }
        }
        self.handle_reply(src, false, "");
    }

    // -----------------------------------------------------------------
    // M38: background SHA-1 of a file

    /// Open the file and set up the digest. The file-system lock is held
    /// for the whole job.
    pub(crate) fn start_hash(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        file_name: &str,
    ) -> bool {
        if !self.locks.try_lock(src, FILE_SYSTEM_RESOURCE) {
            return false;
        }
        let (dir, name) = if file_name.contains(":/") {
            ("", file_name)
        } else {
            (GCODE_DIR, file_name)
        };
        match ctx.platform.open_file(dir, name, false) {
            Some(f) => {
                self.hashing = Some(HashJob { file: f, source: src, hasher: Sha1::new() });
                true
            }
            None => {
                self.locks.release(src, FILE_SYSTEM_RESOURCE);
                false
            }
        }
    }

    /// Fold one block into the digest. Returns true at end of file.
    pub(crate) fn advance_hash(&mut self, ctx: &mut Context) -> bool {
        let Some(job) = self.hashing.as_mut() else {
            return true;
        };
        if ctx.platform.position(job.file) >= ctx.platform.length(job.file) {
            return true;
        }
        let mut buffer = [0u8; FILE_HASH_BLOCK_SIZE];
        let n = ctx.platform.read_block(job.file, &mut buffer);
        job.hasher.update(&buffer[..n]);
        false
    }

    /// Finalize the digest, reply with the hex form and clean up.
    pub(crate) fn report_hash(&mut self, ctx: &mut Context) {
        let Some(job) = self.hashing.take() else {
            return;
        };
        let digest = job.hasher.finalize();
        let mut reply = String::with_capacity(digest.len() * 2 + 1);
        for byte in digest {
            reply.push_str(&format!("{:02x}", byte));
        }
        reply.push('\n');
        ctx.platform.close_file(job.file);
        self.locks.release(job.source, FILE_SYSTEM_RESOURCE);
        self.handle_reply(job.source, false, &reply);
    }
}
