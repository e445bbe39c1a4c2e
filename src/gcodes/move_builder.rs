// reprap_host_rust/src/gcodes/move_builder.rs

// Converts a parsed motion command into a RawMove using the modal state:
// units, relative modes, tool offsets and axis mapping, extrusion factors
// and soft limits. The planner expects axis targets absolute and extruder
// values as per-move increments.

use super::{GCodes, PauseStatus};
use crate::core_traits::{
    Context, GCodeError, MachineGeometry, RawMove, NO_FILE_POSITION, Z_PROBE_ACTIVE,
};
use crate::gcode_buffer::CodeSource;
use crate::tools::Tool;
use crate::{AXES, AXIS_LETTERS, DRIVES, EXTRUDE_LETTER, FEEDRATE_LETTER, SECONDS_TO_MINUTES};

pub(crate) enum MoveOutcome {
    /// The move slot is occupied; try again next tick.
    NotReady,
    /// Move accepted; the command is complete.
    Queued,
    /// Move accepted but it checks endstops, so the channel must wait for
    /// it to finish before issuing anything else.
    QueuedWaitForFinish,
    /// The move was refused outright (error text becomes the reply).
    Rejected(String),
}

impl GCodes {
    /// Load move_buffer from the G-code in the channel's buffer. On entry
    /// move_buffer holds the current user position. `doing_g92` writes
    /// positions instead of planning motion; `apply_limits` clips the
    /// result to the machine volume.
    pub(crate) fn load_move_buffer_from_gcode(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        doing_g92: bool,
        apply_limits: bool,
    ) -> Result<(), GCodeError> {
        // Zero every extruder drive: values are per-move increments and
        // some drives may not be mentioned.
        for drive in AXES..DRIVES {
            self.move_buffer[drive] = 0.0;
        }

        // Feed rate first so everything after it sees the new value.
        if self.gb(src).seen(FEEDRATE_LETTER) {
            let f = self.gb(src).get_f_value();
            let feed = f * self.distance_scale * SECONDS_TO_MINUTES;
            self.stack(src).current_mut().feed_rate = feed;
        }

        let tool: Option<Tool> = self.tools.current_tool().cloned();

        // Extrusion before axes, so tool mapping of X sees the latest X.
        if self.gb(src).seen(EXTRUDE_LETTER) {
            let Some(tool) = tool.as_ref() else {
                return Err(GCodeError::Precondition(
                    "Attempting to extrude with no tool selected\n".to_string(),
                ));
            };

            let e_move_count = tool.drive_count();
            if e_move_count > 0 {
                let mut e_movement = [0.0f32; DRIVES - AXES];
                if tool.mixing() {
                    let length = self.gb(src).get_f_value();
                    for (drive, mix) in tool.mix().iter().enumerate() {
                        e_movement[drive] = length * mix;
                    }
                } else {
                    let n = self.gb(src).get_float_array(&mut e_movement, false);
                    if n != e_move_count {
                        return Err(GCodeError::Semantic(format!(
                            "Wrong number of extruder drives for the selected tool: {}\n",
                            self.gb(src).buffer()
                        )));
                    }
                }

                for e_drive in 0..e_move_count {
                    let drive = tool.drive(e_drive);
                    let move_arg = e_movement[e_drive] * self.distance_scale;
                    let factor = ctx.planner.extrusion_factor(drive);
                    if doing_g92 {
                        self.move_buffer[drive + AXES] = move_arg;
                        self.last_extruder_position[drive] = move_arg;
                    } else if self.stacks[src.index()].current().drives_relative {
                        // In relative mode the value is the delta; the raw
                        // position bookkeeping only tracks absolute E.
                        self.move_buffer[drive + AXES] = move_arg * factor;
                    } else {
                        let delta = move_arg - self.last_extruder_position[drive];
                        self.move_buffer[drive + AXES] = delta * factor;
                        if !self.simulating {
                            self.last_extruder_position[drive] = move_arg;
                        }
                    }
                }
            }
        }

        // Resume moves (G1 R1) replay the coordinates captured at pause.
        let mut doing_resume_move = false;
        if self.gb(src).seen('R') && self.gb(src).get_i_value() > 0 {
            if self.pause_status == PauseStatus::NotPaused {
                return Err(GCodeError::Precondition(
                    "Resume moves are only allowed while the print is paused\n".to_string(),
                ));
            }
            doing_resume_move = true;
        }

        let axes_relative = self.stacks[src.index()].current().axes_relative;
        let is_delta = ctx.planner.geometry() == MachineGeometry::Delta;

        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                let raw = self.gb(src).get_f_value()
                    * self.distance_scale
                    * self.axis_scale_factors[axis];

                if doing_g92 {
                    // A G92 defines the absolute axis position.
                    self.set_axis_homed(axis);
                    self.move_buffer[axis] = raw;
                    continue;
                }

                // One commanded X may drive several physical axes.
                let targets: Vec<usize> = if axis == 0 {
                    let map = tool.as_ref().map(|t| t.x_axis_map()).unwrap_or(1);
                    (0..AXES).filter(|a| (map & (1 << a)) != 0).collect()
                } else {
                    vec![axis]
                };

                for target in targets {
                    let mut move_arg = raw;
                    if doing_resume_move {
                        move_arg += self.pause_restore.coords[target];
                    } else if axes_relative {
                        move_arg += self.move_buffer[target];
                    } else if let Some(tool) = tool.as_ref() {
                        // Compensate the requested position for the tool
                        // offset.
                        move_arg -= tool.offset()[target];
                    }

                    if apply_limits && self.axis_is_homed(target) && !is_delta {
                        move_arg = move_arg
                            .max(ctx.platform.axis_minimum(target))
                            .min(ctx.platform.axis_maximum(target));
                    }
                    self.move_buffer[target] = move_arg;
                }
            } else if doing_resume_move {
                self.move_buffer[axis] = self.pause_restore.coords[axis];
            }
        }

        // On a delta with all towers homed, keep the end point inside the
        // printable envelope. Unhomed axes skip the check so extruder-only
        // moves work before homing.
        if apply_limits && is_delta && self.all_axes_are_homed() {
            let diagonal_squared =
                self.move_buffer[0] * self.move_buffer[0] + self.move_buffer[1] * self.move_buffer[1];
            let radius_squared = ctx.planner.print_radius_squared();
            if diagonal_squared > radius_squared {
                let factor = (radius_squared / diagonal_squared).sqrt();
                self.move_buffer[0] *= factor;
                self.move_buffer[1] *= factor;
            }
            self.move_buffer[2] = self.move_buffer[2]
                .min(ctx.planner.homed_height())
                .max(ctx.platform.axis_minimum(2));
        }

        Ok(())
    }

    /// Handle a G0/G1: build the move and place it in the single move slot.
    pub(crate) fn set_up_move(&mut self, src: CodeSource, ctx: &mut Context) -> MoveOutcome {
        // Last one gone yet?
        if self.move_slot.is_some() {
            return MoveOutcome::NotReady;
        }

        // Check for a move that watches endstops (homing or raw motor).
        let mut endstops_to_check = 0;
        let mut move_type = 0u8;
        if self.gb(src).seen('S') {
            let ival = self.gb(src).get_i_value();
            if ival == 1 || ival == 2 {
                move_type = ival as u8;
            }
            if ival == 1 {
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        endstops_to_check |= 1 << axis;
                    }
                }
            }
        }

        if ctx.planner.geometry() == MachineGeometry::Delta {
            let axes_relative = self.stacks[src.index()].current().axes_relative;
            if move_type != 0 && !axes_relative {
                return MoveOutcome::Rejected(
                    "Attempt to move the motors of a delta printer to absolute positions\n"
                        .to_string(),
                );
            }
            if move_type == 0 && !self.all_axes_are_homed() {
                let mut sees_axis = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        sees_axis = true;
                    }
                }
                if sees_axis {
                    return MoveOutcome::Rejected(
                        "Attempt to move the head of a delta printer before homing the towers\n"
                            .to_string(),
                    );
                }
            }
        }

        ctx.planner.current_user_position(&mut self.move_buffer, move_type);

        let apply_limits = self.limit_axes && move_type == 0;
        if let Err(e) = self.load_move_buffer_from_gcode(src, ctx, false, apply_limits) {
            return MoveOutcome::Rejected(e.to_string());
        }

        let file_position = if src == CodeSource::File && !self.doing_file_macro(src) {
            self.file_position
        } else {
            NO_FILE_POSITION
        };

        // Pressure advance only matters when the head is actually moving
        // across the bed.
        let has_xy = {
            let mut v = false;
            for axis in [0usize, 1] {
                if self.gb(src).seen(AXIS_LETTERS[axis]) {
                    v = true;
                }
            }
            v
        };

        let feed_rate =
            self.stacks[src.index()].current().feed_rate * ctx.planner.speed_factor();
        let mv = RawMove {
            coords: self.move_buffer,
            feed_rate,
            endstops_to_check,
            move_type,
            use_pressure_advance: has_xy,
            firmware_retraction: false,
            file_position,
        };
        self.move_slot = Some(mv);
        self.retry_move_slot(ctx);

        if move_type != 0 {
            MoveOutcome::QueuedWaitForFinish
        } else {
            MoveOutcome::Queued
        }
    }

    /// Handle a G92: redefine the current position. Returns false while
    /// waiting for motion to stop.
    pub(crate) fn set_positions_from_gcode(&mut self, src: CodeSource, ctx: &mut Context) -> bool {
        // Don't interrupt the machine if only extruder drives are reset;
        // that avoids blobs when a file uses absolute E with periodic
        // G92 E0.
        let mut including_axes = false;
        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                including_axes = true;
                break;
            }
        }

        if including_axes {
            if !self.all_moves_finished_and_loaded(src, ctx) {
                return false;
            }
        } else if self.move_slot.is_some() {
            // Wait for the previous move to be taken so the position we
            // read is current.
            return false;
        }

        ctx.planner.current_user_position(&mut self.move_buffer, 0);
        let ok = self.load_move_buffer_from_gcode(src, ctx, true, false).is_ok();
        if ok && including_axes {
            ctx.planner.set_positions(&self.move_buffer);
        }
        true
    }

    /// Firmware retraction (G10 without P, and G11). The configured retract
    /// speed is used as-is, never scaled by the speed factor.
    pub(crate) fn retract(&mut self, _src: CodeSource, ctx: &mut Context, retracting: bool) -> bool {
        if self.retracted == retracting {
            return true;
        }
        if self.move_slot.is_some() {
            return false;
        }
        let Some(tool) = self.tools.current_tool().cloned() else {
            // Nothing to retract with; treat as done.
            return true;
        };

        ctx.planner.current_user_position(&mut self.move_buffer, 0);
        for drive in AXES..DRIVES {
            self.move_buffer[drive] = 0.0;
        }
        let amount = if retracting {
            -self.retract_length
        } else {
            self.retract_length + self.retract_extra
        };
        for i in 0..tool.drive_count() {
            self.move_buffer[tool.drive(i) + AXES] = amount;
        }
        if self.retract_hop != 0.0 {
            self.move_buffer[2] += if retracting { self.retract_hop } else { -self.retract_hop };
        }

        let mv = RawMove {
            coords: self.move_buffer,
            feed_rate: self.retract_speed * SECONDS_TO_MINUTES,
            endstops_to_check: 0,
            move_type: 0,
            use_pressure_advance: false,
            firmware_retraction: true,
            file_position: NO_FILE_POSITION,
        };
        self.move_slot = Some(mv);
        self.retry_move_slot(ctx);
        self.retracted = retracting;
        true
    }

    /// Queue one internally generated move (canned cycles, resume
    /// repositioning). Targets are absolute; None leaves the axis alone.
    /// Call until it returns true: the first successful call queues the
    /// move, later calls wait for it to drain.
    pub(crate) fn do_canned_cycle_move(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        targets: &[Option<f32>; AXES],
        feed_rate: f32,
        endstops: u16,
    ) -> bool {
        if self.canned_move_queued {
            if self.move_slot.is_none() && ctx.planner.all_moves_finished() {
                self.canned_move_queued = false;
                // Pick up where the machine actually stopped; an endstop
                // may have cut the move short.
                ctx.planner.current_user_position(&mut self.move_buffer, 0);
                return true;
            }
            return false;
        }

        if !self.all_moves_finished_and_loaded(src, ctx) {
            return false;
        }
        for drive in AXES..DRIVES {
            self.move_buffer[drive] = 0.0;
        }
        for (axis, t) in targets.iter().enumerate() {
            if let Some(v) = *t {
                self.move_buffer[axis] = v;
            }
        }
        let mv = RawMove {
            coords: self.move_buffer,
            feed_rate,
            endstops_to_check: endstops,
            move_type: 0,
            use_pressure_advance: false,
            firmware_retraction: false,
            file_position: NO_FILE_POSITION,
        };
        self.move_slot = Some(mv);
        self.retry_move_slot(ctx);
        self.canned_move_queued = true;
        false
    }

    /// A canned Z move with the probe armed uses the probe bit instead of
    /// an axis endstop.
    pub(crate) fn z_probe_endstops() -> u16 {
        Z_PROBE_ACTIVE
    }
}
