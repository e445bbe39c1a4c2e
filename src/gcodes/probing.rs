// reprap_host_rust/src/gcodes/probing.rs

// Homing and Z probing. Homing delegates to the home*.g macro files; the
// probe cycle is an internal canned sequence of raise / traverse / dive /
// retreat moves advanced one phase per tick.

use super::{GCodes, MacroStart, ProbePhase};
use crate::core_traits::{Context, EndStopHit, MachineGeometry};
use crate::gcode_buffer::CodeSource;
use crate::machine_state::GCodeState;
use crate::{AXES, HOME_ALL_G, HOME_DELTA_G, HOME_X_G, HOME_Y_G, HOME_Z_G};

/// Z values below this mean "probe the bed here" rather than "use this
/// height" in a G30 with a P parameter.
const SILLY_Z_VALUE: f32 = -9999.0;

pub(crate) enum ZProbeOutcome {
    NotFinished,
    AlreadyTriggered,
    NotTriggered,
    Triggered,
}

impl GCodes {
    /// One step of the Homing sub-state: start the macro for the next axis
    /// still to be homed (X, then Y, Z last), or report the sequence done.
    pub(crate) fn home_next_axis(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
    ) -> Option<(String, bool)> {
        if self.to_be_homed == 0 {
            return Some((String::new(), false));
        }

        if ctx.planner.geometry() == MachineGeometry::Delta {
            self.set_all_axes_not_homed();
            self.to_be_homed = 0;
            return match self.do_file_macro(src, ctx, HOME_DELTA_G) {
                MacroStart::Started => None,
                MacroStart::Missing => {
                    Some((format!("Homing file {} not found\n", HOME_DELTA_G), true))
                }
                MacroStart::StackFull => Some(("Push(): stack overflow\n".to_string(), true)),
            };
        }

        // All three at once if homeall.g exists; otherwise one axis at a
        // time in X, Y, Z order.
        if self.to_be_homed == 0b111 {
            match self.do_file_macro(src, ctx, HOME_ALL_G) {
                MacroStart::Started => {
                    self.set_all_axes_not_homed();
                    self.to_be_homed = 0;
                    return None;
                }
                MacroStart::Missing => {} // fall back to per-axis files
                MacroStart::StackFull => {
                    return Some(("Push(): stack overflow\n".to_string(), true))
                }
            }
        }

        let axis = self.to_be_homed.trailing_zeros() as usize;
        let file = [HOME_X_G, HOME_Y_G, HOME_Z_G][axis];
        self.axes_homed &= !(1 << axis);
        self.to_be_homed &= !(1 << axis);
        match self.do_file_macro(src, ctx, file) {
            MacroStart::Started => None,
            MacroStart::Missing => Some((format!("Homing file {} not found\n", file), true)),
            MacroStart::StackFull => Some(("Push(): stack overflow\n".to_string(), true)),
        }
    }

    /// Dive until the Z probe triggers, up to `distance` below the start.
    fn do_z_probe(&mut self, src: CodeSource, ctx: &mut Context, distance: f32) -> ZProbeOutcome {
        if !self.canned_move_queued && ctx.platform.z_probe_result() == EndStopHit::LowHit {
            return ZProbeOutcome::AlreadyTriggered;
        }

        let targets = [None, None, Some(-distance)];
        let feed = ctx.platform.z_probe_speed();
        if self.do_canned_cycle_move(src, ctx, &targets, feed, Self::z_probe_endstops()) {
            if ctx.platform.z_probe_result() == EndStopHit::LowHit {
                ZProbeOutcome::Triggered
            } else {
                ZProbeOutcome::NotTriggered
            }
        } else {
            ZProbeOutcome::NotFinished
        }
    }

    /// Probe straight down from wherever the head is (G30 without P).
    pub(crate) fn do_single_z_probe(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        report_only: bool,
        height_adjust: f32,
        reply: &mut String,
    ) -> bool {
        let travel = 1.1 * (ctx.platform.axis_maximum(2) - ctx.platform.axis_minimum(2));
        match self.do_z_probe(src, ctx, travel) {
            ZProbeOutcome::NotFinished => false,
            ZProbeOutcome::AlreadyTriggered => {
                reply.push_str("Z probe already triggered at start of probing move\n");
                true
            }
            ZProbeOutcome::NotTriggered => {
                reply.push_str("Z probe was not triggered during probing move\n");
                true
            }
            ZProbeOutcome::Triggered => {
                if !report_only {
                    self.move_buffer[2] = ctx.platform.z_probe_stop_height() + height_adjust;
                    ctx.planner.set_positions(&self.move_buffer);
                    self.set_axis_homed(2);
                    self.last_probed_z = 0.0;
                } else {
                    reply.push_str(&format!("Stopped at height {:.3} mm\n", self.move_buffer[2]));
                }
                true
            }
        }
    }

    /// Lift, traverse to the stored probe point, probe the bed and record
    /// the height, then lift clear again. One phase per call.
    pub(crate) fn do_single_z_probe_at_point(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        point: usize,
        height_adjust: f32,
    ) -> bool {
        let dive = ctx.platform.z_probe_dive_height();
        let travel_feed = ctx.platform.z_probe_travel_speed();

        match self.probe_phase {
            ProbePhase::Idle => {
                self.probe_phase = ProbePhase::RaiseHead;
                false
            }

            ProbePhase::RaiseHead => {
                // Only does anything on the first point; afterwards Z is
                // already at the dive height.
                let targets = [None, None, Some(dive)];
                if self.do_canned_cycle_move(src, ctx, &targets, travel_feed, 0) {
                    self.probe_phase = ProbePhase::MoveToPoint;
                }
                false
            }

            ProbePhase::MoveToPoint => {
                let x = ctx.planner.probe_point(point, 0);
                let y = ctx.planner.probe_point(point, 1);
                let targets = [Some(x), Some(y), None];
                if self.do_canned_cycle_move(src, ctx, &targets, travel_feed, 0) {
                    self.probe_phase = ProbePhase::Probing;
                }
                false
            }

            ProbePhase::Probing => {
                let distance = if self.axis_is_homed(2) {
                    // Z is known, no point in going far.
                    2.0 * dive
                } else {
                    // Treat the first probe as a homing move.
                    1.1 * (ctx.platform.axis_maximum(2) - ctx.platform.axis_minimum(2))
                };
                match self.do_z_probe(src, ctx, distance) {
                    ZProbeOutcome::NotFinished => {}
                    ZProbeOutcome::AlreadyTriggered => {
                        log::warn!("Z probe already triggered at start of probing move");
                        ctx.planner.set_z_probe_point_error(point);
                        self.probe_phase = ProbePhase::Retreat;
                    }
                    ZProbeOutcome::NotTriggered => {
                        log::warn!("Z probe was not triggered during probing move");
                        ctx.planner.set_z_probe_point_error(point);
                        self.probe_phase = ProbePhase::Retreat;
                    }
                    ZProbeOutcome::Triggered => {
                        if self.axis_is_homed(2) {
                            self.last_probed_z = self.move_buffer[2]
                                - (ctx.platform.z_probe_stop_height() + height_adjust);
                        } else {
                            // Z was not homed; adopt the probe height as
                            // the datum.
                            self.move_buffer[2] =
                                ctx.platform.z_probe_stop_height() + height_adjust;
                            ctx.planner.set_positions(&self.move_buffer);
                            self.set_axis_homed(2);
                            self.last_probed_z = 0.0;
                        }
                        ctx.planner.set_probe_point(point, 2, self.last_probed_z);
                        self.probe_phase = ProbePhase::Retreat;
                    }
                }
                false
            }

            ProbePhase::Retreat => {
                let targets = [None, None, Some(dive)];
                if self.do_canned_cycle_move(src, ctx, &targets, travel_feed, 0) {
                    self.probe_phase = ProbePhase::Idle;
                    return true;
                }
                false
            }
        }
    }

    /// G30: probe at the current or a stored position. Returns true when
    /// the whole cycle is complete.
    pub(crate) fn set_single_z_probe_at_a_position(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        reply: &mut String,
        error: &mut bool,
    ) -> bool {
        let height_adjust = if self.gb(src).seen('H') {
            self.gb(src).get_f_value()
        } else {
            0.0
        };

        if !self.gb(src).seen('P') {
            let report_only = self.gb(src).seen('S') && self.gb(src).get_i_value() < 0;
            return self.do_single_z_probe(src, ctx, report_only, height_adjust, reply);
        }

        let point = self.gb(src).get_i_value();
        if point < 0 || point as usize >= ctx.planner.num_probe_points() {
            reply.push_str("Z probe point index out of range\n");
            *error = true;
            return true;
        }
        let point = point as usize;

        let x = if self.gb(src).seen('X') {
            self.gb(src).get_f_value()
        } else {
            self.move_buffer[0]
        };
        let y = if self.gb(src).seen('Y') {
            self.gb(src).get_f_value()
        } else {
            self.move_buffer[1]
        };
        let z = if self.gb(src).seen('Z') {
            self.gb(src).get_f_value()
        } else {
            SILLY_Z_VALUE
        };

        ctx.planner.set_probe_point(point, 0, x);
        ctx.planner.set_probe_point(point, 1, y);

        if z > SILLY_Z_VALUE {
            // The height was given, nothing to probe.
            ctx.planner.set_probe_point(point, 2, z);
            if self.gb(src).seen('S') {
                self.z_probes_set = true;
                let s = self.gb(src).get_i_value();
                reply.push_str(&ctx.planner.finish_bed_probing(s));
            }
            return true;
        }

        if self.do_single_z_probe_at_point(src, ctx, point, height_adjust) {
            if self.gb(src).seen('S') {
                self.z_probes_set = true;
                let s = self.gb(src).get_i_value();
                if s == 1 {
                    // Adopt the probed height as the current Z; this also
                    // accounts for the probe XY offset.
                    self.move_buffer[2] += self.last_probed_z;
                    ctx.planner.set_positions(&self.move_buffer);
                    self.last_probed_z = 0.0;
                } else {
                    reply.push_str(&ctx.planner.finish_bed_probing(s));
                }
            }
            return true;
        }
        false
    }

    /// One step of the SetBed2 sub-state: probe the stored points in turn
    /// and fit the bed equation from the results.
    pub(crate) fn probe_next_bed_point(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
    ) -> Option<(String, bool)> {
        if self.do_single_z_probe_at_point(src, ctx, self.probe_count, 0.0) {
            self.probe_count += 1;
        }
        if self.probe_count >= ctx.planner.num_probe_points() {
            self.probe_count = 0;
            self.z_probes_set = true;
            let reply = ctx.planner.finish_bed_probing(0);
            return Some((reply, false));
        }
        None
    }

    /// G32 entry: bed.g takes precedence; without it, probe the stored
    /// point set directly.
    pub(crate) fn start_bed_probing(
        &mut self,
        src: CodeSource,
        ctx: &mut Context,
        reply: &mut String,
        error: &mut bool,
    ) -> bool {
        match self.do_file_macro(src, ctx, crate::BED_EQUATION_G) {
            MacroStart::Started => {
                self.set_state(src, GCodeState::SetBed1);
                return false;
            }
            MacroStart::StackFull => {
                reply.push_str("Push(): stack overflow\n");
                *error = true;
                return true;
            }
            MacroStart::Missing => {}
        }

        if ctx.planner.num_probe_points() < 3 {
            reply.push_str("Bed probing: there needs to be 3 or more points set\n");
            *error = true;
            return true;
        }

        ctx.planner.set_identity_transform();
        self.probe_count = 0;
        self.probe_phase = ProbePhase::Idle;
        self.set_state(src, GCodeState::SetBed2);
        false
    }

    /// G28 entry: decide which axes to home and hand off to the Homing
    /// sub-state.
    pub(crate) fn start_homing(&mut self, src: CodeSource, _ctx: &mut Context) {
        let mut to_home = 0u32;
        for axis in 0..AXES {
            if self.gb(src).seen(crate::AXIS_LETTERS[axis]) {
                to_home |= 1 << axis;
            }
        }
        if to_home == 0 {
            to_home = 0b111;
        }
        self.to_be_homed = to_home;
        self.set_state(src, GCodeState::Homing);
        log::info!("homing axes {:03b}", to_home);
    }
}
