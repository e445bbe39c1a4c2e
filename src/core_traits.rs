// reprap_host_rust/src/core_traits.rs

// Collaborator interfaces consumed by the G-code core. The orchestrator owns
// the concrete implementations; each spin call borrows them through a
// `Context` so no subsystem needs a back-pointer to reach its siblings.

use crate::DRIVES;
use thiserror::Error;

/// Errors surfaced to the issuing channel as "Error: ..." replies. Transient
/// waits (move slot full, lock held, temperature not reached) are not errors;
/// those paths report "not finished yet" and are retried on a later tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GCodeError {
    #[error("invalid G Code: {0}")]
    InvalidCode(String),
    #[error("{0}")]
    Semantic(String),
    #[error("{0}")]
    Precondition(String),
    #[error("stack overflow on {0} channel")]
    StackOverflow(&'static str),
    #[error("stack underflow on {0} channel")]
    StackUnderflow(&'static str),
}

pub type FilePosition = u64;
pub const NO_FILE_POSITION: FilePosition = FilePosition::MAX;

/// Bitmap of drive numbers whose endstops abort the move when triggered.
pub type EndstopChecks = u16;
/// Must be distinct from 1 << (any drive number).
pub const Z_PROBE_ACTIVE: EndstopChecks = 1 << 15;

/// Opaque handle to an open file owned by the platform layer.
pub type FileHandle = u32;

/// A single movement handed to the look-ahead queue. Axis coordinates are
/// absolute, extruder values are per-move increments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMove {
    pub coords: [f32; DRIVES],
    /// Requested feed rate in mm/s, already scaled by the speed factor.
    pub feed_rate: f32,
    pub endstops_to_check: EndstopChecks,
    /// 0 = normal move, 1 = homing move checking endstops, 2 = raw motor move.
    pub move_type: u8,
    pub use_pressure_advance: bool,
    pub firmware_retraction: bool,
    /// Where in the print file this move came from, for pause bookkeeping.
    pub file_position: FilePosition,
}

impl Default for RawMove {
    fn default() -> Self {
        RawMove {
            coords: [0.0; DRIVES],
            feed_rate: crate::DEFAULT_FEEDRATE,
            endstops_to_check: 0,
            move_type: 0,
            use_pressure_advance: false,
            firmware_retraction: false,
            file_position: NO_FILE_POSITION,
        }
    }
}

/// Snapshot of per-drive coordinates and feed rate, taken at pause or at the
/// start of a tool change so the position can be re-established afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestorePoint {
    pub coords: [f32; DRIVES],
    pub feed_rate: f32,
}

impl Default for RestorePoint {
    fn default() -> Self {
        RestorePoint { coords: [0.0; DRIVES], feed_rate: crate::DEFAULT_FEEDRATE }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStopHit {
    NoStop,
    LowHit,
    HighHit,
    LowNear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineGeometry {
    Cartesian,
    CoreXy,
    Delta,
}

/// The look-ahead move queue. The core builds `RawMove` records; step timing
/// and kinematics live on the other side of this interface.
pub trait MovePlanner {
    /// Offer a move to the look-ahead queue. Returns false if the queue
    /// cannot accept it yet; the caller retries on a later tick.
    fn try_queue_move(&mut self, m: &RawMove) -> bool;

    /// True when the look-ahead queue is empty and no step generation is
    /// outstanding.
    fn all_moves_finished(&self) -> bool;

    /// Allow the planner to start new moves again after a drain request.
    fn resume_moving(&mut self);

    /// Fetch the user-space coordinates after the last completed move.
    /// `move_type` selects whether bed compensation is backed out.
    fn current_user_position(&self, coords: &mut [f32; DRIVES], move_type: u8);

    /// Redefine the current position (G92 and friends).
    fn set_positions(&mut self, coords: &[f32; DRIVES]);
    fn set_feed_rate(&mut self, feed_rate: f32);

    /// Stop feeding the look-ahead queue, snapshot the restore point and
    /// return the file position of the first unexecuted move plus the number
    /// of moves that were scheduled but will never run.
    fn pause_print(&mut self, restore: &mut RestorePoint) -> (FilePosition, u32);

    /// True if nothing was actually moving when the pause was requested.
    fn no_live_movement(&self) -> bool;

    fn scheduled_moves_count(&self) -> u32;
    fn completed_moves_count(&self) -> u32;

    fn geometry(&self) -> MachineGeometry;
    /// Changing geometry invalidates homing; the executor clears its homed
    /// flags when it calls this.
    fn set_geometry(&mut self, g: MachineGeometry);
    /// Print radius squared, for delta envelope clamping.
    fn print_radius_squared(&self) -> f32;
    /// Homed height, for delta envelope clamping.
    fn homed_height(&self) -> f32;
    fn set_delta_parameters(
        &mut self,
        diagonal: Option<f32>,
        radius: Option<f32>,
        print_radius: Option<f32>,
        homed_height: Option<f32>,
    );

    /// Abandon all motion immediately (M112). No deceleration guarantees.
    fn emergency_stop(&mut self);

    /// Enter or leave simulation: moves advance a simulated clock only.
    fn simulate(&mut self, on: bool);
    fn simulation_time(&self) -> f32;

    fn set_speed_factor(&mut self, factor: f32);
    fn speed_factor(&self) -> f32;
    fn set_extrusion_factor(&mut self, extruder: usize, factor: f32);
    fn extrusion_factor(&self, extruder: usize) -> f32;

    fn set_idle_timeout(&mut self, seconds: f32);

    /// Reset bed compensation (before probing a fresh set of points).
    fn set_identity_transform(&mut self);
    fn set_probe_point(&mut self, index: usize, axis: usize, value: f32);
    fn set_z_probe_point_error(&mut self, index: usize);
    fn probe_point(&self, index: usize, axis: usize) -> f32;
    fn num_probe_points(&self) -> usize;
    /// Compute the bed transform from the probed points. Returns a report.
    fn finish_bed_probing(&mut self, s_param: i32) -> String;
}

/// Heater control. The PID loops and thermal protection live behind this.
pub trait Heat {
    fn set_active_temperature(&mut self, heater: usize, t: f32);
    fn active_temperature(&self, heater: usize) -> f32;
    fn set_standby_temperature(&mut self, heater: usize, t: f32);
    fn standby_temperature(&self, heater: usize) -> f32;
    /// Make the active temperature the target.
    fn activate(&mut self, heater: usize);
    /// Make the standby temperature the target.
    fn standby(&mut self, heater: usize);
    fn switch_off(&mut self, heater: usize);
    fn switch_off_all(&mut self);
    fn get_temperature(&self, heater: usize) -> f32;
    /// True once the heater has settled at its target. `wait_when_cooling`
    /// selects whether an over-temperature heater also counts as "not there
    /// yet".
    fn at_set_temperature(&self, heater: usize, wait_when_cooling: bool) -> bool;
    fn all_heaters_at_set_temperatures(&self, wait_when_cooling: bool) -> bool;
    fn bed_heater(&self) -> Option<usize>;
    fn chamber_heater(&self) -> Option<usize>;
    fn heater_fault(&self, heater: usize) -> bool;
    fn clear_fault(&mut self, heater: usize);
    fn set_max_temperature(&mut self, heater: usize, t: f32);
    fn set_pid_parameters(&mut self, heater: usize, kp: f32, ki: f32, kd: f32);
    fn pid_parameters(&self, heater: usize) -> (f32, f32, f32);
    /// Zero every heater PWM without waiting. Used by the emergency stop.
    fn emergency_switch_off_all(&mut self);
}

/// Everything hardware- and storage-shaped that the core consumes: the file
/// system, endstop inputs, fans, drives and the network identity setters.
pub trait Platform {
    // --- file system ---
    fn open_file(&mut self, directory: &str, name: &str, write: bool) -> Option<FileHandle>;
    fn file_exists(&self, directory: &str, name: &str) -> bool;
    fn delete_file(&mut self, directory: &str, name: &str) -> bool;
    fn read_byte(&mut self, f: FileHandle) -> Option<u8>;
    fn read_block(&mut self, f: FileHandle, buf: &mut [u8]) -> usize;
    fn write_bytes(&mut self, f: FileHandle, data: &[u8]) -> bool;
    fn seek(&mut self, f: FileHandle, pos: FilePosition) -> bool;
    fn position(&self, f: FileHandle) -> FilePosition;
    fn length(&self, f: FileHandle) -> FilePosition;
    fn close_file(&mut self, f: FileHandle);
    fn file_list(&self, directory: &str) -> Vec<String>;

    // --- time ---
    /// Monotonic microsecond clock. All core timing is integer microseconds.
    fn monotonic_us(&self) -> u64;

    // --- endstops and Z probe ---
    /// Bitmap of currently made endstop inputs, one bit per drive.
    fn endstop_states(&self) -> u16;
    fn endstop_status(&self, axis: usize) -> EndStopHit;
    fn z_probe_result(&self) -> EndStopHit;
    fn z_probe_value(&self) -> i32;
    fn z_probe_type(&self) -> u8;
    fn set_z_probe_type(&mut self, t: u8);
    fn z_probe_dive_height(&self) -> f32;
    fn z_probe_stop_height(&self) -> f32;
    fn z_probe_travel_speed(&self) -> f32;
    fn z_probe_speed(&self) -> f32;

    // --- drives ---
    fn disable_drive(&mut self, drive: usize);
    fn enable_drive(&mut self, drive: usize);
    fn set_drives_idle(&mut self);
    fn set_drive_steps_per_unit(&mut self, drive: usize, v: f32);
    fn drive_steps_per_unit(&self, drive: usize) -> f32;
    fn set_direction_value(&mut self, drive: usize, forwards: bool);
    fn set_motor_current(&mut self, drive: usize, ma: f32);
    fn motor_current(&self, drive: usize) -> f32;
    fn set_microstepping(&mut self, drive: usize, micro: u32, interpolate: bool) -> bool;
    fn microstepping(&self, drive: usize) -> (u32, bool);
    fn axis_minimum(&self, axis: usize) -> f32;
    fn axis_maximum(&self, axis: usize) -> f32;
    fn set_axis_minimum(&mut self, axis: usize, v: f32);
    fn set_axis_maximum(&mut self, axis: usize, v: f32);
    fn acceleration(&self, drive: usize) -> f32;
    fn set_acceleration(&mut self, drive: usize, v: f32);
    fn max_feedrate(&self, drive: usize) -> f32;
    fn set_max_feedrate(&mut self, drive: usize, v: f32);
    fn instant_dv(&self, drive: usize) -> f32;
    fn set_instant_dv(&mut self, drive: usize, v: f32);

    // --- fans, servos, auxiliary outputs ---
    fn set_fan_value(&mut self, fan: usize, value: f32);
    fn fan_value(&self, fan: usize) -> f32;
    fn set_servo_position(&mut self, servo: usize, angle: f32) -> bool;
    fn set_atx_power(&mut self, on: bool);
    fn beep(&mut self, frequency: u32, ms: u32);
    fn set_output_pin(&mut self, pin: u32, level: bool) -> bool;

    // --- identity and network ---
    fn set_ip_address(&mut self, ip: [u8; 4]);
    fn set_net_mask(&mut self, mask: [u8; 4]);
    fn set_gateway(&mut self, gw: [u8; 4]);
    fn set_mac_address(&mut self, mac: [u8; 6]);
    fn set_machine_name(&mut self, name: &str);
    fn machine_name(&self) -> String;
    fn set_password(&mut self, password: &str);
    fn enable_network(&mut self, on: bool);
    fn firmware_name(&self) -> &'static str;
    fn firmware_version(&self) -> &'static str;
    fn electronics(&self) -> &'static str;

    // --- lifecycle ---
    fn software_reset(&mut self);
    fn update_firmware(&mut self);
    fn write_nv_data(&mut self);
    fn read_nv_data(&mut self);
    fn set_heat_sample_time(&mut self, seconds: f32);
    fn heat_sample_time(&self) -> f32;
}

/// Print progress bookkeeping, consumed for M23/M24/M27/M36 and status.
pub trait PrintMonitor {
    fn starting_print(&mut self, filename: &str);
    fn started_print(&mut self);
    fn stopped_print(&mut self);
    fn is_printing(&self) -> bool;
    fn file_info_response(&self, filename: Option<&str>) -> String;
}

/// The collaborators a single executor tick may touch, borrowed together.
pub struct Context<'a> {
    pub planner: &'a mut dyn MovePlanner,
    pub heat: &'a mut dyn Heat,
    pub platform: &'a mut dyn Platform,
    pub print_monitor: &'a mut dyn PrintMonitor,
}
