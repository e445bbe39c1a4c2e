// reprap_host_rust/src/test_utils.rs

// Simulated collaborators for tests: a recording move planner, a heater
// model that settles on demand, an in-memory file system platform and a
// print monitor. These let the executor run entire command streams without
// hardware.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::core_traits::{
    EndStopHit, FileHandle, FilePosition, Heat, MachineGeometry, MovePlanner, Platform,
    PrintMonitor, RawMove, RestorePoint, NO_FILE_POSITION,
};
use crate::output_buffer::{BufferIndex, OutputBufferPool};
use crate::reply::{MessageType, ReplySink};
use crate::{AXES, DRIVES, HEATERS};

// ---------------------------------------------------------------------------
// Move planner

pub struct SimPlanner {
    /// Every move accepted, in order.
    pub moves: Vec<RawMove>,
    pub position: [f32; DRIVES],
    pub feed_rate: f32,
    /// When false, try_queue_move refuses and the executor must retry.
    pub accept_moves: bool,
    /// When true, accepted moves complete instantly and the position jumps
    /// to the move target.
    pub auto_complete: bool,
    scheduled: u32,
    completed: u32,
    pub geometry: MachineGeometry,
    pub print_radius: f32,
    pub homed_height: f32,
    speed_factor: f32,
    extrusion_factors: [f32; DRIVES - AXES],
    simulating: bool,
    sim_time: f32,
    probe_points: [[f32; 3]; 16],
    probe_errors: [bool; 16],
    num_probe_points: usize,
    /// Restore point handed out by the next pause_print call.
    pub pause_file_pos: FilePosition,
    pub pause_skipped_moves: u32,
    pub live_movement: bool,
    pub idle_timeout: f32,
}

impl SimPlanner {
    pub fn new() -> Self {
        SimPlanner {
            moves: Vec::new(),
            position: [0.0; DRIVES],
            feed_rate: crate::DEFAULT_FEEDRATE,
            accept_moves: true,
            auto_complete: true,
            scheduled: 0,
            completed: 0,
            geometry: MachineGeometry::Cartesian,
            print_radius: 100.0,
            homed_height: 200.0,
            speed_factor: 1.0,
            extrusion_factors: [1.0; DRIVES - AXES],
            simulating: false,
            sim_time: 0.0,
            probe_points: [[0.0; 3]; 16],
            probe_errors: [false; 16],
            num_probe_points: 4,
            pause_file_pos: NO_FILE_POSITION,
            pause_skipped_moves: 0,
            live_movement: false,
            idle_timeout: 30.0,
        }
    }

    /// Mark every scheduled move as completed (the "ISR" catching up).
    pub fn complete_all(&mut self) {
        self.completed = self.scheduled;
    }

    /// Complete the next `n` scheduled moves.
    pub fn complete(&mut self, n: u32) {
        self.completed = (self.completed + n).min(self.scheduled);
    }

    pub fn last_move(&self) -> Option<&RawMove> {
        self.moves.last()
    }

    /// True if the given probe point was recorded as failed.
    pub fn probe_error(&self, index: usize) -> bool {
        self.probe_errors.get(index).copied().unwrap_or(false)
    }
}

impl Default for SimPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MovePlanner for SimPlanner {
    fn try_queue_move(&mut self, m: &RawMove) -> bool {
        if !self.accept_moves {
            return false;
        }
        self.moves.push(*m);
        self.scheduled += 1;
        self.feed_rate = m.feed_rate;
        if self.auto_complete {
            self.completed = self.scheduled;
            self.position[..AXES].copy_from_slice(&m.coords[..AXES]);
        }
        true
    }

    fn all_moves_finished(&self) -> bool {
        self.completed == self.scheduled
    }

    fn resume_moving(&mut self) {}

    fn current_user_position(&self, coords: &mut [f32; DRIVES], _move_type: u8) {
        *coords = self.position;
    }

    fn set_positions(&mut self, coords: &[f32; DRIVES]) {
        self.position = *coords;
    }

    fn set_feed_rate(&mut self, feed_rate: f32) {
        self.feed_rate = feed_rate;
    }

    fn pause_print(&mut self, restore: &mut RestorePoint) -> (FilePosition, u32) {
        restore.coords = self.position;
        restore.feed_rate = self.feed_rate;
        (self.pause_file_pos, self.pause_skipped_moves)
    }

    fn no_live_movement(&self) -> bool {
        !self.live_movement
    }

    fn scheduled_moves_count(&self) -> u32 {
        self.scheduled
    }

    fn completed_moves_count(&self) -> u32 {
        self.completed
    }

    fn geometry(&self) -> MachineGeometry {
        self.geometry
    }

    fn set_geometry(&mut self, g: MachineGeometry) {
        self.geometry = g;
    }

    fn print_radius_squared(&self) -> f32 {
        self.print_radius * self.print_radius
    }

    fn homed_height(&self) -> f32 {
        self.homed_height
    }

    fn set_delta_parameters(
        &mut self,
        _diagonal: Option<f32>,
        _radius: Option<f32>,
        print_radius: Option<f32>,
        homed_height: Option<f32>,
    ) {
        if let Some(r) = print_radius {
            self.print_radius = r;
        }
        if let Some(h) = homed_height {
            self.homed_height = h;
        }
    }

    fn emergency_stop(&mut self) {
        self.completed = self.scheduled;
        self.live_movement = false;
    }

    fn simulate(&mut self, on: bool) {
        self.simulating = on;
        if on {
            self.sim_time = 0.0;
        }
    }

    fn simulation_time(&self) -> f32 {
        self.sim_time
    }

    fn set_speed_factor(&mut self, factor: f32) {
        self.speed_factor = factor;
    }

    fn speed_factor(&self) -> f32 {
        self.speed_factor
    }

    fn set_extrusion_factor(&mut self, extruder: usize, factor: f32) {
        if extruder < self.extrusion_factors.len() {
            self.extrusion_factors[extruder] = factor;
        }
    }

    fn extrusion_factor(&self, extruder: usize) -> f32 {
        self.extrusion_factors.get(extruder).copied().unwrap_or(1.0)
    }

    fn set_idle_timeout(&mut self, seconds: f32) {
        self.idle_timeout = seconds;
    }

    fn set_identity_transform(&mut self) {}

    fn set_probe_point(&mut self, index: usize, axis: usize, value: f32) {
        if index < self.probe_points.len() && axis < 3 {
            self.probe_points[index][axis] = value;
            self.probe_errors[index] = false;
        }
    }

    fn set_z_probe_point_error(&mut self, index: usize) {
        if index < self.probe_errors.len() {
            self.probe_errors[index] = true;
        }
    }

    fn probe_point(&self, index: usize, axis: usize) -> f32 {
        self.probe_points[index][axis]
    }

    fn num_probe_points(&self) -> usize {
        self.num_probe_points
    }

    fn finish_bed_probing(&mut self, _s_param: i32) -> String {
        "Bed equation fits points\n".to_string()
    }
}

// ---------------------------------------------------------------------------
// Heat

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaterMode {
    Off,
    Active,
    Standby,
}

pub struct SimHeat {
    active: [f32; HEATERS],
    standby: [f32; HEATERS],
    current: [f32; HEATERS],
    mode: [HeaterMode; HEATERS],
    fault: [bool; HEATERS],
    pub max_temp: [f32; HEATERS],
    pid: [(f32, f32, f32); HEATERS],
    /// When true, every heater reads as settled at its target.
    pub settled: bool,
    pub emergency_stopped: bool,
}

impl SimHeat {
    pub fn new() -> Self {
        SimHeat {
            active: [0.0; HEATERS],
            standby: [0.0; HEATERS],
            current: [21.0; HEATERS],
            mode: [HeaterMode::Off; HEATERS],
            fault: [false; HEATERS],
            max_temp: [300.0; HEATERS],
            pid: [(10.0, 0.1, 100.0); HEATERS],
            settled: true,
            emergency_stopped: false,
        }
    }

    /// The temperature the heater is currently regulating towards.
    pub fn target(&self, heater: usize) -> f32 {
        match self.mode[heater] {
            HeaterMode::Off => 0.0,
            HeaterMode::Active => self.active[heater],
            HeaterMode::Standby => self.standby[heater],
        }
    }

    /// Jump every heater to its target (for wait-for-temperature tests).
    pub fn settle(&mut self) {
        for h in 0..HEATERS {
            self.current[h] = self.target(h);
        }
        self.settled = true;
    }

    pub fn set_current(&mut self, heater: usize, t: f32) {
        self.current[heater] = t;
    }

    pub fn set_fault(&mut self, heater: usize) {
        self.fault[heater] = true;
    }
}

impl Default for SimHeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heat for SimHeat {
    fn set_active_temperature(&mut self, heater: usize, t: f32) {
        if heater < HEATERS {
            self.active[heater] = t;
        }
    }

    fn active_temperature(&self, heater: usize) -> f32 {
        self.active.get(heater).copied().unwrap_or(0.0)
    }

    fn set_standby_temperature(&mut self, heater: usize, t: f32) {
        if heater < HEATERS {
            self.standby[heater] = t;
        }
    }

    fn standby_temperature(&self, heater: usize) -> f32 {
        self.standby.get(heater).copied().unwrap_or(0.0)
    }

    fn activate(&mut self, heater: usize) {
        if heater < HEATERS {
            self.mode[heater] = HeaterMode::Active;
        }
    }

    fn standby(&mut self, heater: usize) {
        if heater < HEATERS {
            self.mode[heater] = HeaterMode::Standby;
        }
    }

    fn switch_off(&mut self, heater: usize) {
        if heater < HEATERS {
            self.mode[heater] = HeaterMode::Off;
        }
    }

    fn switch_off_all(&mut self) {
        self.mode = [HeaterMode::Off; HEATERS];
    }

    fn get_temperature(&self, heater: usize) -> f32 {
        self.current.get(heater).copied().unwrap_or(0.0)
    }

    fn at_set_temperature(&self, heater: usize, _wait_when_cooling: bool) -> bool {
        self.settled || (self.current[heater] - self.target(heater)).abs() < 2.5
    }

    fn all_heaters_at_set_temperatures(&self, wait_when_cooling: bool) -> bool {
        (0..HEATERS).all(|h| self.at_set_temperature(h, wait_when_cooling))
    }

    fn bed_heater(&self) -> Option<usize> {
        Some(0)
    }

    fn chamber_heater(&self) -> Option<usize> {
        None
    }

    fn heater_fault(&self, heater: usize) -> bool {
        self.fault.get(heater).copied().unwrap_or(false)
    }

    fn clear_fault(&mut self, heater: usize) {
        if heater < HEATERS {
            self.fault[heater] = false;
        }
    }

    fn set_max_temperature(&mut self, heater: usize, t: f32) {
        if heater < HEATERS {
            self.max_temp[heater] = t;
        }
    }

    fn set_pid_parameters(&mut self, heater: usize, kp: f32, ki: f32, kd: f32) {
        if heater < HEATERS {
            self.pid[heater] = (kp, ki, kd);
        }
    }

    fn pid_parameters(&self, heater: usize) -> (f32, f32, f32) {
        self.pid.get(heater).copied().unwrap_or((0.0, 0.0, 0.0))
    }

    fn emergency_switch_off_all(&mut self) {
        self.switch_off_all();
        self.active = [0.0; HEATERS];
        self.standby = [0.0; HEATERS];
        self.emergency_stopped = true;
    }
}

// ---------------------------------------------------------------------------
// Platform

struct OpenFile {
    path: String,
    pos: usize,
    write: bool,
}

pub struct SimPlatform {
    files: HashMap<String, Vec<u8>>,
    open: HashMap<FileHandle, OpenFile>,
    next_handle: FileHandle,
    now_us: u64,
    pub endstops: u16,
    pub z_probe: EndStopHit,
    pub fans: [f32; crate::FANS],
    pub drives_enabled: [bool; DRIVES],
    pub drives_idle: bool,
    steps_per_unit: [f32; DRIVES],
    axis_min: [f32; AXES],
    axis_max: [f32; AXES],
    accelerations: [f32; DRIVES],
    feedrates: [f32; DRIVES],
    instant_dvs: [f32; DRIVES],
    motor_currents: [f32; DRIVES],
    microstepping: [(u32, bool); DRIVES],
    pub atx_power: bool,
    pub machine_name: String,
    pub ip: [u8; 4],
    pub netmask: [u8; 4],
    pub gateway: [u8; 4],
    pub mac: [u8; 6],
    pub network_enabled: bool,
    pub servo_positions: HashMap<usize, f32>,
    pub beeps: Vec<(u32, u32)>,
    pub reset_requested: bool,
    pub firmware_update_requested: bool,
    heat_sample_time: f32,
    z_probe_type: u8,
}

impl SimPlatform {
    pub fn new() -> Self {
        SimPlatform {
            files: HashMap::new(),
            open: HashMap::new(),
            next_handle: 1,
            now_us: 0,
            endstops: 0,
            z_probe: EndStopHit::NoStop,
            fans: [0.0; crate::FANS],
            drives_enabled: [true; DRIVES],
            drives_idle: false,
            steps_per_unit: [80.0; DRIVES],
            axis_min: [0.0; AXES],
            axis_max: [200.0; AXES],
            accelerations: [500.0; DRIVES],
            feedrates: [100.0; DRIVES],
            instant_dvs: [15.0; DRIVES],
            motor_currents: [800.0; DRIVES],
            microstepping: [(16, true); DRIVES],
            atx_power: false,
            machine_name: "My RepRap".to_string(),
            ip: [0, 0, 0, 0],
            netmask: [255, 255, 255, 0],
            gateway: [0, 0, 0, 0],
            mac: [0; 6],
            network_enabled: false,
            servo_positions: HashMap::new(),
            beeps: Vec::new(),
            reset_requested: false,
            firmware_update_requested: false,
            heat_sample_time: 0.5,
            z_probe_type: 1,
        }
    }

    fn path(directory: &str, name: &str) -> String {
        if name.contains(":/") || directory.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", directory.trim_end_matches('/'), name)
        }
    }

    /// Seed a file into the simulated card.
    pub fn add_file(&mut self, directory: &str, name: &str, contents: &str) {
        self.files
            .insert(Self::path(directory, name), contents.as_bytes().to_vec());
    }

    pub fn file_contents(&self, directory: &str, name: &str) -> Option<String> {
        self.files
            .get(&Self::path(directory, name))
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    pub fn advance_time(&mut self, us: u64) {
        self.now_us += us;
    }

    pub fn open_file_count(&self) -> usize {
        self.open.len()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn open_file(&mut self, directory: &str, name: &str, write: bool) -> Option<FileHandle> {
        let path = Self::path(directory, name);
        if write {
            self.files.insert(path.clone(), Vec::new());
        } else if !self.files.contains_key(&path) {
            return None;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open.insert(handle, OpenFile { path, pos: 0, write });
        Some(handle)
    }

    fn file_exists(&self, directory: &str, name: &str) -> bool {
        self.files.contains_key(&Self::path(directory, name))
    }

    fn delete_file(&mut self, directory: &str, name: &str) -> bool {
        self.files.remove(&Self::path(directory, name)).is_some()
    }

    fn read_byte(&mut self, f: FileHandle) -> Option<u8> {
        let of = self.open.get_mut(&f)?;
        let data = self.files.get(&of.path)?;
        let b = data.get(of.pos).copied()?;
        of.pos += 1;
        Some(b)
    }

    fn read_block(&mut self, f: FileHandle, buf: &mut [u8]) -> usize {
        let of = match self.open.get_mut(&f) {
            Some(of) => of,
            None => return 0,
        };
        let data = match self.files.get(&of.path) {
            Some(d) => d,
            None => return 0,
        };
        let n = buf.len().min(data.len().saturating_sub(of.pos));
        buf[..n].copy_from_slice(&data[of.pos..of.pos + n]);
        of.pos += n;
        n
    }

    fn write_bytes(&mut self, f: FileHandle, data: &[u8]) -> bool {
        let of = match self.open.get_mut(&f) {
            Some(of) if of.write => of,
            _ => return false,
        };
        if let Some(contents) = self.files.get_mut(&of.path) {
            contents.extend_from_slice(data);
            of.pos = contents.len();
            true
        } else {
            false
        }
    }

    fn seek(&mut self, f: FileHandle, pos: FilePosition) -> bool {
        let of = match self.open.get_mut(&f) {
            Some(of) => of,
            None => return false,
        };
        let len = self.files.get(&of.path).map(|d| d.len()).unwrap_or(0);
        if (pos as usize) <= len {
            of.pos = pos as usize;
            true
        } else {
            false
        }
    }

    fn position(&self, f: FileHandle) -> FilePosition {
        self.open.get(&f).map(|of| of.pos as FilePosition).unwrap_or(0)
    }

    fn length(&self, f: FileHandle) -> FilePosition {
        self.open
            .get(&f)
            .and_then(|of| self.files.get(&of.path))
            .map(|d| d.len() as FilePosition)
            .unwrap_or(0)
    }

    fn close_file(&mut self, f: FileHandle) {
        self.open.remove(&f);
    }

    fn file_list(&self, directory: &str) -> Vec<String> {
        let prefix = format!("{}/", directory.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(|n| n.to_string()))
            .collect();
        names.sort();
        names
    }

    fn monotonic_us(&self) -> u64 {
        self.now_us
    }

    fn endstop_states(&self) -> u16 {
        self.endstops
    }

    fn endstop_status(&self, axis: usize) -> EndStopHit {
        if (self.endstops & (1 << axis)) != 0 {
            EndStopHit::LowHit
        } else {
            EndStopHit::NoStop
        }
    }

    fn z_probe_result(&self) -> EndStopHit {
        self.z_probe
    }

    fn z_probe_value(&self) -> i32 {
        match self.z_probe {
            EndStopHit::LowHit => 1000,
            _ => 0,
        }
    }

    fn z_probe_type(&self) -> u8 {
        self.z_probe_type
    }

    fn set_z_probe_type(&mut self, t: u8) {
        self.z_probe_type = t;
    }

    fn z_probe_dive_height(&self) -> f32 {
        5.0
    }

    fn z_probe_stop_height(&self) -> f32 {
        0.7
    }

    fn z_probe_travel_speed(&self) -> f32 {
        100.0
    }

    fn z_probe_speed(&self) -> f32 {
        2.0
    }

    fn disable_drive(&mut self, drive: usize) {
        if drive < DRIVES {
            self.drives_enabled[drive] = false;
        }
    }

    fn enable_drive(&mut self, drive: usize) {
        if drive < DRIVES {
            self.drives_enabled[drive] = true;
        }
    }

    fn set_drives_idle(&mut self) {
        self.drives_idle = true;
    }

    fn set_drive_steps_per_unit(&mut self, drive: usize, v: f32) {
        if drive < DRIVES {
            self.steps_per_unit[drive] = v;
        }
    }

    fn drive_steps_per_unit(&self, drive: usize) -> f32 {
        self.steps_per_unit.get(drive).copied().unwrap_or(0.0)
    }

    fn set_direction_value(&mut self, _drive: usize, _forwards: bool) {}

    fn set_motor_current(&mut self, drive: usize, ma: f32) {
        if drive < DRIVES {
            self.motor_currents[drive] = ma;
        }
    }

    fn motor_current(&self, drive: usize) -> f32 {
        self.motor_currents.get(drive).copied().unwrap_or(0.0)
    }

    fn set_microstepping(&mut self, drive: usize, micro: u32, interpolate: bool) -> bool {
        if drive < DRIVES {
            self.microstepping[drive] = (micro, interpolate);
            true
        } else {
            false
        }
    }

    fn microstepping(&self, drive: usize) -> (u32, bool) {
        self.microstepping.get(drive).copied().unwrap_or((16, false))
    }

    fn axis_minimum(&self, axis: usize) -> f32 {
        self.axis_min.get(axis).copied().unwrap_or(0.0)
    }

    fn axis_maximum(&self, axis: usize) -> f32 {
        self.axis_max.get(axis).copied().unwrap_or(0.0)
    }

    fn set_axis_minimum(&mut self, axis: usize, v: f32) {
        if axis < AXES {
            self.axis_min[axis] = v;
        }
    }

    fn set_axis_maximum(&mut self, axis: usize, v: f32) {
        if axis < AXES {
            self.axis_max[axis] = v;
        }
    }

    fn acceleration(&self, drive: usize) -> f32 {
        self.accelerations.get(drive).copied().unwrap_or(0.0)
    }

    fn set_acceleration(&mut self, drive: usize, v: f32) {
        if drive < DRIVES {
            self.accelerations[drive] = v;
        }
    }

    fn max_feedrate(&self, drive: usize) -> f32 {
        self.feedrates.get(drive).copied().unwrap_or(0.0)
    }

    fn set_max_feedrate(&mut self, drive: usize, v: f32) {
        if drive < DRIVES {
            self.feedrates[drive] = v;
        }
    }

    fn instant_dv(&self, drive: usize) -> f32 {
        self.instant_dvs.get(drive).copied().unwrap_or(0.0)
    }

    fn set_instant_dv(&mut self, drive: usize, v: f32) {
        if drive < DRIVES {
            self.instant_dvs[drive] = v;
        }
    }

    fn set_fan_value(&mut self, fan: usize, value: f32) {
        if fan < crate::FANS {
            self.fans[fan] = value;
        }
    }

    fn fan_value(&self, fan: usize) -> f32 {
        self.fans.get(fan).copied().unwrap_or(0.0)
    }

    fn set_servo_position(&mut self, servo: usize, angle: f32) -> bool {
        self.servo_positions.insert(servo, angle);
        true
    }

    fn set_atx_power(&mut self, on: bool) {
        self.atx_power = on;
    }

    fn beep(&mut self, frequency: u32, ms: u32) {
        self.beeps.push((frequency, ms));
    }

    fn set_output_pin(&mut self, _pin: u32, _level: bool) -> bool {
        true
    }

    fn set_ip_address(&mut self, ip: [u8; 4]) {
        self.ip = ip;
    }

    fn set_net_mask(&mut self, mask: [u8; 4]) {
        self.netmask = mask;
    }

    fn set_gateway(&mut self, gw: [u8; 4]) {
        self.gateway = gw;
    }

    fn set_mac_address(&mut self, mac: [u8; 6]) {
        self.mac = mac;
    }

    fn set_machine_name(&mut self, name: &str) {
        self.machine_name = name.to_string();
    }

    fn machine_name(&self) -> String {
        self.machine_name.clone()
    }

    fn set_password(&mut self, _password: &str) {}

    fn enable_network(&mut self, on: bool) {
        self.network_enabled = on;
    }

    fn firmware_name(&self) -> &'static str {
        "RepRapFirmware"
    }

    fn firmware_version(&self) -> &'static str {
        "1.09"
    }

    fn electronics(&self) -> &'static str {
        "Duet"
    }

    fn software_reset(&mut self) {
        self.reset_requested = true;
    }

    fn update_firmware(&mut self) {
        self.firmware_update_requested = true;
    }

    fn write_nv_data(&mut self) {}

    fn read_nv_data(&mut self) {}

    fn set_heat_sample_time(&mut self, seconds: f32) {
        self.heat_sample_time = seconds;
    }

    fn heat_sample_time(&self) -> f32 {
        self.heat_sample_time
    }
}

// ---------------------------------------------------------------------------
// Print monitor

pub struct SimPrintMonitor {
    pub printing: bool,
    pub current_file: Option<String>,
    pub prints_started: u32,
    pub prints_stopped: u32,
}

impl SimPrintMonitor {
    pub fn new() -> Self {
        SimPrintMonitor {
            printing: false,
            current_file: None,
            prints_started: 0,
            prints_stopped: 0,
        }
    }
}

impl Default for SimPrintMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PrintMonitor for SimPrintMonitor {
    fn starting_print(&mut self, filename: &str) {
        self.current_file = Some(filename.to_string());
    }

    fn started_print(&mut self) {
        self.printing = true;
        self.prints_started += 1;
    }

    fn stopped_print(&mut self) {
        self.printing = false;
        self.prints_stopped += 1;
    }

    fn is_printing(&self) -> bool {
        self.printing
    }

    fn file_info_response(&self, filename: Option<&str>) -> String {
        match filename.or(self.current_file.as_deref()) {
            Some(name) => format!("{{\"err\":0,\"fileName\":\"{}\"}}", name),
            None => "{\"err\":1}".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reply capture

pub struct CaptureSink {
    mt: MessageType,
    lines: Rc<RefCell<Vec<String>>>,
}

impl CaptureSink {
    /// A sink for `mt` plus a handle to everything it receives.
    pub fn new(mt: MessageType) -> (CaptureSink, Rc<RefCell<Vec<String>>>) {
        let lines = Rc::new(RefCell::new(Vec::new()));
        (CaptureSink { mt, lines: lines.clone() }, lines)
    }
}

impl ReplySink for CaptureSink {
    fn wants(&self, mt: MessageType) -> bool {
        mt == self.mt
    }

    fn write_string(&mut self, s: &str) {
        self.lines.borrow_mut().push(s.to_string());
    }

    fn attach_buffer_chain(&mut self, pool: &mut OutputBufferPool, chain: BufferIndex) {
        let text = pool.collect(chain);
        self.write_string(&text);
        pool.release_all(chain);
    }
}
