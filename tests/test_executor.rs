// End-to-end executor behaviour: modal state, moves, replies, deferral,
// emergency stop. Commands are fed through the USB channel exactly as a
// host would send them.

mod common;

use common::{with_checksum, Rig};
use reprap_host_rust::core_traits::Heat;
use reprap_host_rust::gcode_buffer::CodeSource;
use reprap_host_rust::reply::Compatibility;

#[test]
fn homed_cartesian_move_and_position_report() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_many(&["G21", "G90", "G1 X10 Y20 F1200"]);

    assert_eq!(rig.planner.moves.len(), 1);
    let mv = rig.planner.moves[0];
    assert_eq!(mv.coords[0], 10.0);
    assert_eq!(mv.coords[1], 20.0);
    assert_eq!(mv.coords[2], 0.0); // current Z kept
    assert!((mv.feed_rate - 20.0).abs() < 1e-4); // 1200 mm/min = 20 mm/s

    rig.run_usb("M114");
    assert!(rig.host_text().contains("X: 10.00 Y: 20.00"));
}

#[test]
fn relative_and_absolute_extrusion_bookkeeping() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.define_tool0();

    rig.run_many(&["M83", "G1 E1.5", "G1 E2.0"]);
    let deltas: Vec<f32> = rig.planner.moves.iter().map(|m| m.coords[3]).collect();
    assert_eq!(deltas, vec![1.5, 2.0]);
    assert_eq!(rig.gcodes.raw_extruder_position(0), 0.0);

    rig.run_many(&["M82", "G92 E0", "G1 E5"]);
    let last = rig.planner.last_move().unwrap();
    assert_eq!(last.coords[3], 5.0);
    assert_eq!(rig.gcodes.raw_extruder_position(0), 5.0);
}

#[test]
fn relative_move_round_trip() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_many(&["G1 X7", "G91", "G1 X5", "G90"]);
    assert_eq!(rig.planner.position[0], 12.0);
    // Back in absolute mode the same words mean a position again.
    rig.run_usb("G1 X5");
    assert_eq!(rig.planner.position[0], 5.0);
}

#[test]
fn soft_limits_clamp_homed_axes_only() {
    let mut rig = Rig::new();
    // Not homed: no clamping.
    rig.run_usb("G91");
    rig.run_usb("G1 X-5");
    assert_eq!(rig.planner.last_move().unwrap().coords[0], -5.0);

    rig.run_usb("G90");
    rig.home_via_g92();
    rig.run_usb("G1 X-5");
    assert_eq!(rig.planner.last_move().unwrap().coords[0], 0.0);
    rig.run_usb("G1 X500");
    assert_eq!(rig.planner.last_move().unwrap().coords[0], 200.0);
    // M564 S0 lifts the fence.
    rig.run_usb("M564 S0");
    rig.run_usb("G1 X500");
    assert_eq!(rig.planner.last_move().unwrap().coords[0], 500.0);
}

#[test]
fn speed_factor_scales_moves_but_not_the_stored_feed() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_many(&["M220 S50", "G1 X10 F1200"]);
    let mv = rig.planner.last_move().unwrap();
    assert!((mv.feed_rate - 10.0).abs() < 1e-4); // half of 20 mm/s

    // Restoring the factor restores the modal rate unchanged.
    rig.run_many(&["M220 S100", "G1 X20"]);
    let mv = rig.planner.last_move().unwrap();
    assert!((mv.feed_rate - 20.0).abs() < 1e-4);
}

#[test]
fn extrusion_factor_scales_deltas_but_not_raw_positions() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.define_tool0();
    rig.run_many(&["M82", "G92 E0", "M221 S50", "G1 E10"]);
    let mv = rig.planner.last_move().unwrap();
    assert_eq!(mv.coords[3], 5.0);
    // The raw position still tracks the commanded value.
    assert_eq!(rig.gcodes.raw_extruder_position(0), 10.0);
}

#[test]
fn valid_checksum_line_parses_like_a_plain_one() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.gcodes.set_comms_properties(CodeSource::Usb, 1);
    rig.gcodes.push_bytes(CodeSource::Usb, with_checksum(0, "G1 X10").as_bytes());
    rig.spin_n(16);
    assert_eq!(rig.planner.last_move().unwrap().coords[0], 10.0);
}

#[test]
fn bad_checksum_requests_resend() {
    let mut rig = Rig::new();
    rig.gcodes.set_comms_properties(CodeSource::Usb, 1);
    rig.gcodes.push_bytes(CodeSource::Usb, b"N0 G28*99\n");
    rig.spin_n(16);
    assert!(rig.host_text().contains("rs N0"));
    assert!(rig.planner.moves.is_empty());
}

#[test]
fn marlin_emulation_acknowledges_with_ok() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.gcodes.set_emulation(CodeSource::Usb, Compatibility::Marlin);
    rig.clear_host();
    rig.run_usb("G92 X0");
    assert_eq!(rig.host_text(), "ok\n");
}

#[test]
fn fan_code_is_deferred_until_its_move_completes() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.planner.auto_complete = false;

    rig.platform.add_file(
        "0:/gcodes",
        "part.gcode",
        "G1 X10 F1200\nM106 S128\nG1 X20\n",
    );
    rig.run_usb("M32 part.gcode");
    rig.spin_n(32);

    // Both moves are scheduled, the fan change is parked in the queue.
    assert_eq!(rig.planner.moves.len(), 2);
    assert_eq!(rig.platform.fans[0], 0.0);

    // Fan changes in sync with the first move completing.
    rig.planner.complete(1);
    rig.spin_n(8);
    assert!((rig.platform.fans[0] - 128.0 / 255.0).abs() < 1e-4);
}

#[test]
fn file_print_runs_to_completion() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.platform.add_file("0:/gcodes", "part.gcode", "G1 X1 F600\nG1 X2\n");
    rig.run_usb("M32 part.gcode");
    rig.spin_n(64);
    assert_eq!(rig.planner.moves.len(), 2);
    assert!(!rig.monitor.printing);
    assert_eq!(rig.monitor.prints_started, 1);
    assert_eq!(rig.monitor.prints_stopped, 1);
    assert_eq!(rig.platform.open_file_count(), 0);
}

#[test]
fn emergency_stop_halts_everything_until_reset() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.define_tool0();
    rig.run_usb("M104 S200");
    assert!(rig.heat.target(1) > 0.0);

    rig.run_usb("M112");
    assert!(rig.host_text().contains("Emergency Stop!"));
    assert!(rig.heat.emergency_stopped);
    assert_eq!(rig.heat.target(1), 0.0);
    assert!(rig.platform.drives_enabled.iter().all(|e| !e));
    assert!(!rig.gcodes.axis_is_homed(0));

    // Every command except M999 is refused now.
    rig.clear_host();
    rig.run_usb("G28");
    assert!(rig.host_text().contains("Emergency Stop!"));
    assert!(rig.planner.moves.is_empty());

    // M999 waits half a second, then asks for the reset.
    rig.run_usb("M999");
    assert!(!rig.platform.reset_requested);
    rig.platform.advance_time(600_000);
    rig.spin_n(8);
    assert!(rig.platform.reset_requested);
}

#[test]
fn dwell_uses_the_monotonic_clock() {
    let mut rig = Rig::new();
    rig.run_usb("G4 P250");
    assert!(!rig.usb_idle());
    rig.platform.advance_time(200_000);
    rig.spin_n(4);
    assert!(!rig.usb_idle());
    rig.platform.advance_time(100_000);
    rig.spin_n(4);
    assert!(rig.usb_idle());
}

#[test]
fn stack_push_at_limit_reports_error_without_growing() {
    let mut rig = Rig::new();
    for _ in 0..4 {
        rig.run_usb("M120");
    }
    assert_eq!(rig.gcodes.stack_depth(CodeSource::Usb), 5);
    rig.clear_host();
    rig.run_usb("M120");
    assert!(rig.host_text().contains("stack overflow"));
    assert_eq!(rig.gcodes.stack_depth(CodeSource::Usb), 5);
}

#[test]
fn push_pop_restores_modal_state() {
    let mut rig = Rig::new();
    rig.run_many(&["G91", "M120", "G90", "M121"]);
    // The pop brings the relative mode back.
    rig.home_via_g92();
    rig.run_usb("G1 X5");
    rig.run_usb("G1 X5");
    assert_eq!(rig.planner.position[0], 10.0);
}

#[test]
fn macro_call_runs_nested_and_restores_depth() {
    let mut rig = Rig::new();
    rig.platform.add_file("0:/sys", "inner.g", "M117 from inner\n");
    rig.platform.add_file("0:/macros", "outer.g", "M98 Pinner.g\nG21\n");
    rig.run_usb("M98 Pouter.g");
    rig.spin_n(128);
    assert_eq!(rig.gcodes.display_message(), "from inner");
    assert_eq!(rig.gcodes.stack_depth(CodeSource::Usb), 1);
    assert!(rig.usb_idle());
    assert_eq!(rig.platform.open_file_count(), 0);
}

#[test]
fn missing_macro_is_an_error_for_m98() {
    let mut rig = Rig::new();
    rig.run_usb("M98 Pnosuch.g");
    assert!(rig.host_text().contains("not found"));
    assert_eq!(rig.gcodes.stack_depth(CodeSource::Usb), 1);
}

#[test]
fn simulation_honours_the_whitelist_and_restores_position() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_usb("G1 X15 F1200");
    rig.run_usb("M37 S1");
    assert!(rig.gcodes.simulating());

    // Fan changes are suppressed while simulating...
    rig.run_usb("M106 S255");
    assert_eq!(rig.platform.fans[0], 0.0);
    // ...but moves still advance the simulated machine.
    rig.run_usb("G1 X99");
    assert_eq!(rig.planner.position[0], 99.0);

    rig.run_usb("M37 S0");
    assert!(!rig.gcodes.simulating());
    assert_eq!(rig.planner.position[0], 15.0);
}

#[test]
fn sha1_hash_is_computed_block_by_block() {
    let mut rig = Rig::new();
    rig.platform.add_file("0:/gcodes", "hash.g", "hello world");
    rig.run_usb("M38 hash.g");
    rig.spin_n(32);
    assert!(rig
        .host_text()
        .contains("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));
    assert_eq!(rig.platform.open_file_count(), 0);
}

#[test]
fn file_listing_follows_the_emulation_envelope() {
    let mut rig = Rig::new();
    rig.platform.add_file("0:/gcodes", "a.gcode", "");
    rig.platform.add_file("0:/gcodes", "b.gcode", "");
    rig.run_usb("M20");
    let text = rig.host_text();
    assert!(text.contains("GCode files:"));
    assert!(text.contains("\"a.gcode\""));

    rig.clear_host();
    rig.gcodes.set_emulation(CodeSource::Usb, Compatibility::Marlin);
    rig.run_usb("M20");
    let text = rig.host_text();
    assert!(text.starts_with("Begin file list\n"));
    assert!(text.contains("a.gcode\n"));
    assert!(text.trim_end().ends_with("ok"));
}

#[test]
fn display_message_and_identity() {
    let mut rig = Rig::new();
    rig.run_usb("M117 Hello there");
    assert_eq!(rig.gcodes.display_message(), "Hello there");

    rig.run_usb("M115");
    assert!(rig.host_text().contains("FIRMWARE_NAME: RepRapFirmware"));
}

#[test]
fn status_snapshot_reports_state_and_temperatures() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.define_tool0();
    rig.run_usb("M104 S210");
    rig.run_usb("M408");
    let text = rig.host_text();
    assert!(text.contains("\"status\":\"I\""));
    assert!(text.contains("\"tool\":0"));

    let json_line = rig
        .host
        .borrow()
        .iter()
        .find(|l| l.contains("\"status\""))
        .cloned()
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(json_line.trim()).unwrap();
    assert_eq!(parsed["active"][1], 210.0);
    assert_eq!(parsed["homed"][0], 1);
}

#[test]
fn upload_copies_lines_until_m29() {
    let mut rig = Rig::new();
    rig.run_usb("M28 upload.g");
    assert!(rig.host_text().contains("Writing to file: upload.g"));
    rig.run_usb("G1 X1");
    rig.run_usb("G1 X2");
    rig.run_usb("M29");
    assert_eq!(
        rig.platform.file_contents("0:/gcodes", "upload.g").unwrap(),
        "G1 X1\nG1 X2\n"
    );
    // The uploaded lines never reached the planner.
    assert!(rig.planner.moves.is_empty());
}

#[test]
fn heater_wait_blocks_until_temperature_reached() {
    let mut rig = Rig::new();
    rig.define_tool0();
    rig.heat.settled = false;
    rig.heat.set_current(1, 20.0);

    rig.run_usb("M109 S200");
    assert!(!rig.usb_idle());
    rig.heat.settle();
    rig.spin_n(8);
    assert!(rig.usb_idle());
    // Only the active temperature was touched.
    assert_eq!(rig.heat.active_temperature(1), 200.0);
    assert_eq!(rig.heat.standby_temperature(1), 0.0);
}
