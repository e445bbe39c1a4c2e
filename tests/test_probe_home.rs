// Homing, Z probing, tool change sequencing and trigger handling.

mod common;

use common::Rig;
use reprap_host_rust::core_traits::{EndStopHit, MachineGeometry, Z_PROBE_ACTIVE};
use reprap_host_rust::gcode_buffer::CodeSource;

#[test]
fn g28_uses_homeall_when_present() {
    let mut rig = Rig::new();
    rig.platform.add_file(
        "0:/sys",
        "homeall.g",
        "G91\nG1 S1 X-240 Y-240 Z-240 F1800\nG90\nG92 X0 Y0 Z0\n",
    );
    rig.run_usb("G28");
    rig.spin_n(64);

    assert!(rig.gcodes.all_axes_are_homed());
    assert!(rig.usb_idle());
    // The homing move checked all three axis endstops.
    let homing_move = rig.planner.moves.iter().find(|m| m.move_type == 1).unwrap();
    assert_eq!(homing_move.endstops_to_check, 0b111);
    assert_eq!(rig.gcodes.stack_depth(CodeSource::Usb), 1);
}

#[test]
fn g28_falls_back_to_axis_files_in_order() {
    let mut rig = Rig::new();
    rig.platform
        .add_file("0:/sys", "homex.g", "G91\nG1 S1 X-240 F1800\nG90\nG92 X0\n");
    rig.platform
        .add_file("0:/sys", "homey.g", "G91\nG1 S1 Y-240 F1800\nG90\nG92 Y0\n");
    rig.platform
        .add_file("0:/sys", "homez.g", "G91\nG1 S1 Z-240 F600\nG90\nG92 Z0\n");
    rig.run_usb("G28");
    rig.spin_n(200);

    assert!(rig.gcodes.all_axes_are_homed());
    let endstop_masks: Vec<u16> = rig
        .planner
        .moves
        .iter()
        .filter(|m| m.move_type == 1)
        .map(|m| m.endstops_to_check)
        .collect();
    assert_eq!(endstop_masks, vec![0b001, 0b010, 0b100]); // X, then Y, Z last
}

#[test]
fn g28_with_letters_homes_only_those_axes() {
    let mut rig = Rig::new();
    rig.platform
        .add_file("0:/sys", "homex.g", "G91\nG1 S1 X-240 F1800\nG90\nG92 X0\n");
    rig.run_usb("G28 X");
    rig.spin_n(64);
    assert!(rig.gcodes.axis_is_homed(0));
    assert!(!rig.gcodes.axis_is_homed(1));
    assert!(!rig.gcodes.axis_is_homed(2));
}

#[test]
fn missing_homing_file_reports_an_error() {
    let mut rig = Rig::new();
    rig.run_usb("G28 Y");
    rig.spin_n(32);
    assert!(rig.host_text().contains("homey.g not found"));
    assert!(rig.usb_idle());
}

#[test]
fn g30_adopts_probe_height_as_z_datum() {
    let mut rig = Rig::new();
    rig.run_usb("G92 X0 Y0"); // X and Y homed, Z not
    rig.gcodes.push_bytes(CodeSource::Usb, b"G30\n");

    for _ in 0..100 {
        rig.spin();
        // Trip the probe once the dive move is under way.
        if rig.platform.z_probe == EndStopHit::NoStop {
            if let Some(mv) = rig.planner.last_move() {
                if mv.endstops_to_check & Z_PROBE_ACTIVE != 0 {
                    rig.platform.z_probe = EndStopHit::LowHit;
                }
            }
        }
        if rig.usb_idle() {
            break;
        }
    }

    assert!(rig.usb_idle());
    assert!(rig.gcodes.axis_is_homed(2));
    // The head stopped at the probe stop height.
    assert!((rig.planner.position[2] - 0.7).abs() < 1e-4);
}

#[test]
fn g30_with_probe_already_triggered_fails_cleanly() {
    let mut rig = Rig::new();
    rig.run_usb("G92 X0 Y0 Z0");
    rig.platform.z_probe = EndStopHit::LowHit;
    rig.run_usb("G30");
    assert!(rig.usb_idle());
    assert!(rig
        .host_text()
        .contains("Z probe already triggered at start of probing move"));
}

#[test]
fn g30_at_point_records_an_error_instead_of_hanging() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_usb("M557 P0 X30 Y30");
    rig.platform.z_probe = EndStopHit::LowHit;
    rig.gcodes.push_bytes(CodeSource::Usb, b"G30 P0\n");
    rig.spin_n(100);

    assert!(rig.usb_idle());
    assert!(rig.planner.probe_error(0));
}

#[test]
fn delta_moves_require_homing_and_respect_the_envelope() {
    let mut rig = Rig::new();
    rig.planner.geometry = MachineGeometry::Delta;
    rig.planner.print_radius = 100.0;

    rig.run_usb("G1 X10");
    assert!(rig
        .host_text()
        .contains("before homing the towers"));
    assert!(rig.planner.moves.is_empty());

    rig.home_via_g92();
    // Exactly on the print radius: passes through unchanged.
    rig.run_usb("G1 X100 Y0");
    assert_eq!(rig.planner.last_move().unwrap().coords[0], 100.0);
    // A little outside: scaled back onto the rim.
    rig.run_usb("G1 X100.2 Y0");
    let mv = rig.planner.last_move().unwrap();
    assert!((mv.coords[0] - 100.0).abs() < 1e-3);
}

#[test]
fn tool_change_runs_the_macro_sequence() {
    let mut rig = Rig::new();
    rig.run_usb("M563 P0 D0 H1");
    rig.platform.add_file("0:/sys", "tpre0.g", "M117 pre\n");
    rig.platform.add_file("0:/sys", "tpost0.g", "M117 post\n");

    rig.run_usb("T0");
    rig.spin_n(64);
    assert_eq!(rig.gcodes.current_tool(), Some(0));
    assert_eq!(rig.gcodes.display_message(), "post");
    assert!(rig.usb_idle());
}

#[test]
fn tool_change_with_s0_skips_the_macros() {
    let mut rig = Rig::new();
    rig.run_usb("M563 P0 D0 H1");
    rig.platform.add_file("0:/sys", "tpost0.g", "M117 post\n");
    rig.run_usb("T0 S0");
    assert_eq!(rig.gcodes.current_tool(), Some(0));
    assert_eq!(rig.gcodes.display_message(), "");
}

#[test]
fn trigger_macro_runs_on_the_daemon_channel() {
    let mut rig = Rig::new();
    rig.platform.add_file("0:/sys", "trigger2.g", "M117 triggered\n");
    rig.run_usb("M581 T2 X S1");

    rig.platform.endstops = 0b001; // rising edge on X
    rig.spin_n(32);
    assert_eq!(rig.gcodes.display_message(), "triggered");
    // The USB channel was never involved.
    assert!(rig.usb_idle());
}

#[test]
fn trigger_zero_is_an_emergency_stop() {
    let mut rig = Rig::new();
    rig.run_usb("M581 T0 Y S1");
    rig.platform.endstops = 0b010;
    rig.spin_n(4);
    assert!(rig.heat.emergency_stopped);
    assert!(rig.platform.drives_enabled.iter().all(|e| !e));
}

#[test]
fn trigger_one_pauses_a_running_print() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_usb("M581 T1 Z S1 C1");

    let mut contents = String::new();
    for i in 1..=20 {
        contents.push_str(&format!("G1 X{} F600\n", i));
    }
    rig.platform.add_file("0:/gcodes", "part.gcode", &contents);
    rig.gcodes.push_bytes(CodeSource::Usb, b"M32 part.gcode\n");
    rig.spin_n(8);
    assert!(rig.monitor.printing);

    rig.platform.endstops = 0b100; // rising edge on Z input
    rig.spin_n(64);
    assert!(rig.gcodes.is_paused());
}

#[test]
fn bed_probing_uses_bed_macro_when_present() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.platform.add_file("0:/sys", "bed.g", "M117 levelling\n");
    rig.run_usb("G32");
    rig.spin_n(64);
    assert_eq!(rig.gcodes.display_message(), "levelling");
    assert!(rig.usb_idle());
}

#[test]
fn g32_probes_the_stored_points_without_a_macro() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.run_many(&[
        "M557 P0 X20 Y20",
        "M557 P1 X180 Y20",
        "M557 P2 X180 Y180",
        "M557 P3 X20 Y180",
    ]);
    rig.gcodes.push_bytes(CodeSource::Usb, b"G32\n");

    for _ in 0..600 {
        // The probe trips on every dive and is clear otherwise.
        let diving = rig
            .planner
            .last_move()
            .map(|m| m.endstops_to_check & Z_PROBE_ACTIVE != 0)
            .unwrap_or(false);
        rig.platform.z_probe = if diving { EndStopHit::LowHit } else { EndStopHit::NoStop };
        rig.spin();
        if rig.usb_idle() && rig.planner.moves.len() > 8 {
            break;
        }
    }

    assert!(rig.usb_idle());
    assert!(rig.host_text().contains("Bed equation fits points"));
    // Every stored point was visited.
    for (x, y) in [(20.0, 20.0), (180.0, 20.0), (180.0, 180.0), (20.0, 180.0)] {
        assert!(rig
            .planner
            .moves
            .iter()
            .any(|m| m.coords[0] == x && m.coords[1] == y));
    }
}
