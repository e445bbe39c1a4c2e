// Pause/resume semantics: restore points, file rewind, fan snapshots,
// deferred-code purging and print cancellation.

mod common;

use common::Rig;
use reprap_host_rust::core_traits::MovePlanner;
use reprap_host_rust::gcode_buffer::CodeSource;

fn long_print_file() -> (String, u64) {
    // Twenty one-line moves; returns the contents and the byte offset of
    // the third line, which the planner will report as the rewind point.
    let mut contents = String::new();
    let mut third_line_offset = 0;
    for i in 1..=20 {
        if i == 3 {
            third_line_offset = contents.len() as u64;
        }
        contents.push_str(&format!("G1 X{} F600\n", i));
    }
    (contents, third_line_offset)
}

/// Start the print but only give it a handful of ticks, so it is still
/// running when the test interferes with it.
fn start_print(rig: &mut Rig, name: &str) {
    rig.gcodes
        .push_bytes(CodeSource::Usb, format!("M32 {}\n", name).as_bytes());
    rig.spin_n(8);
    assert!(rig.monitor.printing);
}

#[test]
fn external_pause_rewinds_and_resume_replays() {
    let mut rig = Rig::new();
    rig.home_via_g92();

    let (contents, rewind) = long_print_file();
    rig.platform.add_file("0:/gcodes", "part.gcode", &contents);
    rig.planner.pause_file_pos = rewind;
    rig.planner.live_movement = true;

    rig.run_usb("M106 S255");
    start_print(&mut rig, "part.gcode");

    rig.gcodes.push_bytes(CodeSource::Usb, b"M25\n");
    rig.spin_n(32);
    assert!(rig.gcodes.is_paused());
    assert!(rig.monitor.printing); // paused, not abandoned
    assert!(rig.planner.moves.len() < 20);

    // Something (a pause macro, the user) turns the fan off meanwhile.
    rig.platform.fans[0] = 0.0;
    let moves_at_pause = rig.planner.moves.len();

    rig.run_usb("M24");
    rig.spin_n(64);
    assert!(rig.gcodes.is_running());
    // The fan value came back with the restore point.
    assert!((rig.platform.fans[0] - 1.0).abs() < 1e-4);
    // The repositioning move went back to the captured coordinates.
    let reposition = rig.planner.moves[moves_at_pause];
    assert_eq!(
        reposition.coords[0],
        rig.planner.moves[moves_at_pause - 1].coords[0]
    );
    // The restored feed rate is the pre-pause modal one (600 mm/min).
    assert!((rig.planner.feed_rate - 10.0).abs() < 1e-3);

    // The print replays from the rewound line and runs to the end.
    rig.spin_n(600);
    assert_eq!(rig.planner.position[0], 20.0);
    assert!(!rig.monitor.printing);
    assert!(rig.planner.moves.iter().any(|m| m.coords[0] == 3.0));
}

#[test]
fn pause_purges_deferred_codes_for_abandoned_moves() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.planner.auto_complete = false;

    let mut contents = String::from("G1 X1 F600\nM106 S200\nG1 X2\n");
    for i in 3..=12 {
        contents.push_str(&format!("G1 X{}\n", i));
    }
    rig.platform.add_file("0:/gcodes", "part.gcode", &contents);
    start_print(&mut rig, "part.gcode");
    rig.spin_n(8);
    assert!(rig.planner.scheduled_moves_count() >= 2);
    assert_eq!(rig.platform.fans[0], 0.0);

    // Everything scheduled gets abandoned by the pause.
    rig.planner.pause_skipped_moves = 100;
    rig.planner.pause_file_pos = 0;
    rig.gcodes.push_bytes(CodeSource::Usb, b"M25\n");
    rig.spin_n(4);
    rig.planner.complete_all();
    rig.spin_n(32);
    assert!(rig.gcodes.is_paused());

    // The fan change must never fire now.
    rig.planner.complete_all();
    rig.spin_n(16);
    assert_eq!(rig.platform.fans[0], 0.0);
}

#[test]
fn in_file_pause_stops_exactly_at_the_command() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.platform.add_file("0:/gcodes", "part.gcode", "G1 X5 F600\nM226\nG1 X9\n");
    rig.gcodes.push_bytes(CodeSource::Usb, b"M32 part.gcode\n");
    rig.spin_n(32);

    assert!(rig.gcodes.is_paused());
    // The line after M226 has not run.
    assert_eq!(rig.planner.moves.len(), 1);
    assert_eq!(rig.planner.position[0], 5.0);

    rig.run_usb("M24");
    rig.spin_n(128);
    assert!(!rig.monitor.printing);
    assert_eq!(rig.planner.position[0], 9.0);
}

#[test]
fn pause_without_a_print_is_an_error() {
    let mut rig = Rig::new();
    rig.run_usb("M25");
    assert!(rig
        .host_text()
        .contains("Cannot pause print, because no file is being printed!"));
    assert!(rig.gcodes.is_running());
}

#[test]
fn resume_without_a_print_is_an_error() {
    let mut rig = Rig::new();
    rig.run_usb("M24");
    assert!(rig
        .host_text()
        .contains("Cannot resume print, because no print is in progress!"));
}

#[test]
fn stop_while_paused_cancels_the_print() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.define_tool0();
    rig.run_usb("M104 S210");

    let (contents, _) = long_print_file();
    rig.platform.add_file("0:/gcodes", "part.gcode", &contents);
    start_print(&mut rig, "part.gcode");
    rig.gcodes.push_bytes(CodeSource::Usb, b"M25\n");
    rig.spin_n(32);
    assert!(rig.gcodes.is_paused());

    rig.clear_host();
    rig.run_usb("M0");
    assert!(rig.host_text().contains("Print cancelled"));
    assert!(!rig.monitor.printing);
    assert!(rig.gcodes.is_running());
    assert_eq!(rig.heat.target(1), 0.0);
    assert!(rig.platform.drives_idle);
    assert_eq!(rig.platform.open_file_count(), 0);
}

#[test]
fn pause_macro_runs_on_the_pausing_channel() {
    let mut rig = Rig::new();
    rig.home_via_g92();
    rig.platform.add_file("0:/sys", "pause.g", "M117 parked\n");
    rig.platform.add_file("0:/sys", "resume.g", "M117 unparked\n");

    let (contents, _) = long_print_file();
    rig.platform.add_file("0:/gcodes", "part.gcode", &contents);
    rig.planner.live_movement = true;
    start_print(&mut rig, "part.gcode");

    rig.gcodes.push_bytes(CodeSource::Usb, b"M25\n");
    rig.spin_n(64);
    assert!(rig.gcodes.is_paused());
    assert_eq!(rig.gcodes.display_message(), "parked");

    rig.run_usb("M24");
    rig.spin_n(64);
    assert!(rig.gcodes.is_running());
    assert_eq!(rig.gcodes.display_message(), "unparked");
}
