// The top-level orchestrator: boot-time config.g, emergency stop and the
// composite status snapshot.

use reprap_host_rust::core_traits::Platform;
use reprap_host_rust::gcode_buffer::CodeSource;
use reprap_host_rust::reprap::RepRap;
use reprap_host_rust::test_utils::{SimHeat, SimPlanner, SimPlatform, SimPrintMonitor};

fn machine_with_config(config: &str) -> RepRap {
    let mut platform = SimPlatform::new();
    platform.add_file("0:/sys", "config.g", config);
    let mut reprap = RepRap::new(
        Box::new(SimPlanner::new()),
        Box::new(SimHeat::new()),
        Box::new(platform),
        Box::new(SimPrintMonitor::new()),
    );
    reprap.init();
    reprap
}

#[test]
fn boot_runs_config_on_the_daemon_channel() {
    let mut reprap = machine_with_config("M550 PTestBed\nM117 booted\n");
    reprap.spin_until_idle(64);

    assert_eq!(reprap.gcodes.display_message(), "booted");
    assert_eq!(reprap.platform().machine_name(), "TestBed");
    assert_eq!(reprap.gcodes.stack_depth(CodeSource::Daemon), 1);
}

#[test]
fn commands_flow_through_the_channels() {
    let mut reprap = machine_with_config("");
    reprap.spin_until_idle(16);
    reprap.push_bytes(CodeSource::Usb, b"G92 X0 Y0 Z0\nG1 X12 F1200\n");
    reprap.spin_until_idle(64);
    assert!(reprap.gcodes.axis_is_homed(0));
    let status = reprap.status_response();
    assert!(status.contains("\"status\":\"I\""));
    assert!(status.contains("\"pos\":[12.0,0.0,0.0]"));
}

#[test]
fn emergency_stop_is_observable_in_the_snapshot() {
    let mut reprap = machine_with_config("");
    reprap.spin_until_idle(16);
    reprap.emergency_stop();
    assert!(reprap.gcodes.is_emergency_stopped());
    let status = reprap.status_response();
    assert!(status.contains("\"status\":\"H\""));
}
