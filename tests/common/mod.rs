// Shared test rig: the executor wired to simulated collaborators, with a
// capture sink on the USB reply path.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use reprap_host_rust::core_traits::Context;
use reprap_host_rust::gcode_buffer::CodeSource;
use reprap_host_rust::gcodes::GCodes;
use reprap_host_rust::reply::MessageType;
use reprap_host_rust::test_utils::{
    CaptureSink, SimHeat, SimPlanner, SimPlatform, SimPrintMonitor,
};

pub struct Rig {
    pub gcodes: GCodes,
    pub planner: SimPlanner,
    pub heat: SimHeat,
    pub platform: SimPlatform,
    pub monitor: SimPrintMonitor,
    pub host: Rc<RefCell<Vec<String>>>,
}

impl Rig {
    pub fn new() -> Rig {
        let mut gcodes = GCodes::new();
        let (sink, host) = CaptureSink::new(MessageType::Host);
        gcodes.add_reply_sink(Box::new(sink));
        let mut rig = Rig {
            gcodes,
            planner: SimPlanner::new(),
            heat: SimHeat::new(),
            platform: SimPlatform::new(),
            monitor: SimPrintMonitor::new(),
            host,
        };
        {
            let Rig { gcodes, planner, heat, platform, monitor, .. } = &mut rig;
            let mut ctx = Context {
                planner,
                heat,
                platform,
                print_monitor: monitor,
            };
            gcodes.init(&mut ctx);
        }
        rig
    }

    pub fn spin(&mut self) {
        let Rig { gcodes, planner, heat, platform, monitor, .. } = self;
        let mut ctx = Context {
            planner,
            heat,
            platform,
            print_monitor: monitor,
        };
        gcodes.check_triggers(&mut ctx);
        gcodes.spin(&mut ctx);
    }

    pub fn spin_n(&mut self, n: usize) {
        for _ in 0..n {
            self.spin();
        }
    }

    /// Feed one line on the USB channel and give it plenty of ticks.
    pub fn run_usb(&mut self, line: &str) {
        self.gcodes.push_bytes(CodeSource::Usb, line.as_bytes());
        self.gcodes.push_bytes(CodeSource::Usb, b"\n");
        self.spin_n(64);
    }

    pub fn run_many(&mut self, lines: &[&str]) {
        for line in lines {
            self.run_usb(line);
        }
    }

    pub fn host_text(&self) -> String {
        self.host.borrow().join("")
    }

    pub fn clear_host(&mut self) {
        self.host.borrow_mut().clear();
    }

    /// Mark all axes homed the way a host script would.
    pub fn home_via_g92(&mut self) {
        self.run_usb("G92 X0 Y0 Z0");
    }

    /// Define tool 0 (extruder drive 0, heater 1) and select it without
    /// running the change macros.
    pub fn define_tool0(&mut self) {
        self.run_usb("M563 P0 D0 H1");
        self.run_usb("T0 S0");
    }

    pub fn usb_idle(&self) -> bool {
        self.gcodes.channel_idle(CodeSource::Usb)
    }
}

/// Frame a line with the N line number and trailing XOR checksum.
pub fn with_checksum(n: i32, body: &str) -> String {
    let framed = format!("N{} {}", n, body);
    let cs = framed.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{}*{}\n", framed, cs)
}
