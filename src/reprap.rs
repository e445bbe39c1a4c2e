// reprap_host_rust/src/reprap.rs

// Top-level owner. Holds the G-code executor and the collaborator
// subsystems, ticks them all from one cooperative loop and produces the
// composite status snapshots. Subsystems never hold pointers to each
// other; every tick borrows what it needs through a Context.

use crate::core_traits::{Context, Heat, MovePlanner, Platform, PrintMonitor};
use crate::gcode_buffer::CodeSource;
use crate::gcodes::GCodes;
use crate::{CONFIG_G, HEATERS};

pub struct RepRap {
    pub gcodes: GCodes,
    planner: Box<dyn MovePlanner>,
    heat: Box<dyn Heat>,
    platform: Box<dyn Platform>,
    print_monitor: Box<dyn PrintMonitor>,
    ticks: u64,
    heater_fault_reported: bool,
}

impl RepRap {
    pub fn new(
        planner: Box<dyn MovePlanner>,
        heat: Box<dyn Heat>,
        platform: Box<dyn Platform>,
        print_monitor: Box<dyn PrintMonitor>,
    ) -> Self {
        RepRap {
            gcodes: GCodes::new(),
            planner,
            heat,
            platform,
            print_monitor,
            ticks: 0,
            heater_fault_reported: false,
        }
    }

    fn context(&mut self) -> (&mut GCodes, Context<'_>) {
        (
            &mut self.gcodes,
            Context {
                planner: self.planner.as_mut(),
                heat: self.heat.as_mut(),
                platform: self.platform.as_mut(),
                print_monitor: self.print_monitor.as_mut(),
            },
        )
    }

    /// Set everything up and run config.g on the daemon channel, the way
    /// the machine configures itself at power-on.
    pub fn init(&mut self) {
        let (gcodes, mut ctx) = self.context();
        gcodes.init(&mut ctx);
        if ctx.platform.file_exists(crate::SYS_DIR, CONFIG_G) {
            let _ = gcodes.do_file_macro(CodeSource::Daemon, &mut ctx, CONFIG_G);
        }
        log::info!("RepRap started");
    }

    /// One pass of the cooperative main loop.
    pub fn spin(&mut self) {
        self.ticks += 1;
        self.watch_heaters();
        let (gcodes, mut ctx) = self.context();
        gcodes.check_triggers(&mut ctx);
        gcodes.spin(&mut ctx);
    }

    /// A heater fault abandons the print; the executor keeps servicing the
    /// other channels.
    fn watch_heaters(&mut self) {
        let faulted = (0..HEATERS).any(|h| self.heat.heater_fault(h));
        if !faulted {
            self.heater_fault_reported = false;
            return;
        }
        if !self.heater_fault_reported && self.print_monitor.is_printing() {
            log::error!("heater fault, cancelling print");
            let (gcodes, mut ctx) = self.context();
            gcodes.cancel_print(&mut ctx);
            self.heater_fault_reported = true;
        }
    }

    /// M112 from outside the command stream (e.g. the network layer spots
    /// it in a request before queueing).
    pub fn emergency_stop(&mut self) {
        let (gcodes, mut ctx) = self.context();
        gcodes.emergency_stop(&mut ctx);
    }

    /// Composite JSON status snapshot for the web interface.
    pub fn status_response(&mut self) -> String {
        let (gcodes, ctx) = self.context();
        gcodes.status_response(&ctx)
    }

    pub fn is_printing(&self) -> bool {
        self.print_monitor.is_printing()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Feed bytes into a channel, as the network/USB glue would.
    pub fn push_bytes(&mut self, source: CodeSource, bytes: &[u8]) {
        self.gcodes.push_bytes(source, bytes);
    }

    /// Run spin() until every channel is idle or `max_ticks` have elapsed.
    /// Handy for tests and for draining startup files.
    pub fn spin_until_idle(&mut self, max_ticks: u32) {
        for _ in 0..max_ticks {
            self.spin();
        }
    }

    pub fn planner(&self) -> &dyn MovePlanner {
        self.planner.as_ref()
    }

    pub fn planner_mut(&mut self) -> &mut dyn MovePlanner {
        self.planner.as_mut()
    }

    pub fn heat(&self) -> &dyn Heat {
        self.heat.as_ref()
    }

    pub fn heat_mut(&mut self) -> &mut dyn Heat {
        self.heat.as_mut()
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn platform_mut(&mut self) -> &mut dyn Platform {
        self.platform.as_mut()
    }

    pub fn print_monitor(&self) -> &dyn PrintMonitor {
        self.print_monitor.as_ref()
    }
}
