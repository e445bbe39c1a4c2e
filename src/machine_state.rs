// reprap_host_rust/src/machine_state.rs

// Per-channel stack of modal state. A frame is pushed when a macro file (or
// M120) suspends the current context and popped when it returns; the top
// frame is the state the executor currently runs under.

use crate::core_traits::FileHandle;
use crate::{DEFAULT_FEEDRATE, DRIVES, AXES, STACK};

/// Executor sub-state of one channel. `Normal` fetches and runs commands;
/// every other variant is one step of a multi-command sequence that advances
/// once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GCodeState {
    Normal,
    WaitingForMoveToComplete,
    Homing,
    SetBed1,
    SetBed2,
    ToolChange1,
    ToolChange2,
    ToolChange3,
    Pausing1,
    Pausing2,
    Resuming1,
    Resuming2,
    Resuming3,
    Flashing1,
    Flashing2,
    Stopping,
    Sleeping,
}

/// One stack frame: the executor sub-state plus the modal flags that macros
/// must not leak back to their caller.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub state: GCodeState,
    /// File whose bytes this frame is executing, if any. Closing it is the
    /// job of whoever pops the frame.
    pub file: Option<FileHandle>,
    pub feed_rate: f32,
    pub drives_relative: bool,
    pub axes_relative: bool,
    pub doing_file_macro: bool,
    /// Resources already held when this frame was pushed. UnlockAll leaves
    /// these alone so a macro cannot release its caller's locks.
    pub locked_resources: u32,
    /// Raw extruder positions at push time, restored on pop so absolute-E
    /// bookkeeping survives nested macros.
    pub extruder_positions: [f32; DRIVES - AXES],
}

impl MachineState {
    fn initial() -> Self {
        MachineState {
            state: GCodeState::Normal,
            file: None,
            feed_rate: DEFAULT_FEEDRATE,
            drives_relative: true,
            axes_relative: false,
            doing_file_macro: false,
            locked_resources: 0,
            extruder_positions: [0.0; DRIVES - AXES],
        }
    }
}

/// Bounded stack of frames for one channel. The bottom frame always exists.
pub struct MachineStateStack {
    frames: Vec<MachineState>,
}

impl MachineStateStack {
    pub fn new() -> Self {
        MachineStateStack { frames: vec![MachineState::initial()] }
    }

    /// Reset to a single frame with default modal state. Returns any files
    /// the discarded frames still owned so the caller can close them.
    pub fn reset(&mut self) -> Vec<FileHandle> {
        let files = self.frames.iter().filter_map(|f| f.file).collect();
        self.frames.clear();
        self.frames.push(MachineState::initial());
        files
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current(&self) -> &MachineState {
        self.frames.last().expect("stack always has a base frame")
    }

    pub fn current_mut(&mut self) -> &mut MachineState {
        self.frames.last_mut().expect("stack always has a base frame")
    }

    /// Copy the current frame and make the copy current. The new frame owns
    /// no file and starts in `Normal`; the caller reports an error on
    /// overflow rather than recursing.
    pub fn push(&mut self) -> bool {
        if self.frames.len() >= STACK {
            return false;
        }
        let mut frame = self.current().clone();
        frame.file = None;
        frame.state = GCodeState::Normal;
        self.frames.push(frame);
        true
    }

    /// Drop the top frame and return it (for file close and lock release).
    /// Fails on the base frame.
    pub fn pop(&mut self) -> Option<MachineState> {
        if self.frames.len() <= 1 {
            return None;
        }
        self.frames.pop()
    }

    /// The file the channel is currently reading from, if any frame holds
    /// one. The top-most open file wins: a macro suspends the print file.
    pub fn reading_file(&self) -> Option<FileHandle> {
        self.frames.iter().rev().find_map(|f| f.file)
    }
}

impl Default for MachineStateStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_frame_defaults() {
        let stack = MachineStateStack::new();
        assert_eq!(stack.depth(), 1);
        let s = stack.current();
        assert!(s.drives_relative);
        assert!(!s.axes_relative);
        assert_eq!(s.state, GCodeState::Normal);
    }

    #[test]
    fn push_copies_modal_flags_but_not_file() {
        let mut stack = MachineStateStack::new();
        stack.current_mut().axes_relative = true;
        stack.current_mut().file = Some(7);
        assert!(stack.push());
        assert_eq!(stack.depth(), 2);
        assert!(stack.current().axes_relative);
        assert!(stack.current().file.is_none());
    }

    #[test]
    fn pop_restores_callers_modal_state() {
        let mut stack = MachineStateStack::new();
        stack.current_mut().feed_rate = 42.0;
        assert!(stack.push());
        stack.current_mut().feed_rate = 99.0;
        stack.current_mut().axes_relative = true;
        let popped = stack.pop().unwrap();
        assert_eq!(popped.feed_rate, 99.0);
        assert_eq!(stack.current().feed_rate, 42.0);
        assert!(!stack.current().axes_relative);
    }

    #[test]
    fn push_at_limit_fails_without_allocating() {
        let mut stack = MachineStateStack::new();
        for _ in 1..STACK {
            assert!(stack.push());
        }
        assert_eq!(stack.depth(), STACK);
        assert!(!stack.push());
        assert_eq!(stack.depth(), STACK);
    }

    #[test]
    fn pop_fails_on_base_frame() {
        let mut stack = MachineStateStack::new();
        assert!(stack.pop().is_none());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn reading_file_prefers_macro_over_print() {
        let mut stack = MachineStateStack::new();
        stack.current_mut().file = Some(1); // print file
        assert!(stack.push());
        assert_eq!(stack.reading_file(), Some(1));
        stack.current_mut().file = Some(2); // macro file
        assert_eq!(stack.reading_file(), Some(2));
        stack.pop();
        assert_eq!(stack.reading_file(), Some(1));
    }

    #[test]
    fn reset_reports_open_files() {
        let mut stack = MachineStateStack::new();
        stack.current_mut().file = Some(3);
        stack.push();
        stack.current_mut().file = Some(4);
        let files = stack.reset();
        assert_eq!(files, vec![3, 4]);
        assert_eq!(stack.depth(), 1);
        assert!(stack.current().file.is_none());
    }
}
