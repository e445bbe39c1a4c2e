// reprap_host_rust/src/tools.rs

// Tool definitions: a tool groups extruder drives, heaters, an XYZ offset
// and an optional mixing ratio. Tools are created by M563, selected by Tn,
// and their heater temperatures are managed through the Heat collaborator.

use crate::core_traits::Heat;
use crate::{AXES, DRIVES, HEATERS};

#[derive(Debug, Clone)]
pub struct Tool {
    number: i32,
    /// Extruder drive numbers (0-based, relative to the first extruder).
    drives: Vec<usize>,
    heaters: Vec<usize>,
    active_temperatures: Vec<f32>,
    standby_temperatures: Vec<f32>,
    offset: [f32; AXES],
    /// Mix ratio per drive when mixing is enabled (M567/M568).
    mix: Vec<f32>,
    mixing: bool,
    /// Axes driven by a commanded X coordinate. Bit 0 is the X axis itself.
    x_axis_map: u32,
}

impl Tool {
    pub fn new(number: i32, drives: Vec<usize>, heaters: Vec<usize>) -> Self {
        let drive_count = drives.len();
        let heater_count = heaters.len();
        Tool {
            number,
            drives,
            heaters,
            active_temperatures: vec![0.0; heater_count],
            standby_temperatures: vec![0.0; heater_count],
            offset: [0.0; AXES],
            mix: if drive_count > 0 {
                let mut m = vec![0.0; drive_count];
                m[0] = 1.0;
                m
            } else {
                Vec::new()
            },
            mixing: false,
            x_axis_map: 1,
        }
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    /// Translate a tool-relative extruder index to its drive number.
    pub fn drive(&self, i: usize) -> usize {
        self.drives[i]
    }

    pub fn heater_count(&self) -> usize {
        self.heaters.len()
    }

    pub fn heater(&self, i: usize) -> usize {
        self.heaters[i]
    }

    pub fn offset(&self) -> &[f32; AXES] {
        &self.offset
    }

    pub fn set_offset(&mut self, offset: [f32; AXES]) {
        self.offset = offset;
    }

    pub fn mixing(&self) -> bool {
        self.mixing
    }

    pub fn set_mixing(&mut self, on: bool) {
        self.mixing = on;
    }

    pub fn mix(&self) -> &[f32] {
        &self.mix
    }

    pub fn set_mix(&mut self, mix: &[f32]) {
        let n = self.mix.len().min(mix.len());
        self.mix[..n].copy_from_slice(&mix[..n]);
    }

    pub fn x_axis_map(&self) -> u32 {
        self.x_axis_map
    }

    pub fn set_x_axis_map(&mut self, map: u32) {
        self.x_axis_map = if map == 0 { 1 } else { map };
    }

    pub fn active_temperature(&self, i: usize) -> f32 {
        self.active_temperatures[i]
    }

    pub fn standby_temperature(&self, i: usize) -> f32 {
        self.standby_temperatures[i]
    }

    pub fn set_temperatures(&mut self, standby: &[f32], active: &[f32]) {
        let n = self.heaters.len();
        self.standby_temperatures[..n.min(standby.len())]
            .copy_from_slice(&standby[..n.min(standby.len())]);
        self.active_temperatures[..n.min(active.len())]
            .copy_from_slice(&active[..n.min(active.len())]);
    }

    /// Set every heater of this tool to the same active temperature (M104).
    pub fn set_all_active(&mut self, temperature: f32) {
        for t in self.active_temperatures.iter_mut() {
            *t = temperature;
        }
    }

    /// True if any of this tool's heaters is the bed heater; such a tool is
    /// never picked as "the only tool" for an untargeted M104.
    fn uses_heater(&self, heater: usize) -> bool {
        self.heaters.contains(&heater)
    }

    fn push_targets(&self, heat: &mut dyn Heat) {
        for (i, &h) in self.heaters.iter().enumerate() {
            if h < HEATERS {
                heat.set_active_temperature(h, self.active_temperatures[i]);
                heat.set_standby_temperature(h, self.standby_temperatures[i]);
            }
        }
    }
}

/// All defined tools plus the current selection.
pub struct ToolRack {
    tools: Vec<Tool>,
    current: Option<i32>,
}

impl ToolRack {
    pub fn new() -> Self {
        ToolRack { tools: Vec::new(), current: None }
    }

    pub fn add(&mut self, tool: Tool) -> bool {
        if self.get(tool.number).is_some() {
            return false;
        }
        self.tools.push(tool);
        self.tools.sort_by_key(|t| t.number);
        true
    }

    pub fn delete(&mut self, number: i32) -> bool {
        if self.current == Some(number) {
            self.current = None;
        }
        let before = self.tools.len();
        self.tools.retain(|t| t.number != number);
        self.tools.len() != before
    }

    pub fn get(&self, number: i32) -> Option<&Tool> {
        self.tools.iter().find(|t| t.number == number)
    }

    pub fn get_mut(&mut self, number: i32) -> Option<&mut Tool> {
        self.tools.iter_mut().find(|t| t.number == number)
    }

    pub fn current_number(&self) -> Option<i32> {
        self.current
    }

    pub fn current_tool(&self) -> Option<&Tool> {
        self.current.and_then(|n| self.get(n))
    }

    pub fn current_tool_mut(&mut self) -> Option<&mut Tool> {
        let n = self.current?;
        self.get_mut(n)
    }

    /// The lone tool not using the bed heater, if exactly one exists. Used
    /// when M104 arrives with no tool selected and no T parameter.
    pub fn only_tool(&self, bed_heater: Option<usize>) -> Option<&Tool> {
        let mut found = None;
        for tool in &self.tools {
            let is_bed_tool = bed_heater.map_or(false, |bh| tool.uses_heater(bh));
            if !is_bed_tool {
                if found.is_some() {
                    return None;
                }
                found = Some(tool);
            }
        }
        found
    }

    /// Make `number` the current tool: its heaters go to their active
    /// temperatures. Selecting an unknown number deselects all tools.
    pub fn select(&mut self, number: i32, heat: &mut dyn Heat) {
        match self.get(number) {
            Some(tool) => {
                tool.push_targets(heat);
                for &h in &tool.heaters {
                    heat.activate(h);
                }
                self.current = Some(number);
                log::info!("tool {} selected", number);
            }
            None => {
                self.current = None;
            }
        }
    }

    /// Put a tool's heaters on standby (tool released).
    pub fn standby(&mut self, number: i32, heat: &mut dyn Heat) {
        if let Some(tool) = self.get(number) {
            tool.push_targets(heat);
            for &h in &tool.heaters {
                heat.standby(h);
            }
        }
        if self.current == Some(number) {
            self.current = None;
        }
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.current = None;
    }

    /// One-line description for the T report and M563 queries.
    pub fn describe(&self, number: i32) -> String {
        match self.get(number) {
            Some(t) => {
                let drives: Vec<String> = t.drives.iter().map(|d| d.to_string()).collect();
                let heaters: Vec<String> = t.heaters.iter().map(|h| h.to_string()).collect();
                format!(
                    "Tool {} - drives: {}; heaters: {}; offsets: X{:.1} Y{:.1} Z{:.1}\n",
                    number,
                    drives.join(":"),
                    heaters.join(":"),
                    t.offset[0],
                    t.offset[1],
                    t.offset[2]
                )
            }
            None => format!("Tool {} does not exist\n", number),
        }
    }
}

impl Default for ToolRack {
    fn default() -> Self {
        Self::new()
    }
}

pub const FIRST_EXTRUDER_DRIVE: usize = AXES;
pub const MAX_EXTRUDERS: usize = DRIVES - AXES;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SimHeat;

    #[test]
    fn add_rejects_duplicate_numbers() {
        let mut rack = ToolRack::new();
        assert!(rack.add(Tool::new(0, vec![0], vec![1])));
        assert!(!rack.add(Tool::new(0, vec![1], vec![2])));
    }

    #[test]
    fn select_pushes_active_temperatures() {
        let mut rack = ToolRack::new();
        let mut tool = Tool::new(0, vec![0], vec![1]);
        tool.set_temperatures(&[150.0], &[210.0]);
        rack.add(tool);

        let mut heat = SimHeat::new();
        rack.select(0, &mut heat);
        assert_eq!(rack.current_number(), Some(0));
        assert_eq!(heat.active_temperature(1), 210.0);
        assert_eq!(heat.target(1), 210.0);
    }

    #[test]
    fn standby_releases_selection() {
        let mut rack = ToolRack::new();
        let mut tool = Tool::new(2, vec![0], vec![1]);
        tool.set_temperatures(&[160.0], &[200.0]);
        rack.add(tool);

        let mut heat = SimHeat::new();
        rack.select(2, &mut heat);
        rack.standby(2, &mut heat);
        assert_eq!(rack.current_number(), None);
        assert_eq!(heat.target(1), 160.0);
    }

    #[test]
    fn selecting_unknown_tool_deselects() {
        let mut rack = ToolRack::new();
        rack.add(Tool::new(0, vec![0], vec![1]));
        let mut heat = SimHeat::new();
        rack.select(0, &mut heat);
        rack.select(99, &mut heat);
        assert_eq!(rack.current_number(), None);
    }

    #[test]
    fn only_tool_ignores_bed_tools_and_requires_uniqueness() {
        let mut rack = ToolRack::new();
        rack.add(Tool::new(0, vec![], vec![0])); // bed "tool"
        rack.add(Tool::new(1, vec![0], vec![1]));
        assert_eq!(rack.only_tool(Some(0)).unwrap().number(), 1);

        rack.add(Tool::new(2, vec![1], vec![2]));
        assert!(rack.only_tool(Some(0)).is_none());
    }

    #[test]
    fn default_mix_feeds_first_drive() {
        let tool = Tool::new(0, vec![0, 1], vec![1]);
        assert_eq!(tool.mix(), &[1.0, 0.0]);
    }
}
