use crate::caps::{CapsControl, CapsQuery, CapsSource};
use alsa::ctl::{ElemId, ElemIface};
use alsa::hctl::HCtl;
use std::ffi::CString;

/// Reads HDMI sink capabilities from the codec's mixer controls.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaCapsSource;

impl CapsSource for AlsaCapsSource {
    fn open(&self, card: u32) -> Result<Box<dyn CapsQuery>, String> {
        let name = format!("hw:{card}");
        let hctl = HCtl::new(&name, false)
            .map_err(|e| format!("Failed to open ALSA control '{name}': {e}"))?;
        hctl.load()
            .map_err(|e| format!("Failed to load ALSA controls on '{name}': {e}"))?;
        Ok(Box::new(AlsaCapsQuery { hctl, name }))
    }
}

struct AlsaCapsQuery {
    hctl: HCtl,
    name: String,
}

fn elem_id(ctl: CapsControl) -> Result<ElemId, String> {
    let cname = CString::new(ctl.name()).map_err(|e| e.to_string())?;
    let mut id = ElemId::new(ElemIface::Mixer);
    id.set_name(&cname);
    Ok(id)
}

impl CapsQuery for AlsaCapsQuery {
    fn read(&mut self, ctl: CapsControl) -> Result<i32, String> {
        let id = elem_id(ctl)?;
        let elem = self
            .hctl
            .find_elem(&id)
            .ok_or_else(|| format!("Control '{}' not found on {}", ctl.name(), self.name))?;
        let value = elem
            .read()
            .map_err(|e| format!("Failed to read '{}' on {}: {e}", ctl.name(), self.name))?;
        value
            .get_integer(0)
            .ok_or_else(|| format!("Control '{}' is not an integer", ctl.name()))
    }

    fn write(&mut self, ctl: CapsControl, v: i32) -> Result<(), String> {
        let id = elem_id(ctl)?;
        let elem = self
            .hctl
            .find_elem(&id)
            .ok_or_else(|| format!("Control '{}' not found on {}", ctl.name(), self.name))?;
        let mut value = elem
            .read()
            .map_err(|e| format!("Failed to read '{}' on {}: {e}", ctl.name(), self.name))?;
        value
            .set_integer(0, v)
            .ok_or_else(|| format!("Control '{}' is not an integer", ctl.name()))?;
        elem.write(&value)
            .map_err(|e| format!("Failed to write '{}' on {}: {e}", ctl.name(), self.name))?;
        Ok(())
    }
}
