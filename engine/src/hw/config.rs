pub const LOG_ENV: &str = "HDMI_HAL_LOG";
pub const BACKEND_ENV: &str = "HDMI_HAL_BACKEND";
pub const CAPTURE_DIR_ENV: &str = "HDMI_HAL_CAPTURE_DIR";
pub const HOTPLUG_DISABLE_ENV: &str = "HDMI_HAL_NO_HOTPLUG";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

pub fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
