use std::fmt;

pub const KEY_HDMI_ALLOWED: &str = "hdmi-allowed";
pub const KEY_HDMI_DELAY_COMP: &str = "hdmi-delay-compensation";
pub const KEY_HDMI_OUTPUT_FIXED: &str = "hdmi-output-fixed";
pub const KEY_HDMI_FIXED_LEVEL: &str = "hdmi-fixed-level";
pub const KEY_VIDEO_DELAY_COMP: &str = "video-delay-compensation";
pub const KEY_ROUTING: &str = "routing";
pub const KEY_SUPPORTED_SAMPLE_RATES: &str = "supported-sample-rates";
pub const KEY_SUPPORTED_FORMATS: &str = "supported-formats";
pub const KEY_SUPPORTED_CHANNEL_MASKS: &str = "supported-channel-masks";
pub const KEY_INPUT_SOURCE: &str = "input-source";
pub const KEY_FORCE: &str = "force";
pub const KEY_ADDRESS: &str = "address";

/// Ordered `key=value;key=value` list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    pairs: Vec<(String, String)>,
}

impl Parameters {
    pub fn parse(kv_pairs: &str) -> Self {
        let mut params = Self::default();
        for item in kv_pairs.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((k, v)) => params.add(k.trim(), v.trim()),
                None => params.add(item, ""),
            }
        }
        params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(idx).1)
    }

    pub fn add(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}
