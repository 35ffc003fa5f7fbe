pub const HW_PROFILE_ENV: &str = "RTPORT_HW_PROFILE";
pub const NO_RT_ENV: &str = "RTPORT_NO_RT";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    let s = value.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "yes" || s == "on"
}

pub fn profile_enabled() -> bool {
    env_flag(HW_PROFILE_ENV)
}

pub fn realtime_disabled() -> bool {
    env_flag(NO_RT_ENV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for v in ["1", "true", " YES ", "On"] {
            assert!(parse_flag(v), "{v}");
        }
        for v in ["", "0", "off", "nope"] {
            assert!(!parse_flag(v), "{v}");
        }
    }
}
