pub fn backend_open_error(backend: &str, direction: &str, device: &str, err: impl std::fmt::Display) -> String {
    format!("Failed to open {backend} {direction} '{device}': {err}")
}

pub fn backend_io_error(backend: &str, direction: &str, err: impl std::fmt::Display) -> String {
    format!("{backend} {direction} io error: {err}")
}

pub fn backend_rw_error(backend: &str, direction: &str, op: &str, err: impl std::fmt::Display) -> String {
    format!("{backend} {direction} {op} failed: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_backend_and_direction() {
        assert_eq!(
            backend_open_error("ALSA", "capture", "hw:1", "busy"),
            "Failed to open ALSA capture 'hw:1': busy"
        );
        assert_eq!(
            backend_rw_error("ALSA", "playback", "write", "EPIPE"),
            "ALSA playback write failed: EPIPE"
        );
    }
}
