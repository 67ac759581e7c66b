//! State vocabulary shared by stores, controls and the hub.

pub const ON: &str = "on";
pub const OFF: &str = "off";
pub const OPEN: &str = "open";
pub const CLOSED: &str = "closed";

/// Opposite of a binary switch state. Anything other than `"on"` toggles to `"on"`.
pub fn toggled(state: &str) -> &'static str {
    if state == ON {
        OFF
    } else {
        ON
    }
}

/// Map the power tokens receivers report onto `"on"`/`"off"`.
pub fn normalize_power(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "online" => Some(ON),
        "off" | "0" | "false" | "offline" | "standby" => Some(OFF),
        _ => None,
    }
}

/// Curtain position implied by the last command sent to it.
pub fn curtain_state_for(action: &str) -> Option<&'static str> {
    match action {
        "open" => Some(OPEN),
        "close" => Some(CLOSED),
        _ => None,
    }
}
