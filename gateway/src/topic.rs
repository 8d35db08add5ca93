use crate::model::StationId;

/// Where an inbound message should go, decided from its topic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Telemetry,
    CommandResponse,
    Command,
    Other,
}

/// Checks a concrete topic against a subscription pattern.
///
/// `+` matches exactly one segment and `#` matches everything from its
/// position onwards. Segment counts must agree unless a `#` is reached.
pub fn matches(actual: &str, pattern: &str) -> bool {
    let mut actual_segments = actual.split('/');
    let mut pattern_segments = pattern.split('/');

    loop {
        match (actual_segments.next(), pattern_segments.next()) {
            (_, Some("#")) => return true,
            (Some(_), Some("+")) => {}
            (Some(a), Some(p)) if a == p => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn classify(topic: &str) -> Route {
    if topic.ends_with("/command/response") {
        Route::CommandResponse
    } else if topic.ends_with("/command") {
        Route::Command
    } else if topic.ends_with("/data") || topic.ends_with("/telemetry") {
        Route::Telemetry
    } else {
        Route::Other
    }
}

pub fn telemetry_topic(station_id: StationId) -> String {
    format!("devices/{}/data", station_id)
}

pub fn serial_telemetry_topic(serial_code: &str) -> String {
    format!("station/{}/telemetry", serial_code)
}

pub fn command_topic(serial_code: &str) -> String {
    format!("station/{}/command", serial_code)
}

pub fn command_response_topic(serial_code: &str) -> String {
    format!("station/{}/command/response", serial_code)
}
