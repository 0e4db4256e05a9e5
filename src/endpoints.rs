//! Canonical broker key/topic names (component A), grounded verbatim on
//! `bec_utils/endpoints.py::MessageEndpoints`. Every producer and every
//! consumer must derive the same string from the same ID, so these are
//! plain functions rather than a trait any module could reimplement
//! slightly differently.

/// Endpoints under the `internal/devices/*` namespace.
pub mod devices {
    pub fn status(dev: &str) -> String {
        format!("internal/devices/status/{dev}")
    }

    pub fn read(dev: &str) -> String {
        format!("internal/devices/read/{dev}")
    }

    pub fn readback(dev: &str) -> String {
        format!("internal/devices/readback/{dev}")
    }

    pub fn req_status(dev: &str) -> String {
        format!("internal/devices/req_status/{dev}")
    }

    pub fn instructions() -> String {
        "internal/devices/instructions".to_string()
    }

    pub fn rpc(rpc_id: &str) -> String {
        format!("internal/devices/rpc/{rpc_id}")
    }

    pub fn config() -> String {
        "internal/devices/config".to_string()
    }

    pub fn config_request() -> String {
        "internal/devices/config_request".to_string()
    }

    pub fn config_update() -> String {
        "internal/devices/config_update".to_string()
    }

    pub fn info(dev: &str) -> String {
        format!("internal/devices/info/{dev}")
    }
}

/// Endpoints under the `internal/queue/*` namespace.
pub mod queue {
    pub fn request() -> String {
        "internal/queue/queue_request".to_string()
    }

    pub fn request_response() -> String {
        "internal/queue/queue_request_response".to_string()
    }

    pub fn status() -> String {
        "internal/queue/queue_status".to_string()
    }

    pub fn modification_request() -> String {
        "internal/queue/queue_modification_request".to_string()
    }

    pub fn insert() -> String {
        "internal/queue/queue_insert".to_string()
    }
}

/// Endpoints under the `scans/*` namespace.
pub mod scans {
    pub fn status() -> String {
        "scans/scan_status".to_string()
    }

    pub fn segment() -> String {
        "scans/scan_segment".to_string()
    }

    pub fn available_scans() -> String {
        "scans/available_scans".to_string()
    }
}

/// `public/<scanID>/*` endpoints, consumed by durable readers outside the
/// fabric (e.g. the file-writer sink's own published artifacts).
pub mod public {
    pub fn file(scan_id: &str, name: &str) -> String {
        format!("public/{scan_id}/file/{name}")
    }

    pub fn file_pattern(scan_id: &str) -> String {
        format!("public/{scan_id}/file/*")
    }

    pub fn baseline(scan_id: &str) -> String {
        format!("public/{scan_id}/baseline")
    }
}

/// Async readback stream per device per scan.
pub fn device_async_readback(scan_id: &str, dev: &str) -> String {
    format!("device_async_readback/{scan_id}/{dev}")
}

pub fn alarms() -> String {
    "internal/alarms".to_string()
}

pub fn log() -> String {
    "internal/log".to_string()
}

pub fn service_status(svc: &str) -> String {
    format!("internal/services/status/{svc}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_endpoints_are_deterministic() {
        assert_eq!(devices::status("samx"), devices::status("samx"));
        assert_eq!(devices::status("samx"), "internal/devices/status/samx");
        assert_eq!(devices::readback("samy"), "internal/devices/readback/samy");
    }

    #[test]
    fn static_endpoints_have_no_trailing_id_slot() {
        assert_eq!(queue::status(), "internal/queue/queue_status");
        assert_eq!(scans::available_scans(), "scans/available_scans");
    }

    #[test]
    fn public_file_pattern_matches_glob_used_by_writer() {
        let scan_id = "abc-123";
        assert_eq!(public::file_pattern(scan_id), "public/abc-123/file/*");
        assert_eq!(public::file(scan_id, "master"), "public/abc-123/file/master");
    }
}
