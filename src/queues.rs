//! Logical queue names shared by every component.

/// Shared job queue; job workers compete for its messages.
pub const JOB: &str = "dips.worker.job";

pub const EVENT_STATUS: &str = "dips.event.status";
pub const EVENT_MESSAGE: &str = "dips.event.message";
pub const EVENT_VARIABLE: &str = "dips.event.variable";

/// Work queue for `service`; task workers compete for its messages.
pub fn task_request(service: &str) -> String {
    format!("dips.worker.task.{service}.request")
}

/// Result queue for `service`, demultiplexed by correlation id.
pub fn task_result(service: &str) -> String {
    format!("dips.worker.task.{service}.result")
}

#[cfg(test)]
mod tests {
    #[test]
    fn per_service_names() {
        assert_eq!(super::task_request("shell"), "dips.worker.task.shell.request");
        assert_eq!(super::task_result("shell"), "dips.worker.task.shell.result");
    }
}
